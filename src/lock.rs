//! Advisory byte-range locks at fixed offsets.
//!
//! Chain locks are 1-byte fcntl ranges over the bucket-head words; the
//! allocation lock sits on the free-list head. fcntl locks do not nest
//! within a process, so each chain keeps a counter: the first acquisition
//! takes the real lock, nested ones bump the count, and the last release
//! drops it. Record locks live at the record's own offset and are the
//! mechanism that makes traversal safe against deletion.

use std::os::unix::io::AsRawFd;

use log::{debug, error};

use crate::error::{Error, ErrorKind, Result};
use crate::layout::{key_hash, lock_off};
use crate::{Flags, Tdb};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockType {
    Read,
    Write,
}

impl LockType {
    fn as_fcntl(self) -> i32 {
        match self {
            LockType::Read => libc::F_RDLCK as i32,
            LockType::Write => libc::F_WRLCK as i32,
        }
    }
}

impl Tdb {
    /// Lock or unlock one byte at `offset`. `wait` blocks until granted;
    /// `probe` suppresses logging for attempts that are allowed to fail.
    pub(crate) fn brlock(&mut self, offset: u32, l_type: i32, wait: bool, probe: bool) -> Result<()> {
        if self.flags.contains(Flags::NOLOCK) {
            return Ok(());
        }
        if self.read_only {
            return Err(Error::Lock);
        }
        let fd = match self.file.as_ref() {
            Some(f) => f.as_raw_fd(),
            None => return Err(Error::Lock),
        };

        let fl = libc::flock {
            l_type: l_type as libc::c_short,
            l_whence: libc::SEEK_SET as libc::c_short,
            l_start: offset as libc::off_t,
            l_len: 1,
            l_pid: 0,
        };
        let cmd = if wait { libc::F_SETLKW } else { libc::F_SETLK };
        if unsafe { libc::fcntl(fd, cmd, &fl) } == -1 {
            if !probe {
                let err = std::io::Error::last_os_error();
                debug!("brlock failed at offset {offset} l_type={l_type}: {err}");
            }
            self.ecode = ErrorKind::Lock;
            return Err(Error::Lock);
        }
        Ok(())
    }

    /// Lock chain `list`; list -1 is the allocation lock.
    pub(crate) fn lock(&mut self, list: i32, ltype: LockType) -> Result<()> {
        if list < -1 || list >= self.header.hash_size as i32 {
            error!("invalid list {list} for lock");
            return Err(Error::Lock);
        }
        if self.flags.contains(Flags::NOLOCK) {
            return Ok(());
        }

        let idx = (list + 1) as usize;
        if self.locked[idx] == 0 {
            if !self.read_only && self.header.rwlocks != 0 {
                // File built with a spin-lock array; this build only
                // speaks fcntl.
                error!("spin-lock array present; cannot lock list {list}");
                return Err(Error::Lock);
            }
            if let Err(e) = self.brlock(lock_off(list), ltype.as_fcntl(), true, false) {
                error!("lock failed on list {list}");
                return Err(e);
            }
        }
        self.locked[idx] += 1;
        Ok(())
    }

    /// Release one nesting level of chain `list`; the last release drops
    /// the file lock. Too late for errors here.
    pub(crate) fn unlock(&mut self, list: i32) {
        if self.flags.contains(Flags::NOLOCK) {
            return;
        }
        if list < -1 || list >= self.header.hash_size as i32 {
            return;
        }
        let idx = (list + 1) as usize;
        if self.locked[idx] == 0 {
            return;
        }
        if self.locked[idx] == 1 {
            let _ = self.brlock(lock_off(list), libc::F_UNLCK as i32, true, false);
        }
        self.locked[idx] -= 1;
    }

    /// Shared lock on a record: stops delete underneath a traverser.
    pub(crate) fn lock_record(&mut self, off: u32) -> Result<()> {
        if off == 0 {
            return Ok(());
        }
        self.brlock(off, libc::F_RDLCK as i32, true, false)
    }

    /// Non-blocking exclusive probe used by delete. A write lock would
    /// ride over our own fcntl read locks, so any record pinned by one of
    /// this handle's traversals refuses here first.
    pub(crate) fn write_lock_record(&mut self, off: u32) -> Result<()> {
        if self.travlocks.iter().any(|t| t.off == off) {
            return Err(Error::Lock);
        }
        self.brlock(off, libc::F_WRLCK as i32, false, true)
    }

    pub(crate) fn write_unlock_record(&mut self, off: u32) -> Result<()> {
        self.brlock(off, libc::F_UNLCK as i32, false, false)
    }

    /// Drop a traversal's shared record lock, unless another traversal in
    /// this handle still pins the same record.
    pub(crate) fn unlock_record(&mut self, off: u32) -> Result<()> {
        if off == 0 {
            return Ok(());
        }
        let holders = self.travlocks.iter().filter(|t| t.off == off).count();
        if holders == 1 {
            self.brlock(off, libc::F_UNLCK as i32, true, false)
        } else {
            Ok(())
        }
    }

    /// Lock the chain that owns `key`, letting the caller group several
    /// operations into one atomic sequence.
    pub fn chainlock(&mut self, key: &[u8]) -> Result<()> {
        let list = self.bucket(key_hash(key)) as i32;
        self.lock(list, LockType::Write)
    }

    pub fn chainunlock(&mut self, key: &[u8]) {
        let list = self.bucket(key_hash(key)) as i32;
        self.unlock(list);
    }

    /// Lock every chain, in ascending order. The allocation lock is left
    /// out, so allocators in other processes cannot deadlock against
    /// this.
    pub fn lockall(&mut self) -> Result<()> {
        if self.read_only {
            return self.fail(Error::Lock);
        }
        if self.lockedkeys.is_some() {
            return self.fail(Error::NoLock);
        }
        for i in 0..self.header.hash_size {
            if self.lock(i as i32, LockType::Write).is_err() {
                for j in 0..i {
                    self.unlock(j as i32);
                }
                return self.fail(Error::NoLock);
            }
        }
        Ok(())
    }

    pub fn unlockall(&mut self) {
        for i in 0..self.header.hash_size {
            self.unlock(i as i32);
        }
    }

    /// Restrict the handle to `keys`. Their buckets are locked in
    /// ascending bucket order; until `unlockkeys`, traversal and any
    /// operation on an undeclared key fail with `NoLock`.
    pub fn lockkeys(&mut self, keys: &[&[u8]]) -> Result<()> {
        if self.lockedkeys.is_some() {
            return self.fail(Error::NoLock);
        }
        let mut hashes: Vec<u32> = keys.iter().map(|k| key_hash(k)).collect();
        hashes.sort_unstable_by_key(|h| self.bucket(*h));

        for n in 0..hashes.len() {
            let list = self.bucket(hashes[n]) as i32;
            if self.lock(list, LockType::Write).is_err() {
                for h in &hashes[..n] {
                    let held = self.bucket(*h) as i32;
                    self.unlock(held);
                }
                return self.fail(Error::NoLock);
            }
        }
        self.lockedkeys = Some(hashes);
        Ok(())
    }

    /// Release the chains declared through `lockkeys`.
    pub fn unlockkeys(&mut self) {
        if let Some(hashes) = self.lockedkeys.take() {
            for h in hashes {
                let list = self.bucket(h) as i32;
                self.unlock(list);
            }
        }
    }

    /// True unless key locking is active and `hash` is not declared.
    pub(crate) fn keylocked(&mut self, hash: u32) -> bool {
        let ok = self
            .lockedkeys
            .as_ref()
            .map_or(true, |keys| keys.contains(&hash));
        if !ok {
            self.ecode = ErrorKind::NoLock;
        }
        ok
    }
}
