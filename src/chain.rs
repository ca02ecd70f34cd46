//! Hash-chain engine: find, fetch, store, update-in-place, delete.
//!
//! Each bucket heads a singly linked list of live records; writers to a
//! chain are totally ordered by its exclusive lock. Records are spliced
//! in at the chain head and unlinked by rewriting the predecessor's next
//! pointer.

use crate::error::{Error, ErrorKind, Result};
use crate::layout::{bucket_off, key_hash, Rec, DEAD_MAGIC, MAGIC};
use crate::lock::LockType;
use crate::{StoreMode, Tdb};

impl Tdb {
    /// Walk the chain for `hash` looking for `key`. The chain lock is
    /// held by the caller. A miss records NOEXIST.
    fn find(&mut self, key: &[u8], hash: u32) -> Result<(u32, Rec)> {
        let mut rec_ptr = self.ofs_read(bucket_off(self.bucket(hash)))?;

        while rec_ptr != 0 {
            let rec = self.rec_read(rec_ptr)?;
            // Tombstones stay chained until a traversal reclaims them.
            if !rec.is_dead() && hash == rec.full_hash && key.len() as u32 == rec.key_len {
                // A very likely hit; confirm against the stored bytes.
                let stored = self.read_buf(rec_ptr + Rec::SIZE, rec.key_len)?;
                if stored == key {
                    return Ok((rec_ptr, rec));
                }
            }
            rec_ptr = rec.next;
        }
        self.fail(Error::NoExist)
    }

    /// As `find`, but takes the chain lock and keeps it on success.
    pub(crate) fn find_lock(&mut self, key: &[u8], ltype: LockType) -> Result<(u32, Rec)> {
        let hash = key_hash(key);
        if !self.keylocked(hash) {
            return Err(Error::NoLock);
        }
        let list = self.bucket(hash) as i32;
        self.lock(list, ltype)?;
        match self.find(key, hash) {
            Ok(found) => Ok(found),
            Err(e) => {
                self.unlock(list);
                Err(e)
            }
        }
    }

    /// Rewrite a record's value in place. `Ok(false)` means the record
    /// is too small and the caller must reallocate.
    fn update(&mut self, key: &[u8], dbuf: &[u8]) -> Result<bool> {
        let (rec_ptr, rec) = self.find_lock(key, LockType::Write)?;
        let res = self.update_found(rec_ptr, rec, key, dbuf);
        self.unlock(self.bucket(rec.full_hash) as i32);
        res
    }

    fn update_found(&mut self, rec_ptr: u32, mut rec: Rec, key: &[u8], dbuf: &[u8]) -> Result<bool> {
        // Key, data and tailer must all fit.
        if (rec.rec_len as u64) < key.len() as u64 + dbuf.len() as u64 + 4 {
            self.ecode = ErrorKind::Success; // a bad fit, not an error
            return Ok(false);
        }

        self.write_at(rec_ptr + Rec::SIZE + rec.key_len, dbuf)?;
        if dbuf.len() as u32 != rec.data_len {
            rec.data_len = dbuf.len() as u32;
            self.rec_write(rec_ptr, &rec)?;
        }
        Ok(true)
    }

    /// Fetch the value stored under `key`.
    pub fn fetch(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (rec_ptr, rec) = match self.find_lock(key, LockType::Read) {
            Ok(found) => found,
            Err(Error::NoExist) => return Ok(None),
            Err(e) => return Err(e),
        };
        let res = self.read_buf(rec_ptr + Rec::SIZE + rec.key_len, rec.data_len);
        self.unlock(self.bucket(rec.full_hash) as i32);
        res.map(Some)
    }

    /// True if `key` is present.
    pub fn exists(&mut self, key: &[u8]) -> bool {
        match self.find_lock(key, LockType::Read) {
            Ok((_, rec)) => {
                self.unlock(self.bucket(rec.full_hash) as i32);
                true
            }
            Err(_) => false,
        }
    }

    /// Unlink a found record from its chain and recycle it. When a
    /// traverser pins the record, tombstone it instead; a later
    /// traversal reclaims it.
    pub(crate) fn do_delete(&mut self, rec_ptr: u32, rec: &mut Rec) -> Result<()> {
        if self.read_only {
            return Err(Error::Lock);
        }

        if self.write_lock_record(rec_ptr).is_err() {
            rec.magic = DEAD_MAGIC;
            return self.rec_write(rec_ptr, rec);
        }
        let _ = self.write_unlock_record(rec_ptr);

        // Find the predecessor in the chain. The next pointer sits at
        // the start of a record, so the bucket head doubles as one.
        let top = bucket_off(self.bucket(rec.full_hash));
        let mut last_ptr = 0u32;
        let mut i = self.ofs_read(top)?;
        while i != rec_ptr {
            let lastrec = self.rec_read(i)?;
            last_ptr = i;
            i = lastrec.next;
        }

        let prev = if last_ptr == 0 { top } else { last_ptr };
        self.ofs_write(prev, rec.next)?;

        self.free_record(rec_ptr, *rec)
    }

    /// Delete `key`. A record currently pinned by a traversal is
    /// tombstoned rather than unlinked; either way the delete succeeds.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        let (rec_ptr, mut rec) = self.find_lock(key, LockType::Write)?;
        let res = self.do_delete(rec_ptr, &mut rec);
        self.unlock(self.bucket(rec.full_hash) as i32);
        res
    }

    /// Store `dbuf` under `key` according to `mode`.
    pub fn store(&mut self, key: &[u8], dbuf: &[u8], mode: StoreMode) -> Result<()> {
        if key.len() as u64 + dbuf.len() as u64 + 4 > u32::MAX as u64 {
            return self.fail(Error::Oom);
        }
        let hash = key_hash(key);
        if !self.keylocked(hash) {
            return Err(Error::NoLock);
        }
        let list = self.bucket(hash) as i32;
        self.lock(list, LockType::Write)?;
        let res = self.store_locked(key, dbuf, mode, hash);
        self.unlock(list);
        res
    }

    fn store_locked(&mut self, key: &[u8], dbuf: &[u8], mode: StoreMode, hash: u32) -> Result<()> {
        if mode == StoreMode::Insert {
            if self.exists(key) {
                return self.fail(Error::Exists);
            }
        } else {
            // Try in place first; only a definite miss stops a modify.
            match self.update(key, dbuf) {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(Error::NoExist) if mode == StoreMode::Modify => {
                    return self.fail(Error::NoExist);
                }
                Err(_) => {}
            }
        }
        // The in-place attempt may have recorded a miss.
        self.ecode = ErrorKind::Success;

        // Delete any old record first: it reduces fragmentation and
        // keeps the allocator from coalescing with the block we are
        // about to fill in.
        if mode != StoreMode::Insert {
            let _ = self.delete(key);
        }

        let (rec_ptr, mut rec) = self.allocate((key.len() + dbuf.len()) as u32)?;
        rec.next = self.ofs_read(bucket_off(self.bucket(hash)))?;
        rec.key_len = key.len() as u32;
        rec.data_len = dbuf.len() as u32;
        rec.full_hash = hash;
        rec.magic = MAGIC;

        // Write the record out, then point the chain head at it.
        self.rec_write(rec_ptr, &rec)?;
        self.write_at(rec_ptr + Rec::SIZE, key)?;
        self.write_at(rec_ptr + Rec::SIZE + rec.key_len, dbuf)?;
        self.ofs_write(bucket_off(self.bucket(hash)), rec_ptr)
    }
}
