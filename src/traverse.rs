//! Bucket-ordered traversal that tolerates concurrent deletion.
//!
//! A traversal registers a cursor with the handle so deleters can see
//! which record it pins. The current record is held under a shared
//! record lock; a deleter that cannot take its exclusive probe leaves a
//! tombstone, which a later traversal reclaims while it holds the chain
//! lock.

use crate::error::{Error, Result};
use crate::layout::{bucket_off, Rec};
use crate::lock::LockType;
use crate::Tdb;

/// One traversal cursor: the chain being walked and the pinned record.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TraverseLock {
    pub off: u32,
    pub hash: u32,
}

impl Tdb {
    /// Advance the cursor in `slot` to the next live record. On success
    /// the record's chain is locked exclusively and the record itself is
    /// locked shared; `None` means the traversal is done.
    pub(crate) fn next_lock(&mut self, slot: usize) -> Result<Option<(u32, Rec)>> {
        let mut want_next = self.travlocks[slot].off != 0;

        // Key locking pins specific chains for the caller; walking every
        // chain would go around it.
        if self.lockedkeys.is_some() {
            return self.fail(Error::NoLock);
        }

        while self.travlocks[slot].hash < self.header.hash_size {
            let hash = self.travlocks[slot].hash;
            self.lock(hash as i32, LockType::Write)?;
            match self.next_in_chain(slot, want_next) {
                // The chain stays locked for the caller.
                Ok(Some(found)) => return Ok(Some(found)),
                Ok(None) => {
                    self.unlock(hash as i32);
                    self.travlocks[slot].hash += 1;
                    want_next = false;
                }
                Err(e) => {
                    self.travlocks[slot].off = 0;
                    self.unlock(hash as i32);
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    fn next_in_chain(&mut self, slot: usize, want_next: bool) -> Result<Option<(u32, Rec)>> {
        if self.travlocks[slot].off == 0 {
            // Fresh chain: start at its head.
            let top = bucket_off(self.travlocks[slot].hash);
            self.travlocks[slot].off = self.ofs_read(top)?;
        } else {
            // Otherwise drop the previous record's lock.
            let prev = self.travlocks[slot].off;
            let _ = self.unlock_record(prev);
        }

        if want_next {
            // We hold the offset of the old record: step past it.
            let rec = self.rec_read(self.travlocks[slot].off)?;
            self.travlocks[slot].off = rec.next;
        }

        while self.travlocks[slot].off != 0 {
            let off = self.travlocks[slot].off;
            let mut rec = self.rec_read(off)?;
            if !rec.is_dead() {
                let _ = self.lock_record(off);
                return Ok(Some((off, rec)));
            }
            // Reclaim tombstones left behind by old traversals. The
            // cursor moves off the record first so our own probe check
            // does not refuse the delete.
            self.travlocks[slot].off = rec.next;
            let _ = self.do_delete(off, &mut rec);
        }
        Ok(None)
    }

    /// Visit every record. The callback runs with the chain lock dropped
    /// (so it may mutate the database through the handle) and the
    /// current record pinned by a shared lock; returning `true` stops
    /// the walk. Returns the number of records visited.
    pub fn traverse<F>(&mut self, mut f: F) -> Result<u32>
    where
        F: FnMut(&mut Tdb, &[u8], &[u8]) -> bool,
    {
        // Cursors nest: a traversal started from inside the callback
        // gets its own slot.
        self.travlocks.push(TraverseLock::default());
        let slot = self.travlocks.len() - 1;
        let mut count = 0u32;

        loop {
            let (off, rec) = match self.next_lock(slot) {
                Ok(Some(found)) => found,
                Ok(None) => break,
                Err(e) => {
                    self.travlocks.pop();
                    return Err(e);
                }
            };
            count += 1;

            let kv = match self.read_buf(off + Rec::SIZE, rec.key_len + rec.data_len) {
                Ok(kv) => kv,
                Err(e) => {
                    let hash = self.travlocks[slot].hash;
                    self.unlock(hash as i32);
                    let _ = self.unlock_record(off);
                    self.travlocks.pop();
                    return Err(e);
                }
            };

            // Drop the chain lock before calling out.
            let hash = self.travlocks[slot].hash;
            self.unlock(hash as i32);

            let (key, val) = kv.split_at(rec.key_len as usize);
            if f(self, key, val) {
                let _ = self.unlock_record(off);
                self.travlocks.pop();
                return Ok(count);
            }
        }

        self.travlocks.pop();
        Ok(count)
    }

    /// Return the first key in traversal order, pinning its record until
    /// the next `firstkey`/`nextkey` call.
    pub fn firstkey(&mut self) -> Result<Option<Vec<u8>>> {
        // Release any cursor left by a previous walk.
        let prev = self.travlocks[0].off;
        let _ = self.unlock_record(prev);
        self.travlocks[0].off = 0;
        self.travlocks[0].hash = 0;

        let Some((off, rec)) = self.next_lock(0)? else {
            return Ok(None);
        };
        let key = self.read_buf(off + Rec::SIZE, rec.key_len);
        let hash = self.travlocks[0].hash;
        self.unlock(hash as i32);
        key.map(Some)
    }

    /// Return the key after `oldkey`. If the pinned record no longer
    /// holds `oldkey` (another writer replaced it between calls),
    /// `oldkey` is re-found first, which keeps iteration reliable across
    /// concurrent modification.
    pub fn nextkey(&mut self, oldkey: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.travlocks[0].off != 0 {
            let hash = self.travlocks[0].hash;
            self.lock(hash as i32, LockType::Write)?;
            let off = self.travlocks[0].off;
            let still_ours = match self.rec_read(off) {
                Ok(rec) => match self.read_buf(off + Rec::SIZE, rec.key_len) {
                    Ok(k) => k == oldkey,
                    Err(_) => false,
                },
                Err(_) => false,
            };
            if !still_ours {
                // Stale cursor: unlock it and start from scratch.
                let _ = self.unlock_record(off);
                self.unlock(hash as i32);
                self.travlocks[0].off = 0;
            }
        }

        if self.travlocks[0].off == 0 {
            // No pinned record: do a normal find and pin the result.
            match self.find_lock(oldkey, LockType::Write) {
                Ok((off, rec)) => {
                    self.travlocks[0].off = off;
                    self.travlocks[0].hash = self.bucket(rec.full_hash);
                    let _ = self.lock_record(off);
                }
                Err(Error::NoExist) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
        let oldhash = self.travlocks[0].hash;

        // Advancing locks the new chain and record and releases the old
        // record; the old chain is released last.
        let mut out = Ok(None);
        match self.next_lock(0) {
            Ok(Some((off, rec))) => {
                let key = self.read_buf(off + Rec::SIZE, rec.key_len);
                let hash = self.travlocks[0].hash;
                self.unlock(hash as i32);
                out = key.map(Some);
            }
            Ok(None) => {}
            Err(e) => out = Err(e),
        }
        self.unlock(oldhash as i32);
        out
    }
}
