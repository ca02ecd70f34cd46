//! Free-space allocator: a first-fit free list threaded through the
//! arena, with splitting, left/right coalescing through record tailers,
//! and page-aligned file growth. Everything here runs under the
//! allocation lock (chain -1).

use std::io;
use std::os::unix::fs::FileExt;

use log::{error, warn};

use crate::error::{Error, Result};
use crate::io::Mapping;
use crate::layout::{
    align_up, bucket_off, Rec, ALIGNMENT, FREELIST_TOP, FREE_MAGIC, MAGIC, MIN_REC_SIZE, PAGE_SIZE,
};
use crate::lock::LockType;
use crate::{Flags, Tdb};

impl Tdb {
    /// Rewrite a record's tailer: the word at the end of the record
    /// equals `header + rec_len`, which is how the right neighbour finds
    /// this record's start when coalescing.
    pub(crate) fn update_tailer(&mut self, offset: u32, rec: &Rec) -> Result<()> {
        let total = Rec::SIZE + rec.rec_len;
        self.ofs_write(offset + total - 4, total)
    }

    /// Unlink `off` from the free list, pointing its predecessor at
    /// `next`.
    fn remove_from_freelist(&mut self, off: u32, next: u32) -> Result<()> {
        let mut last_ptr = FREELIST_TOP;
        loop {
            let i = match self.ofs_read(last_ptr) {
                Ok(i) => i,
                Err(_) => break,
            };
            if i == 0 {
                break;
            }
            if i == off {
                return self.ofs_write(last_ptr, next);
            }
            // The next pointer sits at the start of the record.
            last_ptr = i;
        }
        error!("free-list unlink: offset {off} not on list");
        self.fail(Error::Corrupt)
    }

    /// Return a record to the free list, merging with free neighbours.
    pub(crate) fn free_record(&mut self, offset: u32, rec: Rec) -> Result<()> {
        self.lock(-1, LockType::Write)?;
        let res = self.free_locked(offset, rec);
        self.unlock(-1);
        res
    }

    fn free_locked(&mut self, mut offset: u32, mut rec: Rec) -> Result<()> {
        // Set an initial tailer, so a crash mid-merge does not leave a
        // bogus record behind.
        let _ = self.update_tailer(offset, &rec);

        // Look right first.
        let right = offset + Rec::SIZE + rec.rec_len;
        if right + Rec::SIZE <= self.map_size {
            match self.rec_read_raw(right) {
                Err(_) => warn!("free: right read failed at {right}"),
                Ok(r) if r.magic == FREE_MAGIC => {
                    if self.remove_from_freelist(right, r.next).is_err() {
                        warn!("free: right unlink failed at {right}");
                    } else {
                        rec.rec_len += Rec::SIZE + r.rec_len;
                    }
                }
                Ok(_) => {}
            }
        }

        // Look left; the tailer just before us gives the neighbour's
        // total size, hence its start.
        let tailer_ofs = offset - 4;
        if tailer_ofs > bucket_off(self.header.hash_size - 1) {
            match self.ofs_read(tailer_ofs) {
                Err(_) => warn!("free: left tailer read failed at {tailer_ofs}"),
                Ok(leftsize) => {
                    let left = offset.wrapping_sub(leftsize);
                    match self.rec_read_raw(left) {
                        Err(_) => warn!("free: left read failed at {left} ({leftsize})"),
                        Ok(l) if l.magic == FREE_MAGIC => {
                            if self.remove_from_freelist(left, l.next).is_err() {
                                warn!("free: left unlink failed at {left}");
                            } else {
                                offset = left;
                                rec.rec_len += leftsize;
                            }
                        }
                        Ok(_) => {}
                    }
                }
            }
        }

        self.update_tailer(offset, &rec)?;

        // Prepend to the free list.
        rec.magic = FREE_MAGIC;
        rec.next = self.ofs_read(FREELIST_TOP)?;
        self.rec_write(offset, &rec)?;
        self.ofs_write(FREELIST_TOP, offset)
    }

    /// Extend the file by `addition` bytes past `size`, never leaving a
    /// sparse region.
    fn expand_file(&mut self, size: u32, addition: u32) -> Result<()> {
        let res = (|| -> io::Result<()> {
            let file = self.file_ref()?;
            // ftruncate is what posix prescribes for mmap expansion.
            file.set_len(size as u64 + addition as u64)?;
            // Fill the new range with plain writes so it is allocated on
            // disk even where truncation leaves holes.
            let fill = [0x42u8; 1024];
            let mut pos = size as u64;
            let mut remaining = addition as usize;
            while remaining > 0 {
                let n = remaining.min(fill.len());
                file.write_all_at(&fill[..n], pos)?;
                pos += n as u64;
                remaining -= n;
            }
            Ok(())
        })();
        match res {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("file expansion by {addition} failed: {e}");
                self.fail(Error::Io(e))
            }
        }
    }

    /// Grow the database by at least `size` bytes and put the new space
    /// on the free list.
    pub(crate) fn expand(&mut self, size: u32) -> Result<()> {
        if let Err(e) = self.lock(-1, LockType::Write) {
            error!("lock failed in expand");
            return Err(e);
        }
        let res = self.expand_locked(size);
        self.unlock(-1);
        res
    }

    fn expand_locked(&mut self, size: u32) -> Result<()> {
        // Catch up with any growth done by another process first.
        let _ = self.oob(self.map_size.saturating_add(1), true);

        // Room for at least ten more records, rounded up to the page
        // unit.
        let page = PAGE_SIZE as u64;
        let target = (self.map_size as u64 + size as u64 * 10).div_ceil(page) * page;
        if target > u32::MAX as u64 {
            error!("expansion past the 4 GiB layout limit");
            return self.fail(Error::Io(io::Error::other("database at the 4 GiB layout limit")));
        }
        let addition = target as u32 - self.map_size;

        if !self.flags.contains(Flags::INTERNAL) {
            // The file must be unmapped while it grows; not every system
            // keeps writes and maps coherent across extension.
            self.munmap();
            self.expand_file(self.map_size, addition)?;
        }
        self.map_size += addition;
        if self.flags.contains(Flags::INTERNAL) {
            let new_len = self.map_size as usize;
            if let Some(Mapping::Heap(buf)) = self.map.as_mut() {
                buf.resize(new_len, 0);
            }
        } else {
            self.mmap();
        }

        // The new tail becomes one free record.
        let rec = Rec {
            rec_len: addition - Rec::SIZE,
            ..Rec::default()
        };
        let offset = self.map_size - addition;
        self.free_record(offset, rec)
    }

    /// Carve a record with room for `length` payload bytes off the free
    /// list, growing the file when nothing fits. Returns the offset and
    /// the published (live) header of an unconnected record.
    pub(crate) fn allocate(&mut self, length: u32) -> Result<(u32, Rec)> {
        self.lock(-1, LockType::Write)?;
        let res = self.allocate_locked(length);
        self.unlock(-1);
        res
    }

    fn allocate_locked(&mut self, length: u32) -> Result<(u32, Rec)> {
        // The tailer lives inside rec_len.
        let mut length = length + 4;
        loop {
            let mut last_ptr = FREELIST_TOP;
            let mut rec_ptr = self.ofs_read(FREELIST_TOP)?;

            while rec_ptr != 0 {
                let mut rec = self.rec_free_read(rec_ptr)?;
                if rec.rec_len >= length {
                    let mut newrec_ptr = 0;
                    let mut newrec = Rec::default();
                    if rec.rec_len > length + MIN_REC_SIZE {
                        // Split: the left piece is the allocation, the
                        // right piece goes back on the free list.
                        length = align_up(length, ALIGNMENT);
                        newrec.rec_len = rec.rec_len - (Rec::SIZE + length);
                        newrec_ptr = rec_ptr + Rec::SIZE + length;
                        rec.rec_len = length;
                    }

                    self.ofs_write(last_ptr, rec.next)?;

                    // Publish as live before the allocation lock drops,
                    // or a concurrent free could try to merge with us.
                    rec.magic = MAGIC;
                    self.rec_write(rec_ptr, &rec)?;

                    if newrec_ptr != 0 {
                        self.update_tailer(rec_ptr, &rec)?;
                        self.free_record(newrec_ptr, newrec)?;
                    }
                    return Ok((rec_ptr, rec));
                }
                last_ptr = rec_ptr;
                rec_ptr = rec.next;
            }

            // Nothing fits: expand and rescan.
            self.expand(length + Rec::SIZE)?;
        }
    }

    /// Walk the free list under the allocation lock, returning the entry
    /// count and the total free payload bytes.
    pub fn freelist(&mut self) -> Result<(usize, u64)> {
        self.lock(-1, LockType::Write)?;
        let res = self.freelist_locked();
        self.unlock(-1);
        res
    }

    fn freelist_locked(&mut self) -> Result<(usize, u64)> {
        let mut count = 0usize;
        let mut total = 0u64;
        let mut rec_ptr = self.ofs_read(FREELIST_TOP)?;
        while rec_ptr != 0 {
            let rec = self.rec_free_read(rec_ptr)?;
            count += 1;
            total += rec.rec_len as u64;
            rec_ptr = rec.next;
        }
        Ok((count, total))
    }
}
