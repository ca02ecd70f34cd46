//! Positioned reads and writes, through the map when one exists and
//! through positional file I/O otherwise, with the out-of-bounds probe
//! that follows growth done by other processes.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use log::{debug, error};

use crate::error::{Error, Result};
use crate::layout::{conv, Rec, FREE_MAGIC};
use crate::{Flags, Tdb};

/// The handle's view of the arena: a file mapping, or a heap buffer for
/// internal (memory-only) stores.
pub(crate) enum Mapping {
    Ro(memmap2::Mmap),
    Rw(memmap2::MmapMut),
    Heap(Vec<u8>),
}

impl Mapping {
    pub(crate) fn bytes(&self) -> &[u8] {
        match self {
            Mapping::Ro(m) => &m[..],
            Mapping::Rw(m) => &m[..],
            Mapping::Heap(v) => &v[..],
        }
    }

    /// `None` for read-only views.
    pub(crate) fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            Mapping::Ro(_) => None,
            Mapping::Rw(m) => Some(&mut m[..]),
            Mapping::Heap(v) => Some(&mut v[..]),
        }
    }
}

/// Byte-reverse every 32-bit word in `buf`.
pub(crate) fn byterev_words(buf: &mut [u8]) {
    for word in buf.chunks_exact_mut(4) {
        word.reverse();
    }
}

impl Tdb {
    pub(crate) fn file_ref(&self) -> io::Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }

    /// Drop the map view. Internal stores keep their heap arena.
    pub(crate) fn munmap(&mut self) {
        if self.flags.contains(Flags::INTERNAL) {
            return;
        }
        self.map = None;
    }

    /// (Re-)establish the map over the first `map_size` bytes of the
    /// file. Failure is not fatal: operations fall back to positional
    /// file I/O.
    pub(crate) fn mmap(&mut self) {
        if self.flags.contains(Flags::INTERNAL) {
            return;
        }
        self.map = None;
        if self.flags.contains(Flags::NOMMAP) {
            return;
        }
        let Some(file) = self.file.as_ref() else {
            return;
        };
        let len = self.map_size as usize;
        let mapped = unsafe {
            if self.read_only {
                memmap2::MmapOptions::new().len(len).map(file).map(Mapping::Ro)
            } else {
                memmap2::MmapOptions::new()
                    .len(len)
                    .map_mut(file)
                    .map(Mapping::Rw)
            }
        };
        match mapped {
            Ok(m) => self.map = Some(m),
            Err(e) => debug!("mmap failed for size {len}: {e}"),
        }
    }

    /// Check that the first `len` bytes are addressable. If another
    /// process grew the file, remap to the new size first. `probe`
    /// suppresses logging for speculative checks.
    pub(crate) fn oob(&mut self, len: u32, probe: bool) -> Result<()> {
        if len <= self.map_size {
            return Ok(());
        }
        if self.flags.contains(Flags::INTERNAL) {
            if !probe {
                error!(
                    "length {len} beyond internal arena size {}",
                    self.map_size
                );
            }
            return self.fail(Error::Io(io::Error::from(io::ErrorKind::UnexpectedEof)));
        }

        let size = match self.file_ref().and_then(|f| f.metadata()) {
            Ok(md) => md.len(),
            Err(e) => return self.fail(Error::Io(e)),
        };
        if size < len as u64 {
            if !probe {
                error!("length {len} beyond eof at {size}");
            }
            return self.fail(Error::Io(io::Error::from(io::ErrorKind::UnexpectedEof)));
        }

        // Unmap, update size, remap.
        self.munmap();
        self.map_size = size as u32;
        self.mmap();
        Ok(())
    }

    pub(crate) fn write_at(&mut self, off: u32, buf: &[u8]) -> Result<()> {
        let Some(end) = off.checked_add(buf.len() as u32) else {
            return self.fail(Error::Io(io::Error::from(io::ErrorKind::InvalidInput)));
        };
        self.oob(end, false)?;

        if let Some(map) = self.map.as_mut() {
            if let Some(bytes) = map.bytes_mut() {
                bytes[off as usize..end as usize].copy_from_slice(buf);
                return Ok(());
            }
            // Read-only view; nothing here should be writing through it.
            return self.fail(Error::Io(io::Error::from(io::ErrorKind::PermissionDenied)));
        }

        let res = match self.file_ref() {
            Ok(file) => file.write_all_at(buf, off as u64),
            Err(e) => Err(e),
        };
        if let Err(e) = res {
            error!("write failed at {off} len={}: {e}", buf.len());
            return self.fail(Error::Io(e));
        }
        Ok(())
    }

    pub(crate) fn read_at_into(&mut self, off: u32, buf: &mut [u8]) -> Result<()> {
        let Some(end) = off.checked_add(buf.len() as u32) else {
            return self.fail(Error::Io(io::Error::from(io::ErrorKind::InvalidInput)));
        };
        self.oob(end, false)?;

        if let Some(map) = self.map.as_ref() {
            buf.copy_from_slice(&map.bytes()[off as usize..end as usize]);
            return Ok(());
        }

        let res = match self.file_ref() {
            Ok(file) => file.read_exact_at(buf, off as u64),
            Err(e) => Err(e),
        };
        if let Err(e) = res {
            error!("read failed at {off} len={}: {e}", buf.len());
            return self.fail(Error::Io(e));
        }
        Ok(())
    }

    /// Read `len` bytes into a fresh buffer.
    pub(crate) fn read_buf(&mut self, off: u32, len: u32) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        if buf.try_reserve_exact(len as usize).is_err() {
            error!("buffer allocation failed len={len}");
            return self.fail(Error::Oom);
        }
        buf.resize(len as usize, 0);
        self.read_at_into(off, &mut buf)?;
        Ok(buf)
    }

    /// Read one offset word, honoring convert mode.
    pub(crate) fn ofs_read(&mut self, off: u32) -> Result<u32> {
        let mut word = [0u8; 4];
        self.read_at_into(off, &mut word)?;
        Ok(conv(u32::from_ne_bytes(word), self.convert()))
    }

    pub(crate) fn ofs_write(&mut self, off: u32, d: u32) -> Result<()> {
        let word = conv(d, self.convert()).to_ne_bytes();
        self.write_at(off, &word)
    }

    /// Read a record header with no magic validation.
    pub(crate) fn rec_read_raw(&mut self, off: u32) -> Result<Rec> {
        let mut buf = [0u8; Rec::SIZE as usize];
        self.read_at_into(off, &mut buf)?;
        Ok(Rec::from_bytes(&buf, self.convert()))
    }

    /// Read a chain record: live or tombstoned, with a plausible next
    /// pointer.
    pub(crate) fn rec_read(&mut self, off: u32) -> Result<Rec> {
        let rec = self.rec_read_raw(off)?;
        if rec.bad_magic() {
            error!("bad magic 0x{:x} at offset={off}", rec.magic);
            return self.fail(Error::Corrupt);
        }
        match rec.next.checked_add(Rec::SIZE) {
            Some(end) => self.oob(end, false)?,
            None => return self.fail(Error::Corrupt),
        }
        Ok(rec)
    }

    /// Read a free-list record and check it really is free.
    pub(crate) fn rec_free_read(&mut self, off: u32) -> Result<Rec> {
        let rec = self.rec_read_raw(off)?;
        if rec.magic != FREE_MAGIC {
            error!("bad free-list magic 0x{:x} at offset={off}", rec.magic);
            return self.fail(Error::Corrupt);
        }
        match rec.next.checked_add(Rec::SIZE) {
            Some(end) => self.oob(end, false)?,
            None => return self.fail(Error::Corrupt),
        }
        Ok(rec)
    }

    pub(crate) fn rec_write(&mut self, off: u32, rec: &Rec) -> Result<()> {
        let buf = rec.to_bytes(self.convert());
        self.write_at(off, &buf)
    }
}
