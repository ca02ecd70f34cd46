//! Lifecycle: open, fresh-database initialization, post-fork reopen,
//! close.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::path::Path;

use log::{error, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::io::{byterev_words, Mapping};
use crate::layout::{
    Header, ACTIVE_LOCK, DEFAULT_HASH_SIZE, GLOBAL_LOCK, HEADER_SIZE, MAGIC_FOOD, VERSION,
};
use crate::registry;
use crate::traverse::TraverseLock;
use crate::{Flags, Tdb};

/// One nesting counter per chain plus one for the allocation lock.
fn lock_counters(hash_size: u32) -> Option<Vec<u32>> {
    let n = (hash_size as usize).checked_add(1)?;
    let mut counters = Vec::new();
    counters.try_reserve_exact(n).ok()?;
    counters.resize(n, 0);
    Some(counters)
}

impl Tdb {
    /// Open `name`, creating it when `open_flags` includes `O_CREAT` and
    /// the file is absent or unrecognizable.
    ///
    /// `hash_size` is advisory: zero picks the default, and an existing
    /// database keeps the bucket count it was created with.
    /// `open_flags` and `mode` take the POSIX open values
    /// (`libc::O_RDWR | libc::O_CREAT`, `0o644`); `O_WRONLY` is
    /// rejected, and read-only handles do no locking and no
    /// clear-if-first.
    pub fn open<P: AsRef<Path>>(
        name: P,
        hash_size: u32,
        flags: Flags,
        open_flags: i32,
        mode: u32,
    ) -> Result<Tdb> {
        let name = name.as_ref();
        let accmode = open_flags & libc::O_ACCMODE;
        if accmode == libc::O_WRONLY {
            error!("cannot open {} write-only", name.display());
            return Err(Error::Io(io::Error::from_raw_os_error(libc::EINVAL)));
        }
        let hash_size = if hash_size == 0 {
            DEFAULT_HASH_SIZE
        } else {
            hash_size
        };
        let read_only = accmode == libc::O_RDONLY;

        let mut tdb = Tdb {
            name: None,
            flags,
            read_only,
            file: None,
            map: None,
            map_size: 0,
            header: Header::default(),
            ecode: ErrorKind::Success,
            locked: Vec::new(),
            travlocks: vec![TraverseLock::default()],
            lockedkeys: None,
            device: 0,
            inode: 0,
            registered: false,
        };
        if read_only {
            tdb.flags.insert(Flags::NOLOCK);
            tdb.flags.remove(Flags::CLEAR_IF_FIRST);
        }

        // Internal databases have no file behind them and start cleared.
        if tdb.flags.contains(Flags::INTERNAL) {
            tdb.flags.insert(Flags::NOLOCK);
            tdb.flags.insert(Flags::NOMMAP);
            tdb.flags.remove(Flags::CLEAR_IF_FIRST);
            tdb.new_database(hash_size)?;
            tdb.locked = match lock_counters(hash_size) {
                Some(counters) => counters,
                None => return tdb.fail(Error::Oom),
            };
            return Ok(tdb);
        }

        let mut create = open_flags & libc::O_CREAT != 0;
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(create)
            .truncate(open_flags & libc::O_TRUNC != 0)
            .mode(mode)
            .open(name)
            .map_err(|e| {
                error!("could not open {}: {e}", name.display());
                Error::Io(e)
            })?;
        tdb.file = Some(file);
        tdb.name = Some(name.to_path_buf());

        // Only one process initialises at once.
        if let Err(e) = tdb.brlock(GLOBAL_LOCK, libc::F_WRLCK as i32, true, false) {
            error!("failed to get global lock on {}", name.display());
            return Err(e);
        }

        // A successful exclusive probe means no other instance is live;
        // that is the opener allowed to clear the database.
        let first = tdb
            .brlock(ACTIVE_LOCK, libc::F_WRLCK as i32, false, false)
            .is_ok();
        if first && tdb.flags.contains(Flags::CLEAR_IF_FIRST) {
            create = true;
            if let Err(e) = tdb.file_ref().and_then(|f| f.set_len(0)) {
                error!("failed to truncate {}: {e}", name.display());
                return Err(Error::Io(e));
            }
        }

        // Validate the header, initializing a fresh one when permitted.
        let mut rev = false;
        if !tdb.read_header(&mut rev) {
            if !create || tdb.new_database(hash_size).is_err() {
                // Bad format, and not ours to fix.
                return Err(Error::Io(io::Error::from_raw_os_error(libc::EIO)));
            }
            rev = tdb.flags.contains(Flags::CONVERT);
        }
        if rev {
            tdb.flags.insert(Flags::CONVERT);
        } else {
            tdb.flags.remove(Flags::CONVERT);
        }
        if tdb.header.rwlocks != 0 {
            warn!(
                "{} carries a spin-lock array; chain locking will fail",
                name.display()
            );
        }

        let md = match tdb.file_ref().and_then(|f| f.metadata()) {
            Ok(md) => md,
            Err(e) => return Err(Error::Io(e)),
        };
        if md.len() > u32::MAX as u64 {
            error!("{} exceeds the 4 GiB layout limit", name.display());
            return Err(Error::Io(io::Error::other("file exceeds the 4 GiB layout limit")));
        }

        // One handle per (device, inode) per process: fcntl locks do not
        // nest across descriptors.
        tdb.device = md.dev();
        tdb.inode = md.ino();
        if !registry::register(tdb.device, tdb.inode) {
            warn!("{} is already open in this process", name.display());
            return Err(Error::Io(io::Error::from_raw_os_error(libc::EBUSY)));
        }
        tdb.registered = true;

        tdb.map_size = md.len() as u32;
        tdb.locked = match lock_counters(tdb.header.hash_size) {
            Some(counters) => counters,
            None => return tdb.fail(Error::Oom),
        };
        tdb.mmap();

        if first {
            if tdb
                .brlock(ACTIVE_LOCK, libc::F_UNLCK as i32, false, false)
                .is_err()
            {
                error!("failed to release first-opener probe on {}", name.display());
                return Err(Error::Lock);
            }
        }
        // Left in place for the handle's lifetime to mark it in use.
        tdb.brlock(ACTIVE_LOCK, libc::F_RDLCK as i32, true, false)?;
        tdb.brlock(GLOBAL_LOCK, libc::F_UNLCK as i32, true, false)?;
        Ok(tdb)
    }

    /// Parse the on-disk header. Fills the cached header and sets `rev`
    /// when the version word is byte-reversed; false means the file is
    /// not a recognizable database.
    fn read_header(&mut self, rev: &mut bool) -> bool {
        let mut buf = [0u8; HEADER_SIZE as usize];
        let ok = match self.file_ref() {
            Ok(f) => f.read_exact_at(&mut buf, 0).is_ok(),
            Err(_) => false,
        };
        if !ok || &buf[..MAGIC_FOOD.len()] != MAGIC_FOOD {
            return false;
        }

        let word = |i: usize| {
            let mut w = [0u8; 4];
            w.copy_from_slice(&buf[i..i + 4]);
            u32::from_ne_bytes(w)
        };
        let version = word(12);
        let swap = if version == VERSION {
            false
        } else if version == VERSION.swap_bytes() {
            true
        } else {
            return false;
        };
        let fix = |x: u32| if swap { x.swap_bytes() } else { x };
        let header = Header {
            version: fix(version),
            hash_size: fix(word(16)),
            rwlocks: fix(word(20)),
        };
        if header.hash_size == 0 {
            return false;
        }
        self.header = header;
        *rev = swap;
        true
    }

    /// Build a fresh header and bucket array: in memory for internal
    /// stores, written to the (truncated) file otherwise.
    fn new_database(&mut self, hash_size: u32) -> Result<()> {
        let size = HEADER_SIZE as usize + (hash_size as usize + 1) * 4;
        let mut image = Vec::new();
        if image.try_reserve_exact(size).is_err() {
            return self.fail(Error::Oom);
        }
        image.resize(size, 0);
        image[12..16].copy_from_slice(&VERSION.to_ne_bytes());
        image[16..20].copy_from_slice(&hash_size.to_ne_bytes());
        // rwlocks stays zero: no spin-lock array.
        self.header = Header {
            version: VERSION,
            hash_size,
            rwlocks: 0,
        };

        if self.convert() {
            // The image is the on-disk form.
            byterev_words(&mut image);
        }

        if self.flags.contains(Flags::INTERNAL) {
            self.map_size = size as u32;
            self.map = Some(Mapping::Heap(image));
            return Ok(());
        }

        // The magic string is never byte-reversed.
        image[..MAGIC_FOOD.len()].copy_from_slice(MAGIC_FOOD);
        let res = (|| -> io::Result<()> {
            let file = self.file_ref()?;
            file.set_len(0)?;
            file.write_all_at(&image, 0)?;
            Ok(())
        })();
        match res {
            Ok(()) => Ok(()),
            Err(e) => self.fail(Error::Io(e)),
        }
    }

    /// Re-establish the handle after `fork`: the child must not share
    /// its parent's descriptor offset or lock identity. The file has to
    /// still be the same (device, inode); on any failure the handle is
    /// invalidated and every later operation fails.
    pub fn reopen(&mut self) -> Result<()> {
        if self.flags.contains(Flags::INTERNAL) {
            // Nothing is shared with the parent.
            return Ok(());
        }
        self.munmap();
        self.file = None;

        let res = (|| -> io::Result<std::fs::File> {
            let name = self
                .name
                .as_deref()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
            let file = OpenOptions::new()
                .read(true)
                .write(!self.read_only)
                .open(name)?;
            let md = file.metadata()?;
            if md.ino() != self.inode || md.dev() != self.device {
                return Err(io::Error::other("database file was replaced"));
            }
            Ok(file)
        })();
        match res {
            Ok(file) => self.file = Some(file),
            Err(e) => {
                error!("reopen failed: {e}");
                self.invalidate();
                return Err(Error::Io(e));
            }
        }

        self.mmap();
        if self
            .brlock(ACTIVE_LOCK, libc::F_RDLCK as i32, true, false)
            .is_err()
        {
            error!("reopen: failed to obtain active lock");
            self.invalidate();
            return Err(Error::Lock);
        }
        Ok(())
    }

    fn invalidate(&mut self) {
        self.map = None;
        self.file = None;
        if self.registered {
            registry::unregister(self.device, self.inode);
            self.registered = false;
        }
    }

    /// Close the database; dropping the handle is equivalent.
    pub fn close(self) -> Result<()> {
        Ok(())
    }
}
