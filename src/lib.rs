//! Single-file, memory-mapped, hash-bucketed key/value store.
//!
//! One file holds a fixed header, an array of hash-chain heads, and an
//! arena of variable-size records threaded into per-bucket chains plus a
//! free list. Multiple processes share the file safely through advisory
//! byte-range locks: a bring-up lock taken during open, one lock per
//! chain, an allocation lock serializing the free list, and per-record
//! locks that let traversals tolerate concurrent deletion.
//!
//! A handle is not thread-safe: operations take `&mut self` and callers
//! serialize access to one handle. Concurrency happens across processes
//! (or across separate handles in cooperating processes).

mod alloc;
mod chain;
mod error;
mod io;
mod layout;
mod lock;
mod open;
mod registry;
mod traverse;

use std::fs::File;
use std::path::{Path, PathBuf};

pub use crate::error::{Error, ErrorKind, Result};

use crate::io::Mapping;
use crate::layout::Header;
use crate::traverse::TraverseLock;

/// Open-time behavior flags. Combine with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u32);

impl Flags {
    /// Truncate the database if we are the first opener.
    pub const CLEAR_IF_FIRST: Flags = Flags(1);
    /// Memory-only store: no file, no locking, starts cleared.
    pub const INTERNAL: Flags = Flags(2);
    /// Single-process use: skip all locking.
    pub const NOLOCK: Flags = Flags(4);
    /// Never mmap; always go through positional file I/O.
    pub const NOMMAP: Flags = Flags(8);
    /// Write the opposite byte order (set automatically when an opened
    /// file carries a byte-reversed version word).
    pub const CONVERT: Flags = Flags(16);

    pub const fn empty() -> Flags {
        Flags(0)
    }

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// How `store` treats an existing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Store the value whether or not the key exists.
    Replace,
    /// Fail with `Exists` if the key is already present.
    Insert,
    /// Fail with `NoExist` if the key is absent.
    Modify,
}

/// A handle on one database file.
///
/// The file on disk is the single source of truth; the handle carries a
/// descriptor, an optional map view aliasing the file, and a cached copy
/// of the header that is only trusted under an appropriate lock.
pub struct Tdb {
    pub(crate) name: Option<PathBuf>,
    pub(crate) flags: Flags,
    pub(crate) read_only: bool,
    pub(crate) file: Option<File>,
    pub(crate) map: Option<Mapping>,
    pub(crate) map_size: u32,
    pub(crate) header: Header,
    pub(crate) ecode: ErrorKind,
    /// Per-chain nesting counts; index 0 is the allocation lock.
    pub(crate) locked: Vec<u32>,
    /// Traversal cursors; index 0 belongs to `firstkey`/`nextkey`.
    pub(crate) travlocks: Vec<TraverseLock>,
    /// Hashes declared through `lockkeys`, if key locking is active.
    pub(crate) lockedkeys: Option<Vec<u32>>,
    pub(crate) device: u64,
    pub(crate) inode: u64,
    pub(crate) registered: bool,
}

impl Tdb {
    pub(crate) fn bucket(&self, hash: u32) -> u32 {
        hash % self.header.hash_size
    }

    pub(crate) fn convert(&self) -> bool {
        self.flags.contains(Flags::CONVERT)
    }

    /// Record `err` as the handle's last error and return it.
    pub(crate) fn fail<T>(&mut self, err: Error) -> Result<T> {
        self.ecode = err.kind();
        Err(err)
    }

    /// Kind of the last error seen on this handle.
    pub fn error(&self) -> ErrorKind {
        self.ecode
    }

    /// Human-readable form of the last error.
    pub fn errorstr(&self) -> &'static str {
        self.ecode.as_str()
    }

    /// Path of the backing file; `None` for internal stores.
    pub fn name(&self) -> Option<&Path> {
        self.name.as_deref()
    }
}

impl Drop for Tdb {
    fn drop(&mut self) {
        // Closing the descriptor releases every byte-range lock we hold.
        self.map = None;
        self.file = None;
        if self.registered {
            registry::unregister(self.device, self.inode);
            self.registered = false;
        }
    }
}
