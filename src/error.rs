//! Error taxonomy. Every operation returns a tagged status; the handle
//! additionally remembers the last error kind for `Tdb::error` /
//! `Tdb::errorstr`.

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Magic, tailer, or version checks failed; the database should be
    /// treated as unsafe to continue.
    #[error("Corrupt database")]
    Corrupt,

    #[error("IO Error: {0}")]
    Io(#[from] io::Error),

    #[error("Locking error")]
    Lock,

    #[error("Out of memory")]
    Oom,

    #[error("Record exists")]
    Exists,

    #[error("Lock exists on other keys")]
    NoLock,

    #[error("Record does not exist")]
    NoExist,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Corrupt => ErrorKind::Corrupt,
            Error::Io(_) => ErrorKind::Io,
            Error::Lock => ErrorKind::Lock,
            Error::Oom => ErrorKind::Oom,
            Error::Exists => ErrorKind::Exists,
            Error::NoLock => ErrorKind::NoLock,
            Error::NoExist => ErrorKind::NoExist,
        }
    }
}

/// The last-error field kept on a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorKind {
    #[default]
    Success,
    Corrupt,
    Io,
    Lock,
    Oom,
    Exists,
    NoLock,
    NoExist,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Success => "Success",
            ErrorKind::Corrupt => "Corrupt database",
            ErrorKind::Io => "IO Error",
            ErrorKind::Lock => "Locking error",
            ErrorKind::Oom => "Out of memory",
            ErrorKind::Exists => "Record exists",
            ErrorKind::NoLock => "Lock exists on other keys",
            ErrorKind::NoExist => "Record does not exist",
        }
    }
}
