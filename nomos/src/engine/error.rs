/*
 * This file is a part of Nomos
*/

use core::fmt;
use std::io;

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors arising from the storage engine. Grounded in the teacher's
/// `storage::v1::error::StorageEngineError` -- a flat enum rather than a tree
/// of `From` impls per subsystem, since the engine has only one real I/O
/// boundary (the filesystem and the replication socket).
#[derive(Debug)]
pub enum EngineError {
    /// Key missing, tombstoned or expired.
    NotFound,
    /// Top-level already exists / invalid name / type mismatch.
    Conflict(String),
    /// Filesystem or socket error.
    Io(io::Error),
    /// A buffer-read overrun during load/pack; the surrounding operation
    /// aborts rather than silently truncating in-memory state.
    Corruption(String),
    /// A segment's metadata disagrees with the top-level's current
    /// `MetaData`. Treated as corruption of that one file.
    VersionMismatch { expected: (u8, u8), found: (u8, u8) },
    /// `exit_flush` has already run; no new mutations are accepted.
    ShuttingDown,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "key not found"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Corruption(msg) => write!(f, "corrupted: {msg}"),
            Self::VersionMismatch { expected, found } => write!(
                f,
                "version mismatch: expected sub/item types {expected:?}, found {found:?}"
            ),
            Self::ShuttingDown => write!(f, "server is shutting down, no new work accepted"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<io::Error> for EngineError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

pub trait ErrorContext<T> {
    fn context(self, extra: impl ToString) -> EngineResult<T>;
}

impl<T> ErrorContext<T> for io::Result<T> {
    fn context(self, extra: impl ToString) -> EngineResult<T> {
        self.map_err(|e| {
            let kind = e.kind();
            EngineError::Io(io::Error::new(kind, format!("{}: {e}", extra.to_string())))
        })
    }
}
