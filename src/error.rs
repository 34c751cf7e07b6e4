//! Error handling for the key/value storage engine.
//!
//! There is no rollback journal and no automatic retries: every failure is
//! surfaced to the caller as an [`Error`], carrying the most specific cause
//! available.

use std::fmt;

/// The single error channel the engine reports failures through.
#[derive(Debug)]
pub enum Error {
    /// Invalid mode string, invalid hash index, invalid allocator, or a
    /// corrupt/mismatched header.
    InvalidArgument(String),
    /// `get`/`next` attempted on a write-only handle.
    PermissionDenied(String),
    /// `get`/`delete` of a key that does not exist.
    NotFound,
    /// No free extent was large enough and there was no room left to
    /// append, or an internal counter (e.g. block count) hit its ceiling.
    OutOfSpace(String),
    /// A header, block, or directory entry failed a structural check
    /// (bad magic number, short read where a full record was expected).
    Corrupt(String),
    /// A positioned read/write/seek failed, or another filesystem
    /// operation failed.
    Io(std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::PermissionDenied(msg) => write!(f, "permission denied: {msg}"),
            Error::NotFound => write!(f, "key not found"),
            Error::OutOfSpace(msg) => write!(f, "out of space: {msg}"),
            Error::Corrupt(msg) => write!(f, "corrupt database: {msg}"),
            Error::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl PartialEq for Error {
    /// Two errors are equal if they carry the same kind and message. This is
    /// only meant for tests asserting on error *kind*, not a general-purpose
    /// comparison (io::Error itself is not PartialEq).
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::InvalidArgument(a), Error::InvalidArgument(b)) => a == b,
            (Error::PermissionDenied(a), Error::PermissionDenied(b)) => a == b,
            (Error::NotFound, Error::NotFound) => true,
            (Error::OutOfSpace(a), Error::OutOfSpace(b)) => a == b,
            (Error::Corrupt(a), Error::Corrupt(b)) => a == b,
            (Error::Io(a), Error::Io(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}
