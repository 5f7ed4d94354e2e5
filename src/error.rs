use crate::prelude::*;
use thiserror::Error;

/// The error taxonomy surfaced by the repository synchronizer.
///
/// Mirrors the result codes a sync can end in: `NoError` is the default,
/// everything else names a specific way a directory or file update failed.
/// `PartialUpdate` is never assigned directly -- it's computed by
/// [`crate::repository::Repository::failure`] when `status == NoError` but
/// the failure list is non-empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    NoError,
    NotFound,
    Socket,
    Io,
    Checksum,
    FileNotFound,
    Http,
    Cancelled,
    PartialUpdate,
}

impl Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResultCode::NoError => "no error",
            ResultCode::NotFound => "not found",
            ResultCode::Socket => "socket error",
            ResultCode::Io => "I/O error",
            ResultCode::Checksum => "checksum verification error",
            ResultCode::FileNotFound => "file not found",
            ResultCode::Http => "HTTP-level error",
            ResultCode::Cancelled => "cancelled",
            ResultCode::PartialUpdate => "partial update (incomplete)",
        };
        write!(f, "{s}")
    }
}

#[derive(Error, Debug)]
pub enum TerrasyncError {
    #[error("dirindex line references unsafe child name {name:?}")]
    UnsafeChildName { name: String },
    #[error("archive entry has an unsafe path {path:?}")]
    UnsafeArchivePath { path: String },
    #[error("archive data is invalid or truncated")]
    BadArchive,
    #[error("hash cache entry for {path} is malformed")]
    MalformedHashCacheEntry { path: String },
}
