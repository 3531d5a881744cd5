use std::io;
use std::path::PathBuf;

/// The error type for cache writes and cache setup.
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("The cache directory {0:?} could not be created: {1}")]
    DirectoryCreation(PathBuf, io::Error),

    #[error("The staging directory {0:?} could not be cleaned up: {1}")]
    StagingCleanup(PathBuf, io::Error),

    #[error("The temporary file could not be created: {0}")]
    TempFileCreation(io::Error),

    #[error("The temporary file could not be written: {0}")]
    TempFileWrite(io::Error),

    #[error("The temporary file could not be renamed to the destination file: {0}")]
    RenameError(io::Error),

    #[error("The cache entry at {0:?} could not be deleted: {1}")]
    Deletion(PathBuf, io::Error),
}

/// The error type for reading an entry file back.
#[derive(thiserror::Error, Debug)]
pub enum EntryDecodeError {
    #[error("Not a cache entry file (bad magic bytes)")]
    BadMagic,

    #[error("Truncated entry file: {0}")]
    Truncated(#[from] io::Error),

    #[error("Unknown entry kind {0}")]
    UnknownKind(u8),

    #[error("The stored address table could not be decoded: {0}")]
    Table(#[from] crashsym_table::DecodeError),

    #[error("The stored reason string is not valid UTF-8")]
    BadReason,
}
