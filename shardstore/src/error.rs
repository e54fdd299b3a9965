use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::creator::BuildPhase;

/// Errors that can occur when building or reading a shard file
#[derive(Error, Debug)]
pub enum ShardError {
    /// The API was called in a way the caller should never do
    #[error("invalid usage: {0}")]
    Usage(#[from] UsageError),

    /// `finalize` was called with a different number of writes than declared
    #[error("declared {declared} objects but {written} were written")]
    CountMismatch { declared: u64, written: u64 },

    /// The perfect hash could not be built from the given key set
    #[error("finalize failed - possible duplicate key: {reason}")]
    Build { reason: String },

    /// The key is absent from the shard, or has been deleted
    #[error("key not found")]
    NotFound,

    /// The file does not hold what the index claims it does
    #[error("integrity check failed for {}: {reason}; the file may be corrupted", path.display())]
    Integrity { path: PathBuf, reason: String },

    /// IO errors when reading/writing to disk
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Caller bugs. These are never corrected silently.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UsageError {
    #[error("key length is {actual} instead of {expected}")]
    KeyLength { actual: usize, expected: usize },

    #[error("shard creator has not been prepared")]
    NotPrepared,

    #[error("shard creator has already been prepared")]
    AlreadyPrepared,

    #[error("declared number of objects ({declared}) has already been written")]
    Overrun { declared: u64 },

    #[error("shard creator is already {0}")]
    BuildFinished(BuildPhase),

    #[error("object count {0} exceeds the maximum of {max}", max = u32::MAX)]
    TooManyObjects(u64),

    #[error("data region would grow past {max} bytes", max = crate::format::MAX_DATA_OFFSET)]
    DataTooLarge,

    #[error("shard has not been loaded")]
    NotLoaded,

    #[error("shard has already been loaded")]
    AlreadyLoaded,

    #[error("shard is already closed")]
    Closed,
}

/// Flat classification of [`ShardError`] for callers that branch on the kind of failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Usage,
    CountMismatch,
    Build,
    NotFound,
    Integrity,
    Io,
}

pub type Result<T> = std::result::Result<T, ShardError>;

impl ShardError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        ShardError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn integrity(path: &Path, reason: impl Into<String>) -> Self {
        ShardError::Integrity {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ShardError::Usage(_) => ErrorKind::Usage,
            ShardError::CountMismatch { .. } => ErrorKind::CountMismatch,
            ShardError::Build { .. } => ErrorKind::Build,
            ShardError::NotFound => ErrorKind::NotFound,
            ShardError::Integrity { .. } => ErrorKind::Integrity,
            ShardError::Io { .. } => ErrorKind::Io,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ShardError::NotFound)
    }

    /// The OS error code behind an `Io` error, if there is one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            ShardError::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_length_message() {
        let err = ShardError::from(UsageError::KeyLength {
            actual: 3,
            expected: 4,
        });
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(
            err.to_string(),
            "invalid usage: key length is 3 instead of 4"
        );
    }

    #[test]
    fn test_io_error_keeps_path_and_code() {
        let err = ShardError::io(
            Path::new("/no/such/shard"),
            io::Error::from_raw_os_error(2),
        );
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.raw_os_error(), Some(2));
        assert!(err.to_string().contains("/no/such/shard"));
    }

    #[test]
    fn test_only_io_carries_os_code() {
        assert_eq!(ShardError::NotFound.raw_os_error(), None);
        assert!(ShardError::NotFound.is_not_found());
        let err = ShardError::integrity(Path::new("x"), "bad magic");
        assert!(!err.is_not_found());
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }
}
