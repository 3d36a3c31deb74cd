//! Error types for cache operations.

use std::fmt;
use std::io;

/// Errors that can occur during cache operations.
#[derive(Debug)]
pub enum CacheError {
    /// Write was rejected because the cache is at or above its write
    /// rejection threshold, or the write stall budget was exhausted.
    WriteRejected,

    /// Index insert failed because a freshly-rehashed slot overflowed
    /// before the rehash completed. The facade maps this to `WriteRejected`.
    InsertFailed,

    /// No storage segment available for allocation.
    OutOfMemory,

    /// Item rank is outside `[0, num_ranks)`.
    InvalidRank,

    /// Key is empty.
    InvalidKey,

    /// Serialized item does not fit into a single segment.
    ItemTooLarge,

    /// Persisted data failed validation (bad magic, truncated stream).
    Corrupted,

    /// Invalid configuration detected at startup.
    Config(String),

    /// Underlying I/O failure.
    Io(io::Error),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WriteRejected => write!(f, "write rejected"),
            Self::InsertFailed => write!(f, "index insert failed during rehash"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::InvalidRank => write!(f, "rank out of range"),
            Self::InvalidKey => write!(f, "invalid key"),
            Self::ItemTooLarge => write!(f, "item larger than segment"),
            Self::Corrupted => write!(f, "data corrupted"),
            Self::Config(msg) => write!(f, "invalid configuration: {}", msg),
            Self::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CacheError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", CacheError::WriteRejected), "write rejected");
        assert_eq!(format!("{}", CacheError::OutOfMemory), "out of memory");
        assert_eq!(format!("{}", CacheError::InvalidRank), "rank out of range");
        assert_eq!(
            format!("{}", CacheError::ItemTooLarge),
            "item larger than segment"
        );
        assert_eq!(
            format!("{}", CacheError::Config("bad ratio".to_string())),
            "invalid configuration: bad ratio"
        );
    }

    #[test]
    fn test_error_from_io() {
        let err: CacheError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, CacheError::Io(_)));
        assert!(format!("{}", err).contains("gone"));
    }

    #[test]
    fn test_error_is_error_trait() {
        fn assert_error<E: std::error::Error>() {}
        assert_error::<CacheError>();
    }
}
