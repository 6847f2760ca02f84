//! Error types for the file-system core
//!
//! Every public operation returns one of a closed error set rather than
//! panicking. We use `thiserror` for automatic `Display` and `Error` trait
//! implementations.

use std::io;
use thiserror::Error;

/// Result type alias for file-system operations
pub type FsResult<T> = std::result::Result<T, FsError>;

/// Closed error set for the file-system core
#[derive(Debug, Error)]
pub enum FsError {
    /// Logical or physical path does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Destination already exists (duplicate creation, atomic-dump race)
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Operation expected a file but found a directory
    #[error("Is a directory: {0}")]
    IsDirectory(String),

    /// Operation expected a directory but found a file
    #[error("Not a directory: {0}")]
    NotADirectory(String),

    /// Refcount or consistency violation: remove-while-referenced,
    /// open-type mismatch on a cache hit, inconsistent package layout
    #[error("Inconsistent state: {0}")]
    Inconsistent(String),

    /// Operation is meaningless for the chosen storage variant
    #[error("Not supported: {0}")]
    NotSupported(&'static str),

    /// Out-of-range offset, unsorted batch read, or similar caller mistake
    #[error("Bad arguments: {0}")]
    BadArgs(String),

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Meta document encode/decode failure
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl FsError {
    /// Map an `io::Error` to the closed error set, preserving the
    /// NotFound / AlreadyExists distinction, with `path` for context.
    pub fn from_io(err: io::Error, path: &str) -> FsError {
        match err.kind() {
            io::ErrorKind::NotFound => FsError::NotFound(path.to_string()),
            io::ErrorKind::AlreadyExists => FsError::AlreadyExists(path.to_string()),
            _ => FsError::Io(err),
        }
    }

    /// True for the codes that indicate a lost race rather than a bug.
    pub fn is_race(&self) -> bool {
        matches!(self, FsError::NotFound(_) | FsError::AlreadyExists(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_not_found() {
        let err = FsError::NotFound("/segment_0/posting".to_string());
        assert!(err.to_string().contains("Not found"));
        assert!(err.to_string().contains("/segment_0/posting"));
    }

    #[test]
    fn test_display_inconsistent() {
        let err = FsError::Inconsistent("node still referenced".to_string());
        assert!(err.to_string().contains("Inconsistent"));
    }

    #[test]
    fn test_from_io_not_found() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        let err = FsError::from_io(io_err, "/a/b");
        assert!(matches!(err, FsError::NotFound(_)));
    }

    #[test]
    fn test_from_io_already_exists() {
        let io_err = io::Error::new(io::ErrorKind::AlreadyExists, "dup");
        let err = FsError::from_io(io_err, "/a/b");
        assert!(matches!(err, FsError::AlreadyExists(_)));
    }

    #[test]
    fn test_from_io_other() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let err = FsError::from_io(io_err, "/a/b");
        assert!(matches!(err, FsError::Io(_)));
    }

    #[test]
    fn test_is_race() {
        assert!(FsError::NotFound(String::new()).is_race());
        assert!(FsError::AlreadyExists(String::new()).is_race());
        assert!(!FsError::BadArgs(String::new()).is_race());
    }
}
