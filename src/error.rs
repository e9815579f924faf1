//! Error types for layerfs

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the overlay engine and its ambient layers
#[derive(Debug, Error)]
pub enum Error {
    /// Path resolves to neither an in-memory entry nor a real backing file
    #[error("no such entry: {0}")]
    NotFound(PathBuf),

    /// Failure raised by the passthrough collaborator, passed through verbatim
    #[error("delegated operation failed: {0}")]
    Delegated(#[source] std::io::Error),

    /// In-memory table operation on a key the resolver did not classify as in-memory
    #[error("in-memory table has no entry for {0}")]
    Inconsistent(PathBuf),

    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("is a directory: {0}")]
    IsADirectory(PathBuf),

    #[error("directory not empty: {0}")]
    NotEmpty(PathBuf),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// In-memory file would grow past the configured size limit
    #[error("file too large: {path} ({size} bytes, limit {limit})")]
    FileTooLarge { path: PathBuf, size: u64, limit: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// POSIX error code replied to the kernel for this error
    pub fn errno(&self) -> libc::c_int {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::Delegated(e) | Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Inconsistent(_) => libc::EIO,
            Error::NotADirectory(_) => libc::ENOTDIR,
            Error::IsADirectory(_) => libc::EISDIR,
            Error::NotEmpty(_) => libc::ENOTEMPTY,
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::FileTooLarge { .. } => libc::EFBIG,
            Error::Config(_) | Error::InvalidConfig(_) | Error::Internal(_) => libc::EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_delegated_errno_passes_through() {
        let err = Error::Delegated(io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(err.errno(), libc::EACCES);

        let err = Error::Delegated(io::Error::new(io::ErrorKind::Other, "synthetic"));
        assert_eq!(err.errno(), libc::EIO);
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::NotFound(PathBuf::from("/x")).errno(), libc::ENOENT);
        assert_eq!(Error::Inconsistent(PathBuf::from("/x")).errno(), libc::EIO);
        assert_eq!(Error::NotEmpty(PathBuf::from("/d")).errno(), libc::ENOTEMPTY);
        let err = Error::FileTooLarge {
            path: PathBuf::from("/big"),
            size: 1 << 40,
            limit: 1 << 20,
        };
        assert_eq!(err.errno(), libc::EFBIG);
    }
}
