//! Error types for the vmdkread core library.

use std::path::PathBuf;

/// The main error type for vmdkread operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid caller supplied value (zero, empty, out of domain).
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// An object that can only be initialized once was initialized again.
    #[error("already initialized: {message}")]
    AlreadyInitialized { message: String },

    /// Memory for a table could not be reserved.
    #[error("allocation failure: {message}")]
    AllocationFailure { message: String },

    /// A size computation would exceed the addressable limit.
    #[error("capacity exceeded: {message}")]
    CapacityExceeded { message: String },

    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// A read returned fewer bytes than required or the source was closed.
    #[error("read error: {message}")]
    Read { message: String },

    /// A requested offset lies outside the source.
    #[error("seek error: {message}")]
    Seek { message: String },

    /// Malformed on-disk structure.
    #[error("invalid format: {message}")]
    InvalidFormat { message: String },

    /// Unsupported access mode, file role or format feature.
    #[error("unsupported: {message}")]
    Unsupported { message: String },

    /// An index or offset outside the valid range.
    #[error("out of range: {message}")]
    OutOfRange { message: String },

    /// A required value or child object is absent.
    #[error("missing data: {message}")]
    MissingData { message: String },

    /// A filename too short to carry anything besides an extension.
    #[error("filename too small: '{name}'")]
    TooSmall { name: String },

    /// The operation stopped because abort was signalled.
    #[error("aborted: {message}")]
    Aborted { message: String },
}

/// A specialized Result type for vmdkread operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Fieldless discriminant of [`Error`], convenient for matching categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    AlreadyInitialized,
    AllocationFailure,
    CapacityExceeded,
    Io,
    Read,
    Seek,
    InvalidFormat,
    Unsupported,
    OutOfRange,
    MissingData,
    TooSmall,
    Aborted,
}

impl Error {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::AlreadyInitialized { .. } => ErrorKind::AlreadyInitialized,
            Self::AllocationFailure { .. } => ErrorKind::AllocationFailure,
            Self::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            Self::Io { .. } => ErrorKind::Io,
            Self::Read { .. } => ErrorKind::Read,
            Self::Seek { .. } => ErrorKind::Seek,
            Self::InvalidFormat { .. } => ErrorKind::InvalidFormat,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::OutOfRange { .. } => ErrorKind::OutOfRange,
            Self::MissingData { .. } => ErrorKind::MissingData,
            Self::TooSmall { .. } => ErrorKind::TooSmall,
            Self::Aborted { .. } => ErrorKind::Aborted,
        }
    }

    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn already_initialized(message: impl Into<String>) -> Self {
        Self::AlreadyInitialized {
            message: message.into(),
        }
    }

    pub fn allocation_failure(message: impl Into<String>) -> Self {
        Self::AllocationFailure {
            message: message.into(),
        }
    }

    pub fn capacity_exceeded(message: impl Into<String>) -> Self {
        Self::CapacityExceeded {
            message: message.into(),
        }
    }

    pub fn read(message: impl Into<String>) -> Self {
        Self::Read {
            message: message.into(),
        }
    }

    pub fn seek(message: impl Into<String>) -> Self {
        Self::Seek {
            message: message.into(),
        }
    }

    /// Create an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Create an unsupported error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    pub fn out_of_range(message: impl Into<String>) -> Self {
        Self::OutOfRange {
            message: message.into(),
        }
    }

    pub fn missing_data(message: impl Into<String>) -> Self {
        Self::MissingData {
            message: message.into(),
        }
    }

    pub fn too_small(name: impl Into<String>) -> Self {
        Self::TooSmall { name: name.into() }
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::Aborted {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(source: std::collections::TryReserveError) -> Self {
        Self::allocation_failure(source.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_with_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::io(io_err, "/path/to/disk-s001.vmdk");
        let msg = err.to_string();
        assert!(msg.contains("I/O error"));
        assert!(msg.contains("/path/to/disk-s001.vmdk"));
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_io_error_without_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::io_simple(io_err);
        assert!(!err.to_string().contains("at '"));
    }

    #[test]
    fn test_invalid_format_error() {
        let err = Error::invalid_format("grain table size not a multiple of 4");
        assert!(err.to_string().contains("invalid format"));
        assert_eq!(err.kind(), ErrorKind::InvalidFormat);
    }

    #[test]
    fn test_too_small_error() {
        let err = Error::too_small("a.vm");
        assert!(err.to_string().contains("'a.vm'"));
        assert_eq!(err.kind(), ErrorKind::TooSmall);
    }

    #[test]
    fn test_aborted_is_distinct_from_io() {
        let err = Error::aborted("abort signalled before segment 2");
        assert_eq!(err.kind(), ErrorKind::Aborted);
        assert_ne!(err.kind(), ErrorKind::Read);
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io { path: None, .. }));
    }

    #[test]
    fn test_from_try_reserve_error() {
        let mut v: Vec<u8> = Vec::new();
        let reserve_err = v.try_reserve(usize::MAX).unwrap_err();
        let err: Error = reserve_err.into();
        assert_eq!(err.kind(), ErrorKind::AllocationFailure);
    }
}
