//! Error types for BurstFS
//!
//! Every client operation reports failures through [`Error`]. The
//! interception layer turns them into POSIX error numbers with
//! [`Error::errno`].

use thiserror::Error;

/// Common result type for BurstFS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for BurstFS
#[derive(Debug, Error)]
pub enum Error {
    // Allocation errors
    #[error("no free {0} left")]
    Exhausted(&'static str),

    #[error("no space left: {0}")]
    NoSpace(String),

    // Namespace errors
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("path is {len} bytes, limit is {max}")]
    NameTooLong { len: usize, max: usize },

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    // Lower layer errors
    #[error("I/O error: {0}")]
    Io(String),

    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Setup errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("superblock layout error: {0}")]
    Layout(String),
}

impl Error {
    /// Opaque lower-layer failure
    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn no_space(msg: impl Into<String>) -> Self {
        Self::NoSpace(msg.into())
    }

    /// Check if this error means the thing looked up does not exist
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// POSIX error number handed back to the application
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::Exhausted(_) => libc::ENFILE,
            Self::NoSpace(_) => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::AlreadyExists(_) => libc::EEXIST,
            Self::NameTooLong { .. } => libc::ENAMETOOLONG,
            Self::NotADirectory(_) => libc::ENOTDIR,
            Self::IsADirectory(_) => libc::EISDIR,
            Self::DiskIo(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::Io(_) | Self::Layout(_) => libc::EIO,
            Self::InvalidArgument(_) | Self::Configuration(_) => libc::EINVAL,
        }
    }
}
