//! Error types for cryptfs

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the filesystem core, codecs and configuration
#[derive(Error, Debug)]
pub enum Error {
    /// No open file state exists for the path
    #[error("No open file state for {}", .0.display())]
    NotFound(PathBuf),

    /// The path already has an open file state
    #[error("File state already open for {}", .0.display())]
    Conflict(PathBuf),

    /// Encrypting or decrypting file content failed
    #[error("Codec error: {0}")]
    Codec(String),

    /// The backing storage rejected a read, write or sync
    #[error("Storage error: {0}")]
    Storage(#[from] io::Error),

    /// The path does not stay inside the backing root
    #[error("Invalid path: {}", .0.display())]
    InvalidPath(PathBuf),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::Storage(io::Error::from(e))
    }
}

impl Error {
    /// Convert to the errno reported back through FUSE
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::NotFound(_) => libc::EBADF,
            Error::Conflict(_) => libc::EBUSY,
            Error::Storage(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::InvalidPath(_) => libc::EACCES,
            Error::Codec(_)
            | Error::Config(_)
            | Error::InvalidConfig(_)
            | Error::KeyDerivation(_)
            | Error::Internal(_) => libc::EIO,
        }
    }

    /// True for failures of the underlying storage
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Storage(_))
    }
}
