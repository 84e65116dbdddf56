//! cryptfs - Encrypting passthrough filesystem
//!
//! This library provides a FUSE filesystem that mirrors a backing directory
//! and stores every regular file's content through a codec. Open files are
//! held as whole plaintext buffers and re-encrypted on flush.

pub mod config;
pub mod crypto;
pub mod error;
pub mod fs;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::crypto::EncryptionCodec;
    pub use crate::error::{Error, Result};
    pub use crate::fs::{EncryptedFs, FsOperations};
}
