//! Content codecs for cryptfs
//!
//! A codec turns a whole plaintext file buffer into the bytes stored on the
//! backing filesystem and back again. Codecs must satisfy
//! `decrypt(encrypt(b)) == b` for every buffer `b`.

mod aes;
mod codec;
mod kdf;

pub use aes::AesGcmCodec;
pub use codec::{codec_from_config, init_codec_config, EncryptionCodec, IdentityCodec, ReverseCodec};
pub use kdf::{content_keys, new_salt, ContentKeys};

/// Size of AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of GCM nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of GCM authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Size of salt for key derivation
pub const SALT_SIZE: usize = 32;
