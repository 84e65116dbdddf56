//! Codec trait and the non-cryptographic codecs

use crate::config::{CodecConfig, CodecKind};
use crate::crypto::{content_keys, new_salt, AesGcmCodec};
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::info;

/// Whole-buffer transform between plaintext and stored bytes
///
/// Implementations must be invertible: `decrypt(encrypt(b)) == b`. The
/// encoding is applied to the entire file on every flush and every open.
pub trait EncryptionCodec: Send + Sync {
    /// Short identifier used in logs and configuration
    fn name(&self) -> &'static str;

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Plaintext size of a stored file of `ciphertext_len` bytes
    fn plaintext_len(&self, ciphertext_len: u64) -> u64 {
        ciphertext_len
    }
}

/// Stores content unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityCodec;

impl EncryptionCodec for IdentityCodec {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }
}

/// Stores content with its byte order reversed
///
/// Not a cipher. Useful for checking that nothing bypasses the codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReverseCodec;

impl EncryptionCodec for ReverseCodec {
    fn name(&self) -> &'static str {
        "reverse"
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.iter().rev().copied().collect())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(ciphertext.iter().rev().copied().collect())
    }
}

/// Prepare the codec section of a fresh configuration
///
/// For AES this generates the salt and seals the key verifier, so the
/// caller must save the configuration afterwards.
pub fn init_codec_config(config: &mut CodecConfig, password: Option<&[u8]>) -> Result<()> {
    if config.kind != CodecKind::Aes256Gcm {
        return Ok(());
    }

    let password = password.ok_or_else(|| {
        Error::InvalidConfig("A password is required for the aes256gcm codec".to_string())
    })?;

    config.salt = new_salt().to_vec();
    let codec = AesGcmCodec::new(&content_keys(password, config)?)?;
    config.verifier = codec.seal_verifier()?;
    info!("Generated new salt and key verifier");
    Ok(())
}

/// Build the codec described by the configuration
pub fn codec_from_config(
    config: &CodecConfig,
    password: Option<&[u8]>,
) -> Result<Arc<dyn EncryptionCodec>> {
    match config.kind {
        CodecKind::Identity => Ok(Arc::new(IdentityCodec)),
        CodecKind::Reverse => Ok(Arc::new(ReverseCodec)),
        CodecKind::Aes256Gcm => {
            let password = password.ok_or_else(|| {
                Error::InvalidConfig("A password is required for the aes256gcm codec".to_string())
            })?;
            if config.salt.is_empty() {
                return Err(Error::InvalidConfig(
                    "No salt configured; run `cryptfs init` first".to_string(),
                ));
            }

            let codec = AesGcmCodec::new(&content_keys(password, config)?)?;
            if !config.verifier.is_empty() {
                codec.check_verifier(&config.verifier)?;
            }
            Ok(Arc::new(codec))
        }
    }
}
