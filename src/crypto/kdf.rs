//! Password to content-key schedule
//!
//! Argon2id stretches the password with the configured salt into a master
//! secret. HKDF-SHA256 then splits that secret into the AEAD key that seals
//! file content and the MAC key that synthesizes nonces. The master secret
//! never leaves this module.

use crate::config::CodecConfig;
use crate::crypto::{KEY_SIZE, SALT_SIZE};
use crate::error::{Error, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use ring::hkdf;
use zeroize::Zeroizing;

const HKDF_SALT: &[u8] = b"cryptfs-v1";
const CONTENT_KEY_INFO: &[u8] = b"content-key";
const NONCE_KEY_INFO: &[u8] = b"nonce-key";

type KeyBytes = Zeroizing<[u8; KEY_SIZE]>;

/// The two keys a content codec is built from
pub struct ContentKeys {
    content: KeyBytes,
    nonce: KeyBytes,
}

impl ContentKeys {
    /// AES-256-GCM key for file content
    pub fn content_key(&self) -> &[u8] {
        &self.content[..]
    }

    /// HMAC-SHA256 key for synthetic nonces
    pub fn nonce_key(&self) -> &[u8] {
        &self.nonce[..]
    }
}

/// Keys for the salt stored in `config`
///
/// The salt must be exactly the size `init` writes; anything else means the
/// configuration was edited or truncated.
pub fn content_keys(password: &[u8], config: &CodecConfig) -> Result<ContentKeys> {
    let salt: &[u8; SALT_SIZE] = config.salt.as_slice().try_into().map_err(|_| {
        Error::InvalidConfig(format!(
            "Salt must be {} bytes, found {}",
            SALT_SIZE,
            config.salt.len()
        ))
    })?;

    let master = stretch(password, salt, config)?;
    split(&master[..])
}

/// Fresh random salt for a new configuration
pub fn new_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

fn stretch(password: &[u8], salt: &[u8; SALT_SIZE], config: &CodecConfig) -> Result<KeyBytes> {
    let params = Params::new(
        config.argon2_memory_kib,
        config.argon2_iterations,
        config.argon2_parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| Error::KeyDerivation(format!("Invalid Argon2 parameters: {}", e)))?;

    let mut master = Zeroizing::new([0u8; KEY_SIZE]);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password_into(password, salt, &mut master[..])
        .map_err(|e| Error::KeyDerivation(format!("Argon2id failed: {}", e)))?;
    Ok(master)
}

fn split(master: &[u8]) -> Result<ContentKeys> {
    let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, HKDF_SALT).extract(master);
    Ok(ContentKeys {
        content: expand(&prk, CONTENT_KEY_INFO)?,
        nonce: expand(&prk, NONCE_KEY_INFO)?,
    })
}

fn expand(prk: &hkdf::Prk, info: &[u8]) -> Result<KeyBytes> {
    let info = [info];
    let okm = prk
        .expand(&info, hkdf::HKDF_SHA256)
        .map_err(|_| Error::KeyDerivation("HKDF expand failed".to_string()))?;
    let mut out = Zeroizing::new([0u8; KEY_SIZE]);
    okm.fill(&mut out[..])
        .map_err(|_| Error::KeyDerivation("HKDF fill failed".to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_salt(salt: &[u8]) -> CodecConfig {
        CodecConfig {
            argon2_memory_kib: 1024,
            argon2_iterations: 1,
            argon2_parallelism: 1,
            salt: salt.to_vec(),
            ..CodecConfig::default()
        }
    }

    #[test]
    fn test_keys_are_stable_for_same_salt() {
        let config = config_with_salt(&new_salt());
        let a = content_keys(b"password", &config).unwrap();
        let b = content_keys(b"password", &config).unwrap();

        assert_eq!(a.content_key(), b.content_key());
        assert_eq!(a.nonce_key(), b.nonce_key());
        assert_eq!(a.content_key().len(), KEY_SIZE);
    }

    #[test]
    fn test_content_and_nonce_keys_differ() {
        let keys = content_keys(b"password", &config_with_salt(&new_salt())).unwrap();
        assert_ne!(keys.content_key(), keys.nonce_key());
    }

    #[test]
    fn test_password_and_salt_both_matter() {
        let salt = new_salt();
        let base = content_keys(b"password", &config_with_salt(&salt)).unwrap();
        let other_pw = content_keys(b"passw0rd", &config_with_salt(&salt)).unwrap();
        let other_salt = content_keys(b"password", &config_with_salt(&new_salt())).unwrap();

        assert_ne!(base.content_key(), other_pw.content_key());
        assert_ne!(base.content_key(), other_salt.content_key());
    }

    #[test]
    fn test_salt_must_have_exact_size() {
        for salt in [&[][..], &[7u8; 3][..], &[7u8; SALT_SIZE + 1][..]] {
            assert!(matches!(
                content_keys(b"password", &config_with_salt(salt)),
                Err(Error::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_zero_argon2_cost_rejected() {
        let mut config = config_with_salt(&new_salt());
        config.argon2_iterations = 0;
        assert!(matches!(
            content_keys(b"password", &config),
            Err(Error::KeyDerivation(_))
        ));
    }
}
