//! AES-256-GCM content codec
//!
//! Stored layout is `nonce || ciphertext || tag`. The nonce is synthesized
//! from an HMAC of the plaintext, so the same content always seals to the
//! same bytes and repeated flushes leave the backing file unchanged.

use crate::crypto::{codec::EncryptionCodec, ContentKeys, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::hmac;

/// Known plaintext sealed into the config to detect a wrong password
const VERIFIER_PLAINTEXT: &[u8] = b"cryptfs key verifier";

/// AES-256-GCM codec with deterministic synthetic nonces
pub struct AesGcmCodec {
    content_key: LessSafeKey,
    nonce_key: hmac::Key,
}

impl AesGcmCodec {
    /// Build the codec from password-derived keys
    pub fn new(keys: &ContentKeys) -> Result<Self> {
        let unbound = UnboundKey::new(&AES_256_GCM, keys.content_key())
            .map_err(|_| Error::KeyDerivation("Invalid AES-256-GCM key".to_string()))?;

        Ok(Self {
            content_key: LessSafeKey::new(unbound),
            nonce_key: hmac::Key::new(hmac::HMAC_SHA256, keys.nonce_key()),
        })
    }

    /// Seal the known verifier plaintext under this key
    pub fn seal_verifier(&self) -> Result<Vec<u8>> {
        self.encrypt(VERIFIER_PLAINTEXT)
    }

    /// Check a verifier produced by [`seal_verifier`](Self::seal_verifier)
    pub fn check_verifier(&self, verifier: &[u8]) -> Result<()> {
        match self.decrypt(verifier) {
            Ok(plain) if plain == VERIFIER_PLAINTEXT => Ok(()),
            _ => Err(Error::KeyDerivation(
                "Wrong password: key verifier does not match".to_string(),
            )),
        }
    }

    fn synthetic_nonce(&self, plaintext: &[u8]) -> [u8; NONCE_SIZE] {
        let tag = hmac::sign(&self.nonce_key, plaintext);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&tag.as_ref()[..NONCE_SIZE]);
        nonce
    }
}

impl EncryptionCodec for AesGcmCodec {
    fn name(&self) -> &'static str {
        "aes256gcm"
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce_bytes = self.synthetic_nonce(plaintext);

        let mut in_out = plaintext.to_vec();
        self.content_key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| Error::Codec("AES-GCM seal failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + in_out.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&in_out);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        // Created but never flushed
        if ciphertext.is_empty() {
            return Ok(Vec::new());
        }

        if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
            return Err(Error::Codec(format!(
                "Ciphertext too short: {} bytes, need at least {}",
                ciphertext.len(),
                NONCE_SIZE + TAG_SIZE
            )));
        }

        let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_SIZE);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| Error::Codec("Invalid nonce".to_string()))?;

        let mut in_out = sealed.to_vec();
        let plain_len = self
            .content_key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| Error::Codec("Authentication failed: content corrupted or wrong key".to_string()))?
            .len();
        in_out.truncate(plain_len);
        Ok(in_out)
    }

    fn plaintext_len(&self, ciphertext_len: u64) -> u64 {
        ciphertext_len.saturating_sub((NONCE_SIZE + TAG_SIZE) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CodecConfig;
    use crate::crypto::{content_keys, new_salt};

    fn test_codec(password: &[u8], salt: &[u8]) -> AesGcmCodec {
        let config = CodecConfig {
            argon2_memory_kib: 1024,
            argon2_iterations: 1,
            argon2_parallelism: 1,
            salt: salt.to_vec(),
            ..CodecConfig::default()
        };
        AesGcmCodec::new(&content_keys(password, &config).unwrap()).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let codec = test_codec(b"password", &new_salt());

        let cases: [&[u8]; 4] = [b"", b"x", b"hello world", &[0u8; 4096]];
        for data in cases {
            let sealed = codec.encrypt(data).unwrap();
            assert_eq!(sealed.len(), data.len() + NONCE_SIZE + TAG_SIZE);
            assert_eq!(codec.plaintext_len(sealed.len() as u64), data.len() as u64);
            assert_eq!(codec.decrypt(&sealed).unwrap(), data);
        }
    }

    #[test]
    fn test_encrypt_is_deterministic() {
        let codec = test_codec(b"password", &new_salt());
        let a = codec.encrypt(b"same content").unwrap();
        let b = codec.encrypt(b"same content").unwrap();
        let c = codec.encrypt(b"other content").unwrap();
        assert_eq!(a, b);
        assert_ne!(&a[..NONCE_SIZE], &c[..NONCE_SIZE]);
    }

    #[test]
    fn test_ciphertext_hides_plaintext() {
        let codec = test_codec(b"password", &new_salt());
        let sealed = codec.encrypt(b"secret secret secret").unwrap();
        assert!(!sealed.windows(6).any(|w| w == b"secret"));
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let codec = test_codec(b"password", &new_salt());
        let mut sealed = codec.encrypt(b"hello world").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(codec.decrypt(&sealed), Err(Error::Codec(_))));
    }

    #[test]
    fn test_truncated_ciphertext_rejected() {
        let codec = test_codec(b"password", &new_salt());
        let sealed = codec.encrypt(b"hello world").unwrap();
        assert!(matches!(codec.decrypt(&sealed[..10]), Err(Error::Codec(_))));
        assert!(matches!(
            codec.decrypt(&sealed[..sealed.len() - 1]),
            Err(Error::Codec(_))
        ));
    }

    #[test]
    fn test_empty_ciphertext_is_empty_file() {
        let codec = test_codec(b"password", &new_salt());
        assert!(codec.decrypt(&[]).unwrap().is_empty());
        assert_eq!(codec.plaintext_len(0), 0);
    }

    #[test]
    fn test_verifier_detects_wrong_password() {
        let salt = new_salt();
        let codec = test_codec(b"right", &salt);
        let verifier = codec.seal_verifier().unwrap();

        assert!(codec.check_verifier(&verifier).is_ok());
        assert!(test_codec(b"right", &salt).check_verifier(&verifier).is_ok());
        assert!(test_codec(b"wrong", &salt).check_verifier(&verifier).is_err());
    }
}
