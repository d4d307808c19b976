//! Encryption service: AES-256-GCM over opaque byte blobs.
//!
//! Stored layout: `version (1 byte) || nonce (12 bytes) || ciphertext+tag`.
//! Every call draws a fresh random nonce, so encrypting the same plaintext
//! twice yields different blobs.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use secrecy::SecretString;

use crate::error::CryptoError;

/// AES-256 key size in bytes.
pub const KEY_SIZE: usize = 32;

/// Nonce size for AES-GCM (96 bits / 12 bytes).
const NONCE_SIZE: usize = 12;

/// Envelope format version.
const ENVELOPE_VERSION: u8 = 1;

/// Stateless symmetric cipher, constructed once at bootstrap and shared.
pub struct Cipher {
    cipher: Aes256Gcm,
}

impl Cipher {
    /// Build a cipher from raw key bytes.
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: Aes256Gcm::new(&(*key).into()),
        }
    }

    /// Build a cipher from a base64-encoded 32-byte key.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("key is not valid base64: {e}")))?;
        let key: [u8; KEY_SIZE] = raw.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("expected {KEY_SIZE} bytes, got {}", raw.len()))
        })?;
        Ok(Self::new(&key))
    }

    /// Encrypt an opaque blob.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CryptoError::Encryption(format!("AES-GCM encryption failed: {e}")))?;

        let mut combined = Vec::with_capacity(1 + NONCE_SIZE + ciphertext.len());
        combined.push(ENVELOPE_VERSION);
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(combined)
    }

    /// Decrypt a blob produced by [`Cipher::encrypt`].
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let Some((&version, rest)) = blob.split_first() else {
            return Err(CryptoError::InvalidFormat("empty blob".into()));
        };
        if version != ENVELOPE_VERSION {
            return Err(CryptoError::InvalidFormat(format!(
                "unknown envelope version {version}"
            )));
        }
        if rest.len() < NONCE_SIZE {
            return Err(CryptoError::InvalidFormat(format!(
                "encrypted data too short: {} bytes",
                blob.len()
            )));
        }

        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| {
                CryptoError::Decryption(format!(
                    "AES-GCM decryption failed (wrong key or corrupted data): {e}"
                ))
            })
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<Vec<u8>, CryptoError> {
        self.encrypt(plaintext.as_bytes())
    }

    pub fn decrypt_str(&self, blob: &[u8]) -> Result<String, CryptoError> {
        let bytes = self.decrypt(blob)?;
        String::from_utf8(bytes)
            .map_err(|e| CryptoError::Decryption(format!("decrypted data is not UTF-8: {e}")))
    }

    /// Decrypt straight into a `SecretString` so tokens never sit in a plain `String`.
    pub fn decrypt_secret(&self, blob: &[u8]) -> Result<SecretString, CryptoError> {
        self.decrypt_str(blob).map(SecretString::from)
    }
}
