//! AES-256-GCM config vault
//!
//! Ciphertexts are self-contained: `base64url(nonce || ciphertext)`. The key
//! never rotates implicitly; blobs written under another key fail to decrypt.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of AES-256 key in bytes
const AES_KEY_SIZE: usize = 32;

/// Size of AES-GCM nonce in bytes
const NONCE_SIZE: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VaultError {
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid key format: {0}")]
    InvalidFormat(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),
}

impl From<VaultError> for crate::Error {
    fn from(err: VaultError) -> Self {
        crate::Error::Vault(err.to_string())
    }
}

/// A master encryption key that is securely zeroed on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; AES_KEY_SIZE],
}

impl MasterKey {
    /// Generate a new random master key
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut bytes = [0u8; AES_KEY_SIZE];
        bytes.copy_from_slice(key.as_slice());
        Self { bytes }
    }

    /// Create a master key from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VaultError> {
        if bytes.len() != AES_KEY_SIZE {
            return Err(VaultError::InvalidKeyLength {
                expected: AES_KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut key_bytes = [0u8; AES_KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Create a master key from base64url, padded or not
    pub fn from_base64url(encoded: &str) -> Result<Self, VaultError> {
        let encoded = encoded.trim();
        let decoded = if encoded.ends_with('=') {
            URL_SAFE.decode(encoded)
        } else {
            URL_SAFE_NO_PAD.decode(encoded)
        };
        let mut bytes = decoded.map_err(|e| VaultError::InvalidFormat(e.to_string()))?;
        let key = Self::from_bytes(&bytes);
        bytes.zeroize();
        key
    }

    /// Export key as unpadded base64url
    pub fn to_base64url(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.bytes)
    }

    fn as_bytes(&self) -> &[u8; AES_KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Encrypts and decrypts per-instance configuration blobs
#[derive(Clone, Debug)]
pub struct ConfigVault {
    key: MasterKey,
}

impl ConfigVault {
    pub fn new(key: MasterKey) -> Self {
        Self { key }
    }

    fn cipher(&self) -> Result<Aes256Gcm, VaultError> {
        Aes256Gcm::new_from_slice(self.key.as_bytes())
            .map_err(|e| VaultError::EncryptionFailed(e.to_string()))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, VaultError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher()?
            .encrypt(&nonce, plaintext)
            .map_err(|e| VaultError::EncryptionFailed(e.to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(nonce.as_slice());
        blob.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(blob))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>, VaultError> {
        let encoded = encoded.trim().trim_end_matches('=');
        let blob = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| VaultError::DecryptionFailed(format!("Invalid ciphertext: {}", e)))?;
        if blob.len() <= NONCE_SIZE {
            return Err(VaultError::DecryptionFailed(format!(
                "Ciphertext too short: {} bytes",
                blob.len()
            )));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_SIZE);
        self.cipher()?
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| VaultError::DecryptionFailed("authentication failed".to_string()))
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<String, VaultError> {
        self.encrypt(plaintext.as_bytes())
    }

    pub fn decrypt_to_string(&self, encoded: &str) -> Result<String, VaultError> {
        let bytes = self.decrypt(encoded)?;
        String::from_utf8(bytes)
            .map_err(|e| VaultError::DecryptionFailed(format!("Plaintext is not UTF-8: {}", e)))
    }
}
