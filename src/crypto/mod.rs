//! AES-256-GCM sealing of sync payloads under a pre-shared key
//!
//! Every function here is a pure function of its inputs, so one key can be
//! used from any number of connections at once.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use zeroize::Zeroizing;

/// AES-256 key length in bytes
pub const KEY_LEN: usize = 32;

/// GCM nonce length in bytes
pub const NONCE_LEN: usize = 12;

/// GCM authentication tag length in bytes
pub const TAG_LEN: usize = 16;

/// Shortest input `decrypt` will accept (empty plaintext)
pub const MIN_SEALED_LEN: usize = NONCE_LEN + TAG_LEN;

/// Cipher errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Tag mismatch, truncated box, or wrong key
    #[error("authentication failed: sealed box was tampered with or sealed under another key")]
    Authentication,

    /// Key material is not exactly 32 bytes of valid hex
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The AEAD refused to seal the plaintext
    #[error("encryption failed")]
    Encryption,
}

/// A 32-byte symmetric key shared with exactly one paired device.
///
/// The bytes are wiped when the key is dropped, and neither `Debug` nor
/// logging ever prints them.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey(Zeroizing<[u8; KEY_LEN]>);

impl SharedKey {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Build a key from a slice that must be exactly 32 bytes long
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(bytes);
        Ok(Self::from_bytes(key))
    }

    /// Parse a 64-character hex string
    pub fn from_hex(hex_str: &str) -> Result<Self, CryptoError> {
        let bytes = Zeroizing::new(hex_to_bytes(hex_str)?);
        Self::from_slice(&bytes)
    }

    /// Generate a fresh key from the OS CSPRNG
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self::from_bytes(key)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Lowercase hex encoding of the key
    pub fn to_hex(&self) -> String {
        bytes_to_hex(self.as_bytes())
    }

    /// Short SHA-256 fingerprint, safe to show to an operator
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.as_bytes());
        bytes_to_hex(&digest[..8])
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedKey").field(&self.fingerprint()).finish()
    }
}

impl Serialize for SharedKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SharedKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex_str = Zeroizing::new(String::deserialize(deserializer)?);
        SharedKey::from_hex(&hex_str).map_err(serde::de::Error::custom)
    }
}

/// Seal `plaintext` under `key`.
///
/// Output layout is `nonce (12) || ciphertext || tag (16)`. A fresh random
/// nonce is drawn for every call.
pub fn encrypt(plaintext: &[u8], key: &SharedKey) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::Encryption)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open a box produced by [`encrypt`].
pub fn decrypt(sealed: &[u8], key: &SharedKey) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < MIN_SEALED_LEN {
        return Err(CryptoError::Authentication);
    }

    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Authentication)
}

/// Decode hex, ignoring embedded spaces and letter case
pub fn hex_to_bytes(hex_str: &str) -> Result<Vec<u8>, CryptoError> {
    let cleaned: String = hex_str.chars().filter(|c| *c != ' ').collect();
    hex::decode(&cleaned).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Lowercase hex encoding
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}
