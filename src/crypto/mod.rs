//! Cryptographic primitives for the vault
//!
//! Envelope encryption: every blob is sealed under its own random data key,
//! and data keys are wrapped under the master key derived from the owner's
//! passphrase. Rotating the master key only rewraps data keys.

mod keys;
mod signing;

pub use keys::{
    derive_master_key, generate_salt, rekey, rekey_secret, unwrap_key, unwrap_secret, wrap_key,
    wrap_secret, DataKey, MasterKey, WrappedKey,
};
pub use signing::{verify_signature, DeviceKeyPair};

use crate::error::{Error, Result};
use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Nonce, Tag,
};
use rand::RngCore;

/// AES-256-GCM encryption key size
pub const KEY_SIZE: usize = 32;

/// Nonce size for AES-GCM
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size for AES-GCM
pub const TAG_SIZE: usize = 16;

/// Salt size for master-key derivation
pub const SALT_SIZE: usize = 16;

/// Authenticated ciphertext with its nonce and detached tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_SIZE],
}

impl Sealed {
    /// Serialized length for a plaintext of `len` bytes
    pub const fn encoded_len(len: usize) -> usize {
        NONCE_SIZE + TAG_SIZE + len
    }

    /// Encode as `nonce | tag | ciphertext`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::encoded_len(self.ciphertext.len()));
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Decode from `nonce | tag | ciphertext`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(Error::Corruption("Ciphertext too short".to_string()));
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[..NONCE_SIZE]);
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&bytes[NONCE_SIZE..NONCE_SIZE + TAG_SIZE]);

        Ok(Self {
            nonce,
            tag,
            ciphertext: bytes[NONCE_SIZE + TAG_SIZE..].to_vec(),
        })
    }
}

/// Encrypt data using AES-256-GCM, binding `aad` into the tag
pub fn encrypt(key: &[u8; KEY_SIZE], plaintext: &[u8], aad: &[u8]) -> Result<Sealed> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("Failed to create cipher: {}", e)))?;

    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let mut ciphertext = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), aad, &mut ciphertext)
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(tag.as_slice());

    Ok(Sealed {
        nonce,
        ciphertext,
        tag: tag_bytes,
    })
}

/// Decrypt data using AES-256-GCM.
///
/// Fails with `Error::Corruption` when the tag does not verify; no
/// plaintext is ever returned in that case.
pub fn decrypt(key: &[u8; KEY_SIZE], sealed: &Sealed, aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::Crypto(format!("Failed to create cipher: {}", e)))?;

    let mut plaintext = sealed.ciphertext.clone();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&sealed.nonce),
            aad,
            &mut plaintext,
            Tag::from_slice(&sealed.tag),
        )
        .map_err(|_| Error::Corruption("Authentication tag mismatch".to_string()))?;

    Ok(plaintext)
}

/// Generate a random encryption key
pub fn generate_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Serde helpers for binary fields stored as standard base64
pub(crate) mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
