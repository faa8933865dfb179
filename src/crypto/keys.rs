//! Key management: master-key derivation and data-key wrapping
//!
//! The master key lives only in memory for the lifetime of an open vault
//! and is zeroized on drop. Data keys never touch disk in the clear.

use super::{decrypt, encrypt, Sealed, KEY_SIZE, SALT_SIZE};
use crate::config::KdfConfig;
use crate::error::{Error, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AAD for wrapped per-item data keys
const DATA_KEY_CONTEXT: &[u8] = b"memvault-data-key-v1";

/// Vault master key derived from the owner's passphrase.
///
/// Zeroized on drop to prevent secret material from lingering in memory.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_SIZE]);

impl MasterKey {
    /// Derive a purpose-bound subkey with HKDF-SHA256
    pub fn derive_subkey(&self, info: &[u8]) -> Result<[u8; KEY_SIZE]> {
        let hk = Hkdf::<Sha256>::new(None, &self.0);
        let mut okm = [0u8; KEY_SIZE];
        hk.expand(info, &mut okm)
            .map_err(|e| Error::Crypto(format!("Subkey derivation failed: {}", e)))?;
        Ok(okm)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    pub(crate) fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Per-item symmetric key used to seal one blob
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DataKey([u8; KEY_SIZE]);

impl DataKey {
    /// Generate a new random data key
    pub fn generate() -> Self {
        Self(super::generate_key())
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DataKey(..)")
    }
}

/// A secret encrypted under the master key (`nonce | tag | ciphertext`)
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WrappedKey(#[serde(with = "super::b64")] Vec<u8>);

impl WrappedKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for WrappedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WrappedKey({} bytes)", self.0.len())
    }
}

/// Generate a random KDF salt
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Derive the master key from a passphrase with Argon2id.
///
/// Deterministic for the same passphrase, salt and parameters.
pub fn derive_master_key(passphrase: &[u8], salt: &[u8], kdf: &KdfConfig) -> Result<MasterKey> {
    let params = Params::new(kdf.memory_kib, kdf.iterations, kdf.parallelism, Some(KEY_SIZE))
        .map_err(|e| Error::Crypto(format!("Invalid KDF parameters: {}", e)))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(passphrase, salt, &mut key)
        .map_err(|e| Error::Crypto(format!("Key derivation failed: {}", e)))?;

    Ok(MasterKey(key))
}

/// Wrap an arbitrary 32-byte secret under the master key, bound to `context`
pub fn wrap_secret(master: &MasterKey, secret: &[u8; KEY_SIZE], context: &[u8]) -> Result<WrappedKey> {
    let sealed = encrypt(master.as_bytes(), secret, context)?;
    Ok(WrappedKey(sealed.to_bytes()))
}

/// Unwrap a secret produced by [`wrap_secret`] with the same `context`.
///
/// A wrong master key and a corrupted wrapped value are indistinguishable
/// and both fail with `Error::Crypto`.
pub fn unwrap_secret(
    master: &MasterKey,
    wrapped: &WrappedKey,
    context: &[u8],
) -> Result<[u8; KEY_SIZE]> {
    let failed = || Error::Crypto("Failed to unwrap key: wrong master key or corrupted value".to_string());

    let sealed = Sealed::from_bytes(&wrapped.0).map_err(|_| failed())?;
    let mut plain = decrypt(master.as_bytes(), &sealed, context).map_err(|_| failed())?;
    if plain.len() != KEY_SIZE {
        plain.zeroize();
        return Err(failed());
    }

    let mut secret = [0u8; KEY_SIZE];
    secret.copy_from_slice(&plain);
    plain.zeroize();
    Ok(secret)
}

/// Wrap a per-item data key under the master key
pub fn wrap_key(master: &MasterKey, data_key: &DataKey) -> Result<WrappedKey> {
    wrap_secret(master, data_key.as_bytes(), DATA_KEY_CONTEXT)
}

/// Unwrap a per-item data key
pub fn unwrap_key(master: &MasterKey, wrapped: &WrappedKey) -> Result<DataKey> {
    unwrap_secret(master, wrapped, DATA_KEY_CONTEXT).map(DataKey)
}

/// Move a wrapped secret from `from` to `to`.
///
/// A value that already unwraps under `to` is returned unchanged, so a
/// rekey pass interrupted halfway can simply be run again.
pub fn rekey_secret(
    from: &MasterKey,
    to: &MasterKey,
    wrapped: &WrappedKey,
    context: &[u8],
) -> Result<WrappedKey> {
    if let Ok(mut secret) = unwrap_secret(to, wrapped, context) {
        secret.zeroize();
        return Ok(wrapped.clone());
    }
    let mut secret = unwrap_secret(from, wrapped, context)?;
    let rewrapped = wrap_secret(to, &secret, context);
    secret.zeroize();
    rewrapped
}

/// [`rekey_secret`] for per-item data keys
pub fn rekey(from: &MasterKey, to: &MasterKey, wrapped: &WrappedKey) -> Result<WrappedKey> {
    rekey_secret(from, to, wrapped, DATA_KEY_CONTEXT)
}
