//! Device identity for signing published sync manifests

use crate::error::{Error, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

/// Ed25519 key pair identifying one device of the vault owner.
///
/// Used only for manifest signing; confidentiality comes from the vault keys.
pub struct DeviceKeyPair {
    signing_key: SigningKey,
}

impl DeviceKeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Seed bytes, for wrapping under the master key
    pub fn seed(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    /// Get the verifying key as bytes
    pub fn verifying_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }
}

impl std::fmt::Debug for DeviceKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceKeyPair")
            .field("verifying_key", &self.verifying_key_bytes())
            .finish_non_exhaustive()
    }
}

/// Verify an ed25519 signature
pub fn verify_signature(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
    let public: [u8; 32] = public_key
        .try_into()
        .map_err(|_| Error::Crypto("Invalid verifying key length".to_string()))?;
    let key = VerifyingKey::from_bytes(&public)
        .map_err(|e| Error::Crypto(format!("Invalid verifying key: {}", e)))?;
    let signature = Signature::from_slice(signature)
        .map_err(|e| Error::Crypto(format!("Invalid signature: {}", e)))?;

    key.verify(message, &signature)
        .map_err(|_| Error::Crypto("Signature verification failed".to_string()))
}
