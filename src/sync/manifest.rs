//! Signed, encrypted sync manifests
//!
//! A manifest lists every record a device holds together with the network
//! address of its blob. The payload is sealed under a sync subkey of the
//! master key, so only devices of the same vault can read it, and signed
//! with the publishing device's ed25519 key.

use crate::blob::ContentHash;
use crate::crypto::{self, b64, verify_signature, DeviceKeyPair, MasterKey, Sealed};
use crate::error::{Error, Result};
use crate::index::MemoryRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// HKDF info for the manifest encryption subkey
const SYNC_KEY_INFO: &[u8] = b"memvault-sync-v1";

/// Domain separator for manifest signatures
const SIGNATURE_DOMAIN: &[u8] = b"memvault-manifest-v1";

/// One record as seen by the publishing device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub record: MemoryRecord,
    /// Network address of the sealed blob bytes
    pub blob_address: ContentHash,
}

/// Decrypted manifest contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestPayload {
    pub device_id: String,
    pub sequence: u64,
    pub generated_at: DateTime<Utc>,
    pub entries: Vec<ManifestEntry>,
}

/// Manifest as published on the network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedManifest {
    pub device_id: String,
    pub sequence: u64,
    #[serde(with = "b64")]
    pub verifying_key: Vec<u8>,
    #[serde(with = "b64")]
    pub payload: Vec<u8>,
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
}

impl SignedManifest {
    /// Encrypt and sign `payload`
    pub fn seal(payload: &ManifestPayload, master: &MasterKey, device: &DeviceKeyPair) -> Result<Self> {
        let key = Zeroizing::new(master.derive_subkey(SYNC_KEY_INFO)?);
        let json = Zeroizing::new(serde_json::to_vec(payload)?);
        let sealed = crypto::encrypt(&key, &json, payload.device_id.as_bytes())?;
        let payload_bytes = sealed.to_bytes();

        let signature = device.sign(&signing_input(&payload.device_id, payload.sequence, &payload_bytes));
        Ok(Self {
            device_id: payload.device_id.clone(),
            sequence: payload.sequence,
            verifying_key: device.verifying_key_bytes().to_vec(),
            payload: payload_bytes,
            signature,
        })
    }

    /// Check the signature, then decrypt.
    ///
    /// A bad signature is a `Crypto` error; a payload that does not decrypt
    /// or disagrees with its envelope is `Corruption`.
    pub fn open(&self, master: &MasterKey) -> Result<ManifestPayload> {
        verify_signature(
            &self.verifying_key,
            &signing_input(&self.device_id, self.sequence, &self.payload),
            &self.signature,
        )?;

        let key = Zeroizing::new(master.derive_subkey(SYNC_KEY_INFO)?);
        let sealed = Sealed::from_bytes(&self.payload)?;
        let json = Zeroizing::new(crypto::decrypt(&key, &sealed, self.device_id.as_bytes())?);
        let payload: ManifestPayload = serde_json::from_slice(&json)
            .map_err(|e| Error::Corruption(format!("Undecodable manifest from {}: {}", self.device_id, e)))?;

        if payload.device_id != self.device_id || payload.sequence != self.sequence {
            return Err(Error::Corruption(format!(
                "Manifest envelope from {} does not match its payload",
                self.device_id
            )));
        }
        Ok(payload)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Corruption(format!("Undecodable manifest: {}", e)))
    }
}

fn signing_input(device_id: &str, sequence: u64, payload: &[u8]) -> Vec<u8> {
    let mut input = Vec::with_capacity(SIGNATURE_DOMAIN.len() + device_id.len() + 10 + payload.len());
    input.extend_from_slice(SIGNATURE_DOMAIN);
    input.push(0);
    input.extend_from_slice(device_id.as_bytes());
    input.push(0);
    input.extend_from_slice(&sequence.to_be_bytes());
    input.extend_from_slice(payload);
    input
}
