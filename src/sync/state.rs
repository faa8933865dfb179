//! Persistent sync bookkeeping (`sync/state.json`)

use crate::blob::ContentHash;
use crate::crypto::b64;
use crate::error::{Error, Result};
use crate::index::MemoryId;
use crate::persist;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// State file name inside the sync directory
pub const STATE_FILE: &str = "state.json";

/// A record as last seen in a peer's manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerEntry {
    pub content_hash: ContentHash,
    /// Peer's version when last synced
    pub remote_version: u64,
    /// Our version right after that sync (0 if we did not keep the record)
    pub local_version: u64,
}

/// What we know about one peer device
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerState {
    /// Pinned on first contact
    #[serde(with = "b64")]
    pub verifying_key: Vec<u8>,
    /// Last manifest sequence applied
    pub sequence: u64,
    pub last_pulled: Option<DateTime<Utc>>,
    pub entries: HashMap<MemoryId, PeerEntry>,
}

/// This device's sync bookkeeping
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    /// Sequence of our last published manifest
    pub sequence: u64,
    /// Digest of the entries we last published
    pub published_digest: Option<ContentHash>,
    /// Network address of each blob we have uploaded
    pub published: HashMap<ContentHash, ContentHash>,
    pub peers: HashMap<String, PeerState>,
}

impl SyncState {
    /// Load from `dir`, starting fresh if there is no state yet
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(STATE_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        persist::read_json(&path)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        persist::write_json_atomic(&dir.join(STATE_FILE), self)
    }

    /// Pin a peer's verifying key, rejecting a different key later on
    pub fn check_peer_key(&self, device_id: &str, verifying_key: &[u8]) -> Result<()> {
        match self.peers.get(device_id) {
            Some(peer) if !peer.verifying_key.is_empty() && peer.verifying_key != verifying_key => {
                Err(Error::SyncConflict(format!(
                    "Device {} presented a different signing key",
                    device_id
                )))
            }
            _ => Ok(()),
        }
    }
}
