//! Multi-device sync
//!
//! Devices share a content-addressed network. Each publishes a signed,
//! encrypted manifest of its records and uploads the sealed blobs they
//! reference; peers pull, verify and merge. The local vault stays fully
//! usable while the network is slow or unreachable.

mod engine;
mod manifest;
mod merge;
mod network;
mod state;

pub use engine::{CycleReport, SyncEngine, SyncHandle, SyncStatus};
pub use manifest::{ManifestEntry, ManifestPayload, SignedManifest};
pub use merge::{merge_records, MergeOutcome, Relation};
pub use network::{DirectoryNetwork, MemoryNetwork, SyncNetwork};
pub use state::{PeerEntry, PeerState, SyncState, STATE_FILE};
