//! memvault - Local-first encrypted memory vault
//!
//! Stores personal media ("memories") with searchable metadata. Media is
//! encrypted at rest, deduplicated by content hash, and optionally
//! synchronized between a vault owner's devices over a content-addressed
//! network. The local vault never waits on the network.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │            CLI (main.rs)  /  HTTP API (api)                   │
//! └───────────────────────────┬──────────────────────────────────┘
//!                             │ async
//! ┌───────────────────────────▼──────────────────────────────────┐
//! │  VaultService (spawn_blocking)          SyncEngine (tokio)    │
//! └───────────────────────────┬───────────────────────┬──────────┘
//!                             │                       │ SyncNetwork
//! ┌───────────────────────────▼──────────────────────┐ │
//! │  Vault: open/close, boundary ops, rotation        │◀┘
//! │  ┌──────────────┐ ┌───────────────┐ ┌──────────┐  │
//! │  │ Ingest       │ │ MetadataIndex │ │ Sweep    │  │
//! │  └──────┬───────┘ └───────────────┘ └────┬─────┘  │
//! │  ┌──────▼─────────────────────────────────▼─────┐ │
//! │  │ BlobStore: content-addressed, refcounted     │ │
//! │  └──────────────────────────────────────────────┘ │
//! │  crypto: Argon2id, AES-256-GCM, HKDF, ed25519     │
//! └───────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`vault`]: vault handle and boundary operations
//! - [`blob`]: encrypted, deduplicating media store
//! - [`index`]: metadata records and listing
//! - [`ingest`]: input validation and the `add_memory` pipeline
//! - [`sweep`]: orphaned reference reclamation
//! - [`sync`]: multi-device sync
//! - [`service`]: async adapter
//! - [`api`]: HTTP boundary
//! - [`crypto`]: key derivation, encryption and signing
//! - [`config`]: configuration management

pub mod api;
pub mod blob;
pub mod config;
pub mod crypto;
pub mod error;
pub mod index;
pub mod ingest;
pub(crate) mod persist;
pub mod service;
pub mod sweep;
pub mod sync;
pub mod vault;

pub use config::VaultConfig;
pub use error::{Error, Result};
pub use vault::Vault;
