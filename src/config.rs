//! memvault configuration management

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main memvault configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Master-key derivation parameters
    #[serde(default)]
    pub kdf: KdfConfig,

    /// Ingest limits
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Orphan sweep configuration
    #[serde(default)]
    pub sweep: SweepConfig,

    /// Multi-device sync configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// HTTP boundary configuration
    #[serde(default)]
    pub server: ServerConfig,
}

impl VaultConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Configuration rooted at `vault_dir`, everything else default
    pub fn with_vault_dir(vault_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig {
                vault_dir: vault_dir.into(),
            },
            ..Default::default()
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory of the vault
    pub vault_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = dirs_next::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("memvault");

        Self {
            vault_dir: base.join("vault"),
        }
    }
}

/// Argon2id parameters used when a vault is created or its passphrase rotated.
///
/// Parameters of an existing vault are read from its key file, so changing
/// these only affects new key files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    /// Memory cost in KiB
    pub memory_kib: u32,

    /// Number of passes
    pub iterations: u32,

    /// Degree of parallelism
    pub parallelism: u32,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
            parallelism: 1,
        }
    }
}

impl KdfConfig {
    /// Cheap parameters for unit tests. Never use for a real vault.
    pub fn insecure_for_tests() -> Self {
        Self {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }
}

/// Ingest limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Maximum title length in bytes
    pub max_title_bytes: usize,

    /// Maximum length of a single tag in bytes
    pub max_tag_bytes: usize,

    /// Maximum number of tags per memory
    pub max_tags: usize,

    /// Maximum transcription length in bytes
    pub max_transcription_bytes: usize,

    /// Maximum media payload size in bytes
    pub max_media_bytes: usize,

    /// Total ciphertext budget for the vault (None = unlimited)
    pub quota_bytes: Option<u64>,

    /// On a dedup hit, decrypt the stored blob and compare it with the
    /// incoming plaintext to detect hash collisions
    pub verify_dedup: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_title_bytes: 256,
            max_tag_bytes: 64,
            max_tags: 32,
            max_transcription_bytes: 64 * 1024,
            max_media_bytes: 512 * 1024 * 1024,
            quota_bytes: None,
            verify_dedup: true,
        }
    }
}

/// Orphan sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Blob references younger than this are never reclaimed
    pub grace_period_secs: u64,

    /// Interval between background sweeps when serving
    pub interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 3600,
            interval_secs: 900,
        }
    }
}

/// Multi-device sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Enable background sync
    pub enabled: bool,

    /// Shared directory acting as the content-addressed network
    pub network_dir: Option<PathBuf>,

    /// Seconds between sync cycles
    pub interval_secs: u64,

    /// Deadline for a single network call
    pub request_timeout_secs: u64,

    /// First retry delay
    pub backoff_base_ms: u64,

    /// Retry delay cap
    pub backoff_max_ms: u64,

    /// Attempts per network call before the cycle gives up
    pub max_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            network_dir: None,
            interval_secs: 300,
            request_timeout_secs: 30,
            backoff_base_ms: 500,
            backoff_max_ms: 60_000,
            max_attempts: 5,
        }
    }
}

/// HTTP boundary configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Allowed CORS origins (empty = any)
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 18791,
            cors_origins: vec!["http://localhost:1420".to_string()],
        }
    }
}
