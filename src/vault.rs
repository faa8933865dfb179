//! Vault handle
//!
//! A vault is opened with the owner's passphrase, which derives the master
//! key into memory for the session. `close` drops (and zeroizes) the key;
//! afterwards every operation that needs it fails with `VaultLocked`.
//! Metadata stays readable while locked because it is stored in the clear.

use crate::blob::BlobStore;
use crate::config::{KdfConfig, VaultConfig};
use crate::crypto::{
    self, b64, derive_master_key, generate_salt, unwrap_secret, wrap_secret, DeviceKeyPair,
    MasterKey, WrappedKey,
};
use crate::error::{Error, Result};
use crate::index::{
    ListFilter, MemoryId, MemoryListing, MemoryPatch, MemoryRecord, MemorySummary, MetadataIndex,
    TitleConflict, TranscriptionConflict,
};
use crate::ingest::{self, IngestPipeline, NewMemory};
use crate::persist;
use crate::sweep::{self, SweepReport};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use zeroize::Zeroizing;

/// Key file name inside the vault directory
pub const KEY_FILE: &str = "vault.key";

/// Per-device identity file
pub const DEVICE_FILE: &str = "device.json";

/// Present only while a passphrase rotation is in flight
pub const PENDING_KEY_FILE: &str = "vault.key.next";

const SYNC_DIR: &str = "sync";
const KEY_FILE_FORMAT: u32 = 1;
const VERIFIER_CONTEXT: &[u8] = b"memvault-verifier-v1";
const DEVICE_SEED_CONTEXT: &[u8] = b"memvault-device-seed-v1";
const ROTATION_CONTEXT: &[u8] = b"memvault-rotation-v1";

/// Everything needed to re-derive the master key from the passphrase.
/// Never contains the key itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyFile {
    format: u32,
    #[serde(with = "b64")]
    salt: Vec<u8>,
    kdf: KdfConfig,
    /// Random secret wrapped under the master key; unwrapping it proves the
    /// passphrase is right
    verifier: WrappedKey,
}

impl KeyFile {
    fn new(master: &MasterKey, salt: Vec<u8>, kdf: KdfConfig) -> Result<Self> {
        Ok(Self {
            format: KEY_FILE_FORMAT,
            salt,
            kdf,
            verifier: wrap_secret(master, &crypto::generate_key(), VERIFIER_CONTEXT)?,
        })
    }

    fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NotFound(format!("No vault key file at {}", path.display())));
        }
        let key_file: Self = persist::read_json(path)?;
        if key_file.format != KEY_FILE_FORMAT {
            return Err(Error::Config(format!(
                "Unsupported key file format {} in {}",
                key_file.format,
                path.display()
            )));
        }
        Ok(key_file)
    }

    fn unlock(&self, passphrase: &[u8]) -> Result<MasterKey> {
        let master = derive_master_key(passphrase, &self.salt, &self.kdf)?;
        unwrap_secret(&master, &self.verifier, VERIFIER_CONTEXT)
            .map_err(|_| Error::Crypto("Wrong passphrase".to_string()))?;
        Ok(master)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceFile {
    device_id: String,
    #[serde(with = "b64")]
    verifying_key: Vec<u8>,
    wrapped_seed: WrappedKey,
}

impl DeviceFile {
    fn create(path: &Path, master: &MasterKey) -> Result<(Self, DeviceKeyPair)> {
        let device = DeviceKeyPair::generate();
        let file = Self {
            device_id: uuid::Uuid::new_v4().to_string(),
            verifying_key: device.verifying_key_bytes().to_vec(),
            wrapped_seed: wrap_secret(master, &device.seed(), DEVICE_SEED_CONTEXT)?,
        };
        persist::write_json_atomic(path, &file)?;
        tracing::info!(device_id = %file.device_id, "Device identity created");
        Ok((file, device))
    }

    fn load_or_create(path: &Path, master: &MasterKey) -> Result<(Self, DeviceKeyPair)> {
        if !path.exists() {
            return Self::create(path, master);
        }

        let file: Self = persist::read_json(path)?;
        let seed = Zeroizing::new(unwrap_secret(master, &file.wrapped_seed, DEVICE_SEED_CONTEXT)?);
        let device = DeviceKeyPair::from_seed(&seed);
        if device.verifying_key_bytes().as_slice() != file.verifying_key.as_slice() {
            return Err(Error::Corruption(format!(
                "Device key in {} does not match its verifying key",
                path.display()
            )));
        }
        Ok((file, device))
    }
}

/// Both sides of a passphrase rotation.
///
/// Each master key is stored wrapped under the other, so whichever
/// passphrase the owner presents after a crash unlocks both keys and the
/// rotation can be finished or undone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingRotation {
    previous: KeyFile,
    next: KeyFile,
    /// Previous master key wrapped under the next one
    previous_master: WrappedKey,
    /// Next master key wrapped under the previous one
    next_master: WrappedKey,
}

impl PendingRotation {
    /// Returns the key file matching `passphrase`, its master key, and the
    /// master key on the other side of the rotation
    fn unlock(&self, passphrase: &[u8]) -> Result<(KeyFile, MasterKey, MasterKey)> {
        if let Ok(next) = self.next.unlock(passphrase) {
            let previous = Zeroizing::new(unwrap_secret(&next, &self.previous_master, ROTATION_CONTEXT)?);
            return Ok((self.next.clone(), next, MasterKey::from_bytes(*previous)));
        }
        let previous = self.previous.unlock(passphrase)?;
        let next = Zeroizing::new(unwrap_secret(&previous, &self.next_master, ROTATION_CONTEXT)?);
        Ok((self.previous.clone(), previous, MasterKey::from_bytes(*next)))
    }
}

/// Secrets held while the vault is open
struct Session {
    master: MasterKey,
    device: DeviceKeyPair,
}

/// A fully retrieved memory
#[derive(Debug, Clone)]
pub struct MemoryDetail {
    pub id: MemoryId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub tags: BTreeSet<String>,
    pub media_type: String,
    pub filename: String,
    pub size_bytes: u64,
    pub version: u64,
    pub transcription: Option<String>,
    pub conflicts: Vec<TitleConflict>,
    pub transcription_conflicts: Vec<TranscriptionConflict>,
    /// Decrypted media
    pub media: Bytes,
}

impl MemoryDetail {
    fn new(record: &MemoryRecord, media: Vec<u8>) -> Self {
        Self {
            id: record.id,
            title: record.title.clone(),
            created_at: record.created_at,
            tags: record.tags.clone(),
            media_type: record.media_type.clone(),
            filename: record.filename.clone(),
            size_bytes: record.size_bytes,
            version: record.version,
            transcription: record.transcription.clone(),
            conflicts: record.conflicts.clone(),
            transcription_conflicts: record.transcription_conflicts.clone(),
            media: Bytes::from(media),
        }
    }
}

/// An open memory vault
pub struct Vault {
    root: PathBuf,
    config: VaultConfig,
    device_id: String,
    blobs: BlobStore,
    index: MetadataIndex,
    /// Serializes every index mutation together with its blob refcount change
    writer: Mutex<()>,
    session: RwLock<Option<Session>>,
}

impl Vault {
    /// Create a new vault in `config.storage.vault_dir`
    pub fn create(config: VaultConfig, passphrase: &[u8]) -> Result<Self> {
        let root = config.storage.vault_dir.clone();
        ensure_no_vault(&root)?;
        std::fs::create_dir_all(&root)?;

        let salt = generate_salt().to_vec();
        let master = derive_master_key(passphrase, &salt, &config.kdf)?;
        let key_file = KeyFile::new(&master, salt, config.kdf)?;
        persist::write_json_atomic(&root.join(KEY_FILE), &key_file)?;
        tracing::info!(path = %root.display(), "Vault created");

        let (device_file, device) = DeviceFile::create(&root.join(DEVICE_FILE), &master)?;
        Self::assemble(config, device_file, Session { master, device })
    }

    /// Open an existing vault, first settling any interrupted rotation
    pub fn open(config: VaultConfig, passphrase: &[u8]) -> Result<Self> {
        let root = config.storage.vault_dir.clone();
        let master = if root.join(PENDING_KEY_FILE).exists() {
            recover_rotation(&config, passphrase)?
        } else {
            KeyFile::load(&root.join(KEY_FILE))?.unlock(passphrase)?
        };

        let (device_file, device) = DeviceFile::load_or_create(&root.join(DEVICE_FILE), &master)?;
        Self::assemble(config, device_file, Session { master, device })
    }

    /// Create a vault on a new device that shares the master key of an
    /// existing one, given a copy of that vault's key file
    pub fn join(config: VaultConfig, key_file: &Path, passphrase: &[u8]) -> Result<Self> {
        let root = config.storage.vault_dir.clone();
        ensure_no_vault(&root)?;

        let shared = KeyFile::load(key_file)?;
        let master = shared.unlock(passphrase)?;

        std::fs::create_dir_all(&root)?;
        persist::write_json_atomic(&root.join(KEY_FILE), &shared)?;
        tracing::info!(path = %root.display(), "Vault joined");

        let (device_file, device) = DeviceFile::create(&root.join(DEVICE_FILE), &master)?;
        Self::assemble(config, device_file, Session { master, device })
    }

    fn assemble(config: VaultConfig, device_file: DeviceFile, session: Session) -> Result<Self> {
        let root = config.storage.vault_dir.clone();
        let blobs = BlobStore::open(&root, &config.ingest)?;
        let index = MetadataIndex::open(&root)?;

        tracing::info!(
            path = %root.display(),
            device_id = %device_file.device_id,
            memories = index.len(),
            "Vault opened"
        );

        Ok(Self {
            root,
            config,
            device_id: device_file.device_id,
            blobs,
            index,
            writer: Mutex::new(()),
            session: RwLock::new(Some(session)),
        })
    }

    /// Drop the in-memory keys
    pub fn close(&self) {
        let mut session = self.session.write().unwrap_or_else(|p| p.into_inner());
        if session.take().is_some() {
            tracing::info!(path = %self.root.display(), "Vault closed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.session.read().unwrap_or_else(|p| p.into_inner()).is_some()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    // =========================================================================
    // Boundary operations
    // =========================================================================

    /// Every memory, most recent first. Works on a locked vault too.
    pub fn list_memories(&self) -> Vec<MemorySummary> {
        self.index.list(ListFilter::default()).iter().collect()
    }

    /// Filtered listing over a snapshot of the index
    pub fn list(&self, filter: ListFilter) -> MemoryListing {
        self.index.list(filter)
    }

    /// Record metadata without decrypting media
    pub fn get_record(&self, id: &MemoryId) -> Result<Arc<MemoryRecord>> {
        self.index.get(id)
    }

    /// Metadata plus decrypted media
    pub fn get_memory_by_id(&self, id: &MemoryId) -> Result<MemoryDetail> {
        let record = self.index.get(id)?;
        self.with_session(|session| {
            let media = self
                .blobs
                .get(&session.master, &record.content_hash, &record.wrapped_data_key)?;
            Ok(MemoryDetail::new(&record, media))
        })
    }

    /// Validate, encrypt and store a new memory
    pub fn add_memory(&self, input: NewMemory) -> Result<MemoryRecord> {
        self.with_session(|session| {
            IngestPipeline {
                blobs: &self.blobs,
                index: &self.index,
                limits: &self.config.ingest,
                writer: &self.writer,
            }
            .add(&session.master, input)
        })
    }

    /// Edit title, tags and transcription with an optimistic version check
    pub fn update_memory(
        &self,
        id: &MemoryId,
        mut patch: MemoryPatch,
        expected_version: u64,
    ) -> Result<Arc<MemoryRecord>> {
        self.ensure_open()?;
        if let Some(title) = patch.title.take() {
            patch.title = Some(ingest::validate_title(&title, &self.config.ingest)?);
        }
        if let Some(tags) = patch.tags.take() {
            patch.tags = Some(ingest::validate_tags(tags, &self.config.ingest)?);
        }
        if let Some(text) = patch.transcription.take() {
            patch.transcription = Some(ingest::validate_transcription(&text, &self.config.ingest)?);
        }

        let _writer = self.writer();
        let record = self.index.update(id, patch, expected_version)?;
        tracing::info!(id = %id, version = record.version, "Memory updated");
        Ok(record)
    }

    /// Remove a memory and release its blob reference
    pub fn delete_memory(&self, id: &MemoryId) -> Result<()> {
        self.ensure_open()?;
        let _writer = self.writer();

        let hash = self.index.delete(id)?;
        let remaining = self.blobs.release(&hash)?;
        tracing::info!(id = %id, hash = %hash.short(), remaining, "Memory deleted");
        Ok(())
    }

    /// Reclaim orphaned blob references older than the configured grace period
    pub fn sweep(&self) -> Result<SweepReport> {
        let grace = chrono::Duration::seconds(self.config.sweep.grace_period_secs as i64);
        self.sweep_with_grace(grace)
    }

    pub fn sweep_with_grace(&self, grace: chrono::Duration) -> Result<SweepReport> {
        let _writer = self.writer();
        sweep::sweep(&self.blobs, &self.index, grace)
    }

    /// Switch to a new passphrase.
    ///
    /// Derives a new master key under a fresh salt and moves every data
    /// key and the device seed over to it. No blob is rewritten. A pending
    /// key file holding both sides is written first; if moving the keys
    /// fails, they are moved back. Should the process die mid-way, the next
    /// `open` completes the rotation when given the new passphrase or
    /// reverts it when given the old one. Other devices sharing this vault
    /// must re-join with the new key file.
    pub fn rotate_passphrase(&self, new_passphrase: &[u8]) -> Result<()> {
        // Session before writer, the same order add_memory takes them in
        let mut session = self.session.write().unwrap_or_else(|p| p.into_inner());
        let _writer = self.writer();
        let current = session.as_ref().ok_or(Error::VaultLocked)?;
        let old = current.master.clone();

        let (pending, new) = self.begin_rotation(&old, new_passphrase)?;

        let moved = rekey_vault(&self.root, &self.blobs, &self.index, &old, &new)
            .and_then(|()| install_key_file(&self.root, &pending.next));
        if let Err(e) = moved {
            tracing::error!(error = %e, "Passphrase rotation failed, rolling back");
            match rekey_vault(&self.root, &self.blobs, &self.index, &new, &old) {
                Ok(()) => {
                    if let Err(cleanup) = persist::remove_if_exists(&self.root.join(PENDING_KEY_FILE)) {
                        tracing::warn!(error = %cleanup, "Failed to remove pending key file");
                    }
                }
                Err(rollback) => tracing::error!(
                    error = %rollback,
                    "Rollback incomplete, the next open will settle the rotation"
                ),
            }
            return Err(e);
        }
        // The new key file is in place, so a leftover marker is harmless
        if let Err(e) = persist::remove_if_exists(&self.root.join(PENDING_KEY_FILE)) {
            tracing::warn!(error = %e, "Failed to remove pending key file");
        }

        let device = DeviceKeyPair::from_seed(&current.device.seed());
        *session = Some(Session { master: new, device });
        tracing::info!(path = %self.root.display(), "Passphrase rotated");
        Ok(())
    }

    /// Derive the new master key and record the rotation on disk
    fn begin_rotation(&self, old: &MasterKey, new_passphrase: &[u8]) -> Result<(PendingRotation, MasterKey)> {
        let previous = KeyFile::load(&self.root.join(KEY_FILE))?;
        let salt = generate_salt().to_vec();
        let new = derive_master_key(new_passphrase, &salt, &self.config.kdf)?;

        let pending = PendingRotation {
            previous,
            next: KeyFile::new(&new, salt, self.config.kdf)?,
            previous_master: wrap_secret(&new, old.as_bytes(), ROTATION_CONTEXT)?,
            next_master: wrap_secret(old, new.as_bytes(), ROTATION_CONTEXT)?,
        };
        persist::write_json_atomic(&self.root.join(PENDING_KEY_FILE), &pending)?;
        Ok((pending, new))
    }

    // =========================================================================
    // Crate-internal access for sync
    // =========================================================================

    pub(crate) fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub(crate) fn index(&self) -> &MetadataIndex {
        &self.index
    }

    pub(crate) fn writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn sync_dir(&self) -> PathBuf {
        self.root.join(SYNC_DIR)
    }

    /// Run `f` with the session keys
    pub(crate) fn with_keys<T>(&self, f: impl FnOnce(&MasterKey, &DeviceKeyPair) -> Result<T>) -> Result<T> {
        self.with_session(|session| f(&session.master, &session.device))
    }

    fn with_session<T>(&self, f: impl FnOnce(&Session) -> Result<T>) -> Result<T> {
        let session = self.session.read().unwrap_or_else(|p| p.into_inner());
        match session.as_ref() {
            Some(session) => f(session),
            None => Err(Error::VaultLocked),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::VaultLocked)
        }
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("root", &self.root)
            .field("device_id", &self.device_id)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

/// Move every wrapped key in the vault from `from` to `to`. Keys already
/// under `to` are left alone, so this is safe to rerun in either direction.
fn rekey_vault(
    root: &Path,
    blobs: &BlobStore,
    index: &MetadataIndex,
    from: &MasterKey,
    to: &MasterKey,
) -> Result<()> {
    let blobs_moved = blobs.rekey_all(from, to)?;
    let records_moved = index.rewrite_all(|record| {
        let wrapped = crypto::rekey(from, to, &record.wrapped_data_key)?;
        if wrapped == record.wrapped_data_key {
            return Ok(None);
        }
        let mut record = record.clone();
        record.wrapped_data_key = wrapped;
        Ok(Some(record))
    })?;

    let path = root.join(DEVICE_FILE);
    if path.exists() {
        let mut device: DeviceFile = persist::read_json(&path)?;
        let wrapped = crypto::rekey_secret(from, to, &device.wrapped_seed, DEVICE_SEED_CONTEXT)?;
        if wrapped != device.wrapped_seed {
            device.wrapped_seed = wrapped;
            persist::write_json_atomic(&path, &device)?;
        }
    }

    tracing::debug!(blobs = blobs_moved, records = records_moved, "Vault keys moved");
    Ok(())
}

/// Install `key_file` as the vault key
fn install_key_file(root: &Path, key_file: &KeyFile) -> Result<()> {
    // Published objects were wrapped under the other key
    persist::remove_if_exists(&root.join(SYNC_DIR).join(crate::sync::STATE_FILE))?;
    persist::write_json_atomic(&root.join(KEY_FILE), key_file)
}

/// Settle a rotation left behind by a crash, towards whichever side
/// `passphrase` belongs to
fn recover_rotation(config: &VaultConfig, passphrase: &[u8]) -> Result<MasterKey> {
    let root = &config.storage.vault_dir;
    let pending: PendingRotation = persist::read_json(&root.join(PENDING_KEY_FILE))?;
    let (key_file, target, other) = pending.unlock(passphrase)?;

    let blobs = BlobStore::open(root, &config.ingest)?;
    let index = MetadataIndex::open(root)?;
    rekey_vault(root, &blobs, &index, &other, &target)?;
    install_key_file(root, &key_file)?;
    persist::remove_if_exists(&root.join(PENDING_KEY_FILE))?;

    tracing::warn!(path = %root.display(), "Settled an interrupted passphrase rotation");
    Ok(target)
}

fn ensure_no_vault(root: &Path) -> Result<()> {
    if root.join(KEY_FILE).exists() {
        return Err(Error::Conflict(format!("A vault already exists at {}", root.display())));
    }
    Ok(())
}
