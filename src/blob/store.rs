//! On-disk encrypted blob store
//!
//! Directory layout:
//! ```text
//! <vault>/
//! ├── media/
//! │   └── <hh>/<content-hash>     MVB1 | nonce | tag | ciphertext
//! └── refs/
//!     └── <content-hash>.json     ledger entry (refcount, wrapped data key)
//! ```
//!
//! Ciphertext is write-once: a file for a given hash is never rewritten.
//! Encryption and file writes happen outside the ledger lock, so writers of
//! distinct hashes never wait on each other; two writers racing on the same
//! hash both write a temp file and the loser discards its copy and takes a
//! reference on the winner's blob instead.
//!
//! The ledger keeps its own copy of each blob's wrapped data key, next to
//! the refcount and apart from the ciphertext directory. Deduplicating a
//! re-added file and serving a peer's fetch both need the key for a hash
//! that may have no live record, and only the ledger has it then. Wrapped
//! keys are useless without the master key, which never touches disk.

use super::ContentHash;
use crate::config::IngestConfig;
use crate::crypto::{self, DataKey, MasterKey, Sealed, WrappedKey};
use crate::error::{Error, Result};
use crate::persist;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Leading bytes of every blob file
const BLOB_MAGIC: &[u8; 4] = b"MVB1";

/// Ledger entry for one stored blob
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobEntry {
    /// Hash of the plaintext
    pub hash: ContentHash,
    /// Number of records referencing this blob
    pub refcount: u64,
    /// Data key wrapped under the master key
    pub wrapped_key: WrappedKey,
    /// Plaintext length in bytes
    pub plaintext_len: u64,
    /// On-disk length in bytes
    pub stored_len: u64,
    /// When the blob was first written
    pub created_at: DateTime<Utc>,
    /// Last time a reference was taken
    pub touched_at: DateTime<Utc>,
}

/// Result of storing plaintext
#[derive(Debug, Clone)]
pub struct PutOutcome {
    pub hash: ContentHash,
    pub wrapped_key: WrappedKey,
    /// True when an existing blob was reused
    pub deduplicated: bool,
}

/// Sealed blob bytes from another device that decrypted to the expected
/// content. Only verified blobs can be imported.
#[derive(Debug)]
pub struct VerifiedBlob {
    hash: ContentHash,
    wrapped_key: WrappedKey,
    bytes: Vec<u8>,
    plaintext_len: u64,
}

impl VerifiedBlob {
    pub fn hash(&self) -> &ContentHash {
        &self.hash
    }
}

/// Outcome of reconciling the ledger against live references
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub scanned: u64,
    pub references_reclaimed: u64,
    pub blobs_erased: u64,
    pub bytes_reclaimed: u64,
    pub stray_files_removed: u64,
    /// Hashes referenced more often than their refcount allows
    pub undercounted: Vec<ContentHash>,
}

enum Claim {
    Inserted(PutOutcome),
    Exists,
}

/// Content-addressed store of encrypted media
pub struct BlobStore {
    media_dir: PathBuf,
    refs_dir: PathBuf,
    ledger: Mutex<HashMap<ContentHash, BlobEntry>>,
    quota_bytes: Option<u64>,
    verify_dedup: bool,
}

impl BlobStore {
    /// Open (or create) the blob store under `root`
    pub fn open(root: &Path, config: &IngestConfig) -> Result<Self> {
        let media_dir = root.join("media");
        let refs_dir = root.join("refs");
        std::fs::create_dir_all(&media_dir)?;
        std::fs::create_dir_all(&refs_dir)?;

        let entries: Vec<BlobEntry> = persist::load_json_dir(&refs_dir)?;
        tracing::debug!(blobs = entries.len(), "Blob ledger loaded");

        Ok(Self {
            media_dir,
            refs_dir,
            ledger: Mutex::new(entries.into_iter().map(|e| (e.hash.clone(), e)).collect()),
            quota_bytes: config.quota_bytes,
            verify_dedup: config.verify_dedup,
        })
    }

    /// Store plaintext, deduplicating on content hash.
    ///
    /// A new blob gets a fresh data key and `refcount = 1`; an existing blob
    /// only gains a reference and its wrapped key is returned.
    pub fn put(&self, master: &MasterKey, plaintext: &[u8]) -> Result<PutOutcome> {
        let hash = ContentHash::of(plaintext);

        loop {
            if let Some(outcome) = self.try_dedup(master, &hash, plaintext)? {
                tracing::debug!(hash = %hash.short(), "Blob deduplicated");
                return Ok(outcome);
            }

            let file_len = (BLOB_MAGIC.len() + Sealed::encoded_len(plaintext.len())) as u64;
            self.check_quota(&self.ledger(), file_len)?;

            let data_key = DataKey::generate();
            let sealed = crypto::encrypt(data_key.as_bytes(), plaintext, hash.as_str().as_bytes())?;
            let wrapped = crypto::wrap_key(master, &data_key)?;
            let file_bytes = encode_blob(&sealed);

            match self.claim_new(&hash, &wrapped, &file_bytes, plaintext.len() as u64)? {
                Claim::Inserted(outcome) => {
                    tracing::debug!(hash = %hash.short(), bytes = file_bytes.len(), "Blob stored");
                    return Ok(outcome);
                }
                Claim::Exists => {
                    tracing::debug!(hash = %hash.short(), "Concurrent writer stored blob first");
                }
            }
        }
    }

    /// Read and decrypt a blob.
    ///
    /// Fails with `NotFound` if the hash is unknown, `Crypto` if the data
    /// key cannot be unwrapped and `Corruption` if authentication fails.
    pub fn get(&self, master: &MasterKey, hash: &ContentHash, wrapped: &WrappedKey) -> Result<Vec<u8>> {
        let bytes = self.read_sealed(hash)?;
        open_sealed(master, hash, wrapped, &bytes)
    }

    /// Raw stored bytes of a blob, for publishing
    pub fn read_sealed(&self, hash: &ContentHash) -> Result<Vec<u8>> {
        if !self.contains(hash) {
            return Err(Error::NotFound(format!("Blob {}", hash)));
        }

        match std::fs::read(self.blob_path(hash)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::error!(hash = %hash, "Blob listed in ledger is missing on disk");
                Err(Error::NotFound(format!("Blob {}", hash)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drop one reference; erase the ciphertext when none remain.
    ///
    /// Returns the remaining reference count. Releasing a reference that was
    /// never taken is an integrity violation.
    pub fn release(&self, hash: &ContentHash) -> Result<u64> {
        let mut ledger = self.ledger();

        let entry = match ledger.get(hash) {
            Some(entry) if entry.refcount > 0 => entry.clone(),
            _ => {
                tracing::error!(hash = %hash, "Refcount underflow: release without matching reference");
                return Err(Error::RefcountUnderflow(hash.to_string()));
            }
        };

        if entry.refcount == 1 {
            self.erase(&mut ledger, hash)?;
            tracing::debug!(hash = %hash.short(), "Blob erased");
            return Ok(0);
        }

        let mut updated = entry;
        updated.refcount -= 1;
        self.persist_entry(&updated)?;
        let remaining = updated.refcount;
        ledger.insert(hash.clone(), updated);
        Ok(remaining)
    }

    /// Take an additional reference on a stored blob, returning its wrapped key
    pub fn acquire(&self, hash: &ContentHash) -> Result<WrappedKey> {
        let mut ledger = self.ledger();
        let entry = ledger
            .get_mut(hash)
            .ok_or_else(|| Error::NotFound(format!("Blob {}", hash)))?;
        self.increment(entry)?;
        Ok(entry.wrapped_key.clone())
    }

    /// Check sealed bytes from elsewhere against the hash they claim
    pub fn verify_sealed(
        &self,
        master: &MasterKey,
        hash: &ContentHash,
        wrapped: &WrappedKey,
        bytes: Vec<u8>,
    ) -> Result<VerifiedBlob> {
        let plaintext = open_sealed(master, hash, wrapped, &bytes)?;
        Ok(VerifiedBlob {
            hash: hash.clone(),
            wrapped_key: wrapped.clone(),
            plaintext_len: plaintext.len() as u64,
            bytes,
        })
    }

    /// Store a verified blob verbatim, or take a reference if the hash is
    /// already present locally (the local wrapped key is returned then).
    pub fn import(&self, blob: VerifiedBlob) -> Result<PutOutcome> {
        loop {
            {
                let mut ledger = self.ledger();
                if let Some(entry) = ledger.get_mut(&blob.hash) {
                    self.increment(entry)?;
                    return Ok(PutOutcome {
                        hash: blob.hash.clone(),
                        wrapped_key: entry.wrapped_key.clone(),
                        deduplicated: true,
                    });
                }
            }

            if let Claim::Inserted(outcome) =
                self.claim_new(&blob.hash, &blob.wrapped_key, &blob.bytes, blob.plaintext_len)?
            {
                return Ok(outcome);
            }
        }
    }

    /// Whether a blob with this hash is stored
    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.ledger().contains_key(hash)
    }

    /// Ledger entry for a hash
    pub fn entry(&self, hash: &ContentHash) -> Option<BlobEntry> {
        self.ledger().get(hash).cloned()
    }

    /// Snapshot of all ledger entries
    pub fn entries(&self) -> Vec<BlobEntry> {
        self.ledger().values().cloned().collect()
    }

    /// Total bytes of ciphertext on disk
    pub fn stored_bytes(&self) -> u64 {
        self.ledger().values().map(|e| e.stored_len).sum()
    }

    /// Move every data key from `from` to `to`. Ciphertext is untouched.
    ///
    /// Entries are persisted one at a time and entries already under `to`
    /// are skipped, so a failed pass can be resumed or reversed by calling
    /// this again with the keys swapped.
    pub(crate) fn rekey_all(&self, from: &MasterKey, to: &MasterKey) -> Result<usize> {
        let mut ledger = self.ledger();
        let hashes: Vec<ContentHash> = ledger.keys().cloned().collect();

        let mut moved = 0;
        for hash in hashes {
            let Some(entry) = ledger.get(&hash) else {
                continue;
            };
            let wrapped_key = crypto::rekey(from, to, &entry.wrapped_key)?;
            if wrapped_key == entry.wrapped_key {
                continue;
            }

            let mut entry = entry.clone();
            entry.wrapped_key = wrapped_key;
            self.persist_entry(&entry)?;
            ledger.insert(hash, entry);
            moved += 1;
        }
        Ok(moved)
    }

    /// Bring refcounts in line with `live` reference counts.
    ///
    /// Only entries untouched since `cutoff` are adjusted, so a reference
    /// taken by an ingest that has not reached the index yet survives.
    /// Undercounted entries are reported, never corrected.
    pub(crate) fn reconcile(
        &self,
        live: &HashMap<ContentHash, u64>,
        cutoff: DateTime<Utc>,
    ) -> Result<ReconcileStats> {
        let mut ledger = self.ledger();
        let mut stats = ReconcileStats::default();

        let mut hashes: Vec<ContentHash> = ledger.keys().cloned().collect();
        hashes.sort();

        for hash in hashes {
            stats.scanned += 1;
            let Some(entry) = ledger.get(&hash).cloned() else {
                continue;
            };
            let live_refs = live.get(&hash).copied().unwrap_or(0);

            if entry.refcount < live_refs {
                tracing::error!(
                    hash = %hash,
                    refcount = entry.refcount,
                    live = live_refs,
                    "Blob referenced more often than its refcount"
                );
                stats.undercounted.push(hash);
                continue;
            }
            if entry.refcount == live_refs || entry.touched_at > cutoff {
                continue;
            }

            let reclaimed = entry.refcount - live_refs;
            stats.references_reclaimed += reclaimed;
            if live_refs == 0 {
                self.erase(&mut ledger, &hash)?;
                stats.blobs_erased += 1;
                stats.bytes_reclaimed += entry.stored_len;
            } else {
                let mut updated = entry;
                updated.refcount = live_refs;
                self.persist_entry(&updated)?;
                ledger.insert(hash.clone(), updated);
            }
            tracing::warn!(hash = %hash.short(), reclaimed, "Reclaimed orphaned blob references");
        }

        for hash in live.keys().filter(|h| !ledger.contains_key(*h)) {
            tracing::error!(hash = %hash, "Record references a blob missing from the ledger");
            stats.undercounted.push(hash.clone());
        }

        stats.stray_files_removed = self.remove_stray_files(&ledger, cutoff)?;
        Ok(stats)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn ledger(&self) -> MutexGuard<'_, HashMap<ContentHash, BlobEntry>> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        self.media_dir.join(hash.prefix()).join(hash.as_str())
    }

    fn ref_path(&self, hash: &ContentHash) -> PathBuf {
        self.refs_dir.join(format!("{}.json", hash))
    }

    fn persist_entry(&self, entry: &BlobEntry) -> Result<()> {
        persist::write_json_atomic(&self.ref_path(&entry.hash), entry)
    }

    fn increment(&self, entry: &mut BlobEntry) -> Result<()> {
        let mut updated = entry.clone();
        updated.refcount += 1;
        updated.touched_at = Utc::now();
        self.persist_entry(&updated)?;
        *entry = updated;
        Ok(())
    }

    fn check_quota(&self, ledger: &HashMap<ContentHash, BlobEntry>, additional: u64) -> Result<()> {
        if let Some(quota) = self.quota_bytes {
            let used: u64 = ledger.values().map(|e| e.stored_len).sum();
            if used + additional > quota {
                return Err(Error::StorageExhausted(format!(
                    "Vault quota of {} bytes exceeded ({} used, {} requested)",
                    quota, used, additional
                )));
            }
        }
        Ok(())
    }

    fn try_dedup(
        &self,
        master: &MasterKey,
        hash: &ContentHash,
        plaintext: &[u8],
    ) -> Result<Option<PutOutcome>> {
        let existing = self.ledger().get(hash).cloned();
        let Some(entry) = existing else {
            return Ok(None);
        };

        if entry.plaintext_len != plaintext.len() as u64 {
            return Err(collision(hash));
        }
        if self.verify_dedup {
            let stored = self.get(master, hash, &entry.wrapped_key)?;
            if stored != plaintext {
                return Err(collision(hash));
            }
        }

        let mut ledger = self.ledger();
        let Some(current) = ledger.get_mut(hash) else {
            // Erased in the meantime; store it fresh
            return Ok(None);
        };
        self.increment(current)?;

        Ok(Some(PutOutcome {
            hash: hash.clone(),
            wrapped_key: current.wrapped_key.clone(),
            deduplicated: true,
        }))
    }

    /// Write a new blob unless another writer got there first
    fn claim_new(
        &self,
        hash: &ContentHash,
        wrapped: &WrappedKey,
        file_bytes: &[u8],
        plaintext_len: u64,
    ) -> Result<Claim> {
        let final_path = self.blob_path(hash);
        let tmp = persist::write_temp(&final_path, file_bytes)?;

        let mut ledger = self.ledger();
        if ledger.contains_key(hash) {
            drop(ledger);
            persist::remove_if_exists(&tmp)?;
            return Ok(Claim::Exists);
        }

        let stored_len = file_bytes.len() as u64;
        if let Err(e) = self.check_quota(&ledger, stored_len) {
            let _ = persist::remove_if_exists(&tmp);
            return Err(e);
        }

        let now = Utc::now();
        let entry = BlobEntry {
            hash: hash.clone(),
            refcount: 1,
            wrapped_key: wrapped.clone(),
            plaintext_len,
            stored_len,
            created_at: now,
            touched_at: now,
        };

        // Ledger entry first: a crash before the rename leaves a refcount
        // with no file and no record, which the sweep reclaims.
        if let Err(e) = self.persist_entry(&entry) {
            let _ = persist::remove_if_exists(&tmp);
            return Err(e);
        }
        if let Err(e) = std::fs::rename(&tmp, &final_path) {
            let _ = persist::remove_if_exists(&self.ref_path(hash));
            let _ = persist::remove_if_exists(&tmp);
            return Err(e.into());
        }

        ledger.insert(hash.clone(), entry);
        Ok(Claim::Inserted(PutOutcome {
            hash: hash.clone(),
            wrapped_key: wrapped.clone(),
            deduplicated: false,
        }))
    }

    fn erase(&self, ledger: &mut HashMap<ContentHash, BlobEntry>, hash: &ContentHash) -> Result<()> {
        persist::remove_if_exists(&self.ref_path(hash))?;
        let path = self.blob_path(hash);
        persist::remove_if_exists(&path)?;
        if let Some(parent) = path.parent() {
            // Only succeeds once the fan-out directory is empty
            let _ = std::fs::remove_dir(parent);
        }
        ledger.remove(hash);
        Ok(())
    }

    /// Remove media files with no ledger entry and abandoned temp files
    fn remove_stray_files(
        &self,
        ledger: &HashMap<ContentHash, BlobEntry>,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let mut removed = 0;

        for prefix_dir in std::fs::read_dir(&self.media_dir)? {
            let prefix_dir = prefix_dir?.path();
            if !prefix_dir.is_dir() {
                continue;
            }

            for file in std::fs::read_dir(&prefix_dir)? {
                let path = file?.path();
                let known = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| ContentHash::parse(n).ok())
                    .map(|h| ledger.contains_key(&h))
                    .unwrap_or(false);
                if known {
                    continue;
                }

                let modified: DateTime<Utc> = std::fs::metadata(&path)?.modified()?.into();
                if modified > cutoff {
                    continue;
                }

                persist::remove_if_exists(&path)?;
                tracing::warn!(path = %path.display(), "Removed stray media file");
                removed += 1;
            }
        }

        Ok(removed)
    }
}

fn collision(hash: &ContentHash) -> Error {
    tracing::error!(hash = %hash, "Hash collision: distinct content maps to a stored blob");
    Error::HashCollision(hash.to_string())
}

fn encode_blob(sealed: &Sealed) -> Vec<u8> {
    let mut out = Vec::with_capacity(BLOB_MAGIC.len() + Sealed::encoded_len(sealed.ciphertext.len()));
    out.extend_from_slice(BLOB_MAGIC);
    out.extend_from_slice(&sealed.to_bytes());
    out
}

fn decode_blob(bytes: &[u8]) -> Result<Sealed> {
    if bytes.len() < BLOB_MAGIC.len() || &bytes[..BLOB_MAGIC.len()] != BLOB_MAGIC {
        return Err(Error::Corruption("Bad blob header".to_string()));
    }
    Sealed::from_bytes(&bytes[BLOB_MAGIC.len()..])
}

fn open_sealed(
    master: &MasterKey,
    hash: &ContentHash,
    wrapped: &WrappedKey,
    bytes: &[u8],
) -> Result<Vec<u8>> {
    let sealed = decode_blob(bytes)?;
    let data_key = crypto::unwrap_key(master, wrapped)?;
    let plaintext = crypto::decrypt(data_key.as_bytes(), &sealed, hash.as_str().as_bytes())?;

    if ContentHash::of(&plaintext) != *hash {
        return Err(Error::Corruption(format!("Content of blob {} does not match its hash", hash)));
    }
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KdfConfig;
    use crate::crypto::{derive_master_key, generate_salt};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn master() -> MasterKey {
        derive_master_key(b"test", &generate_salt(), &KdfConfig::insecure_for_tests()).unwrap()
    }

    fn make_store() -> (BlobStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path(), &IngestConfig::default()).unwrap();
        (store, dir)
    }

    #[test]
    fn test_put_and_get() {
        let (store, _dir) = make_store();
        let master = master();

        let outcome = store.put(&master, b"sunset.jpg bytes").unwrap();
        assert!(!outcome.deduplicated);
        assert_eq!(outcome.hash, ContentHash::of(b"sunset.jpg bytes"));

        let plaintext = store.get(&master, &outcome.hash, &outcome.wrapped_key).unwrap();
        assert_eq!(plaintext, b"sunset.jpg bytes");
        assert_eq!(store.entry(&outcome.hash).unwrap().refcount, 1);
    }

    #[test]
    fn test_ciphertext_on_disk_is_not_plaintext() {
        let (store, _dir) = make_store();
        let master = master();
        let outcome = store.put(&master, b"very private words").unwrap();

        let raw = store.read_sealed(&outcome.hash).unwrap();
        assert!(raw.starts_with(BLOB_MAGIC));
        assert!(!raw.windows(7).any(|w| w == b"private"));
    }

    #[test]
    fn test_dedup_increments_refcount() {
        let (store, _dir) = make_store();
        let master = master();

        let first = store.put(&master, b"same").unwrap();
        let second = store.put(&master, b"same").unwrap();

        assert!(second.deduplicated);
        assert_eq!(first.hash, second.hash);
        assert_eq!(first.wrapped_key, second.wrapped_key);
        assert_eq!(store.entry(&first.hash).unwrap().refcount, 2);
        assert_eq!(store.entries().len(), 1);
    }

    #[test]
    fn test_release_erases_at_zero() {
        let (store, _dir) = make_store();
        let master = master();

        let outcome = store.put(&master, b"shared").unwrap();
        store.put(&master, b"shared").unwrap();

        assert_eq!(store.release(&outcome.hash).unwrap(), 1);
        assert!(store.get(&master, &outcome.hash, &outcome.wrapped_key).is_ok());

        assert_eq!(store.release(&outcome.hash).unwrap(), 0);
        assert!(!store.contains(&outcome.hash));
        assert!(!store.blob_path(&outcome.hash).exists());
        assert!(matches!(
            store.get(&master, &outcome.hash, &outcome.wrapped_key),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_double_release_is_underflow() {
        let (store, _dir) = make_store();
        let outcome = store.put(&master(), b"once").unwrap();

        store.release(&outcome.hash).unwrap();
        let err = store.release(&outcome.hash).unwrap_err();
        assert!(matches!(err, Error::RefcountUnderflow(_)));
        assert!(err.is_integrity_violation());
    }

    #[test]
    fn test_get_unknown_hash() {
        let (store, _dir) = make_store();
        let master = master();
        let outcome = store.put(&master, b"x").unwrap();
        let missing = ContentHash::of(b"never stored");
        assert!(matches!(
            store.get(&master, &missing, &outcome.wrapped_key),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_flipped_ciphertext_byte_is_corruption() {
        let (store, _dir) = make_store();
        let master = master();
        let outcome = store.put(&master, b"family photo").unwrap();

        let path = store.blob_path(&outcome.hash);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x80;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            store.get(&master, &outcome.hash, &outcome.wrapped_key),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_wrong_master_is_crypto_error() {
        let (store, _dir) = make_store();
        let outcome = store.put(&master(), b"locked").unwrap();
        assert!(matches!(
            store.get(&master(), &outcome.hash, &outcome.wrapped_key),
            Err(Error::Crypto(_))
        ));
    }

    #[test]
    fn test_quota_exhausted() {
        let dir = TempDir::new().unwrap();
        let config = IngestConfig {
            quota_bytes: Some(100),
            ..Default::default()
        };
        let store = BlobStore::open(dir.path(), &config).unwrap();
        let master = master();

        store.put(&master, &[1u8; 40]).unwrap();
        let err = store.put(&master, &[2u8; 40]).unwrap_err();
        assert!(matches!(err, Error::StorageExhausted(_)));
        // Dedup hits never consume quota
        assert!(store.put(&master, &[1u8; 40]).unwrap().deduplicated);
    }

    #[test]
    fn test_length_mismatch_is_collision() {
        let dir = TempDir::new().unwrap();
        let master = master();
        let hash = {
            let store = BlobStore::open(dir.path(), &IngestConfig::default()).unwrap();
            store.put(&master, b"original").unwrap().hash
        };

        // Simulate a ledger that disagrees with the incoming content
        let ref_path = dir.path().join("refs").join(format!("{}.json", hash));
        let mut entry: BlobEntry = persist::read_json(&ref_path).unwrap();
        entry.plaintext_len += 1;
        persist::write_json_atomic(&ref_path, &entry).unwrap();

        let store = BlobStore::open(dir.path(), &IngestConfig::default()).unwrap();
        let err = store.put(&master, b"original").unwrap_err();
        assert!(matches!(err, Error::HashCollision(_)));
        assert_eq!(store.entry(&hash).unwrap().refcount, 1);
    }

    #[test]
    fn test_ledger_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let master = master();
        let outcome = {
            let store = BlobStore::open(dir.path(), &IngestConfig::default()).unwrap();
            store.put(&master, b"persist me").unwrap();
            store.put(&master, b"persist me").unwrap()
        };

        let store = BlobStore::open(dir.path(), &IngestConfig::default()).unwrap();
        assert_eq!(store.entry(&outcome.hash).unwrap().refcount, 2);
        assert_eq!(
            store.get(&master, &outcome.hash, &outcome.wrapped_key).unwrap(),
            b"persist me"
        );
    }

    #[test]
    fn test_concurrent_puts_of_identical_content() {
        let (store, _dir) = make_store();
        let store = Arc::new(store);
        let master = master();
        const WRITERS: u64 = 8;

        std::thread::scope(|scope| {
            for _ in 0..WRITERS {
                let store = store.clone();
                let master = master.clone();
                scope.spawn(move || store.put(&master, b"race").unwrap());
            }
        });

        let hash = ContentHash::of(b"race");
        assert_eq!(store.entry(&hash).unwrap().refcount, WRITERS);
        assert_eq!(store.entries().len(), 1);

        // No temp files left behind
        let prefix_dir = store.media_dir.join(hash.prefix());
        let files: Vec<_> = std::fs::read_dir(prefix_dir).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_verify_and_import() {
        let (source, _d1) = make_store();
        let (target, _d2) = make_store();
        let master = master();

        let outcome = source.put(&master, b"travelling").unwrap();
        let bytes = source.read_sealed(&outcome.hash).unwrap();

        let verified = target
            .verify_sealed(&master, &outcome.hash, &outcome.wrapped_key, bytes)
            .unwrap();
        let imported = target.import(verified).unwrap();
        assert!(!imported.deduplicated);
        assert_eq!(
            target.get(&master, &outcome.hash, &imported.wrapped_key).unwrap(),
            b"travelling"
        );
    }

    #[test]
    fn test_verify_rejects_mismatched_hash() {
        let (store, _dir) = make_store();
        let master = master();
        let a = store.put(&master, b"aaa").unwrap();
        let bytes = store.read_sealed(&a.hash).unwrap();

        let other = ContentHash::of(b"bbb");
        let result = store.verify_sealed(&master, &other, &a.wrapped_key, bytes);
        assert!(matches!(result, Err(Error::Corruption(_))));
    }

    #[test]
    fn test_import_existing_hash_takes_reference() {
        let (store, _dir) = make_store();
        let master = master();
        let local = store.put(&master, b"both devices").unwrap();

        let (remote, _d2) = make_store();
        let theirs = remote.put(&master, b"both devices").unwrap();
        let bytes = remote.read_sealed(&theirs.hash).unwrap();
        let verified = store
            .verify_sealed(&master, &theirs.hash, &theirs.wrapped_key, bytes)
            .unwrap();

        let outcome = store.import(verified).unwrap();
        assert!(outcome.deduplicated);
        assert_eq!(outcome.wrapped_key, local.wrapped_key);
        assert_eq!(store.entry(&local.hash).unwrap().refcount, 2);
    }

    #[test]
    fn test_rekey_all() {
        let (store, _dir) = make_store();
        let old = master();
        let new = master();
        let outcome = store.put(&old, b"rotate").unwrap();
        store.put(&old, b"second").unwrap();
        let before = std::fs::read(store.blob_path(&outcome.hash)).unwrap();

        assert_eq!(store.rekey_all(&old, &new).unwrap(), 2);

        let entry = store.entry(&outcome.hash).unwrap();
        assert_ne!(entry.wrapped_key, outcome.wrapped_key);
        assert_eq!(store.get(&new, &outcome.hash, &entry.wrapped_key).unwrap(), b"rotate");
        // Ciphertext untouched
        assert_eq!(std::fs::read(store.blob_path(&outcome.hash)).unwrap(), before);

        // Rerunning moves nothing; swapping the keys moves everything back
        assert_eq!(store.rekey_all(&old, &new).unwrap(), 0);
        assert_eq!(store.rekey_all(&new, &old).unwrap(), 2);
        let entry = store.entry(&outcome.hash).unwrap();
        assert_eq!(store.get(&old, &outcome.hash, &entry.wrapped_key).unwrap(), b"rotate");
    }

    #[test]
    fn test_reconcile_respects_cutoff() {
        let (store, _dir) = make_store();
        let master = master();
        let outcome = store.put(&master, b"orphan").unwrap();
        let live = HashMap::new();

        // Cutoff in the past: the fresh reference is within its grace period
        let stats = store
            .reconcile(&live, Utc::now() - chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(stats.blobs_erased, 0);
        assert!(store.contains(&outcome.hash));

        let stats = store
            .reconcile(&live, Utc::now() + chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(stats.blobs_erased, 1);
        assert_eq!(stats.references_reclaimed, 1);
        assert!(!store.contains(&outcome.hash));

        // Idempotent
        let again = store
            .reconcile(&live, Utc::now() + chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(again.blobs_erased, 0);
    }

    #[test]
    fn test_reconcile_reports_undercount() {
        let (store, _dir) = make_store();
        let outcome = store.put(&master(), b"counted once").unwrap();
        let live = HashMap::from([(outcome.hash.clone(), 3u64)]);

        let stats = store
            .reconcile(&live, Utc::now() + chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(stats.undercounted, vec![outcome.hash.clone()]);
        // Reported, not corrected
        assert_eq!(store.entry(&outcome.hash).unwrap().refcount, 1);
    }
}
