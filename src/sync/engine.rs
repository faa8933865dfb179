//! Background sync engine
//!
//! One cycle publishes this device's manifest and then pulls every peer's.
//! A peer's changes are validated as a whole (signature, decryption, blob
//! fetch and verification) before anything is written, and the commit runs
//! under the vault writer lock. Network trouble only ever fails the cycle;
//! local reads and writes never wait on the network.

use super::manifest::{ManifestEntry, ManifestPayload, SignedManifest};
use super::merge::{merge_records, MergeOutcome, Relation};
use super::network::SyncNetwork;
use super::state::{PeerEntry, PeerState, SyncState};
use crate::blob::{ContentHash, VerifiedBlob};
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::index::{MemoryId, MemoryRecord};
use crate::vault::Vault;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Observable sync health
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub running: bool,
    pub cycles: u64,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Records with unresolved title or transcription conflicts plus diverged records
    pub pending_conflicts: usize,
}

/// What one cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub published: bool,
    pub blobs_uploaded: usize,
    pub peers_pulled: usize,
    pub peers_rejected: usize,
    pub inserted: usize,
    pub merged: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub diverged: usize,
}

/// A remote entry, classified against the local snapshot
enum PlannedChange {
    /// Record we dropped locally and the peer has not edited since
    Seen(MemoryRecord),
    Insert {
        record: MemoryRecord,
        blob: Option<VerifiedBlob>,
    },
    Merge(MemoryRecord),
    /// Gone from the peer's manifest
    RemoteDeleted(MemoryId),
}

#[derive(Debug, Default)]
struct CommitTally {
    inserted: usize,
    merged: usize,
    deleted: usize,
    skipped: usize,
    diverged: usize,
}

/// Handle to a running background sync task
pub struct SyncHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    engine: Arc<SyncEngine>,
}

impl SyncHandle {
    pub fn status(&self) -> SyncStatus {
        self.engine.status()
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the task and wait for it to finish. A cycle in flight is
    /// abandoned before its commit point.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!("Sync task ended abnormally: {}", e);
        }
    }
}

/// Reconciles the local vault with peers on a [`SyncNetwork`]
pub struct SyncEngine {
    vault: Arc<Vault>,
    network: Arc<dyn SyncNetwork>,
    config: SyncConfig,
    request_timeout: Duration,
    state: tokio::sync::Mutex<SyncState>,
    status: RwLock<SyncStatus>,
}

impl SyncEngine {
    pub fn new(vault: Arc<Vault>, network: Arc<dyn SyncNetwork>, config: SyncConfig) -> Result<Self> {
        let state = SyncState::load(&vault.sync_dir())?;
        Ok(Self {
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            vault,
            network,
            config,
            state: tokio::sync::Mutex::new(state),
            status: RwLock::new(SyncStatus::default()),
        })
    }

    /// Override the per-call deadline
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn status(&self) -> SyncStatus {
        self.status.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Start periodic sync on the current runtime
    pub fn spawn(self: Arc<Self>) -> SyncHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let engine = self.clone();
        let task = tokio::spawn(async move { engine.run_loop(token).await });

        SyncHandle {
            cancel,
            task,
            engine: self,
        }
    }

    async fn run_loop(&self, cancel: CancellationToken) {
        self.update_status(|s| s.running = true);
        tracing::info!(
            device_id = %self.vault.device_id(),
            interval_secs = self.config.interval_secs,
            "Sync started"
        );

        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.sync_once(&cancel).await {
                Ok(report) => tracing::debug!(?report, "Sync cycle completed"),
                Err(Error::Cancelled) => break,
                Err(e) => tracing::warn!("Sync cycle failed: {}", e),
            }
        }

        self.update_status(|s| s.running = false);
        tracing::info!("Sync stopped");
    }

    /// Run one publish/pull cycle and record its outcome in the status
    pub async fn sync_once(&self, cancel: &CancellationToken) -> Result<CycleReport> {
        let result = self.run_cycle(cancel).await;
        let pending = self.vault.index().pending_conflicts();

        self.update_status(|s| match &result {
            Ok(report) => {
                s.cycles += 1;
                s.last_sync = Some(Utc::now());
                s.last_error = None;
                s.pending_conflicts = pending + report.diverged;
            }
            Err(Error::Cancelled) => {}
            Err(e) => {
                s.last_error = Some(e.to_string());
                s.pending_conflicts = pending;
            }
        });
        result
    }

    async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport> {
        let mut state = self.state.lock().await;
        let mut report = CycleReport::default();

        self.publish(&mut state, cancel, &mut report).await?;

        let manifests = self
            .call("list manifests", cancel, || self.network.manifests())
            .await?;
        for manifest in manifests {
            if manifest.device_id == self.vault.device_id() {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let device_id = manifest.device_id.clone();
            match self.pull_peer(&mut state, manifest, cancel, &mut report).await {
                Ok(true) => report.peers_pulled += 1,
                Ok(false) => {}
                Err(e) if matches!(e, Error::Cancelled | Error::VaultLocked) || e.is_retryable() => {
                    return Err(e)
                }
                Err(e) => {
                    // A bad manifest from one device must not block the others
                    tracing::warn!(device_id = %device_id, "Rejected peer manifest: {}", e);
                    report.peers_rejected += 1;
                }
            }
        }

        if report.inserted + report.merged + report.deleted > 0 {
            tracing::info!(
                inserted = report.inserted,
                merged = report.merged,
                deleted = report.deleted,
                diverged = report.diverged,
                "Pulled changes from peers"
            );
        }
        Ok(report)
    }

    // =========================================================================
    // Publish
    // =========================================================================

    async fn publish(
        &self,
        state: &mut SyncState,
        cancel: &CancellationToken,
        report: &mut CycleReport,
    ) -> Result<()> {
        let mut records: Vec<MemoryRecord> = self
            .vault
            .index()
            .records()
            .iter()
            .map(|r| (**r).clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let mut missing = HashSet::new();
        let mut uploads: Vec<ContentHash> = records
            .iter()
            .map(|r| r.content_hash.clone())
            .filter(|h| !state.published.contains_key(h))
            .collect();
        uploads.sort();
        uploads.dedup();

        for hash in uploads {
            let vault = self.vault.clone();
            let wanted = hash.clone();
            let bytes = match blocking(move || vault.blobs().read_sealed(&wanted)).await {
                Ok(bytes) => bytes,
                // Deleted since the snapshot was taken
                Err(Error::NotFound(_)) => {
                    missing.insert(hash);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let expected = ContentHash::of(&bytes);
            let address = self
                .call("upload blob", cancel, || self.network.put(bytes.clone()))
                .await?;
            if address != expected {
                return Err(Error::Network(format!(
                    "Network stored blob {} under the wrong address",
                    hash.short()
                )));
            }
            state.published.insert(hash, address);
            report.blobs_uploaded += 1;
        }

        records.retain(|r| !missing.contains(&r.content_hash));
        let live: HashSet<&ContentHash> = records.iter().map(|r| &r.content_hash).collect();
        state.published.retain(|hash, _| live.contains(hash));

        let entries: Vec<ManifestEntry> = records
            .into_iter()
            .filter_map(|record| {
                let blob_address = state.published.get(&record.content_hash)?.clone();
                Some(ManifestEntry { record, blob_address })
            })
            .collect();

        let digest = ContentHash::of(&serde_json::to_vec(&entries)?);
        if state.published_digest.as_ref() == Some(&digest) {
            tracing::debug!("Manifest unchanged, not republishing");
            return Ok(());
        }

        let payload = ManifestPayload {
            device_id: self.vault.device_id().to_string(),
            sequence: state.sequence + 1,
            generated_at: Utc::now(),
            entries,
        };
        let vault = self.vault.clone();
        let sequence = payload.sequence;
        let count = payload.entries.len();
        let manifest = blocking(move || {
            vault.with_keys(|master, device| SignedManifest::seal(&payload, master, device))
        })
        .await?;

        self.call("publish manifest", cancel, || self.network.publish(&manifest))
            .await?;

        state.sequence = sequence;
        state.published_digest = Some(digest);
        self.save_state(state).await?;
        report.published = true;
        tracing::debug!(sequence, entries = count, "Manifest published");
        Ok(())
    }

    // =========================================================================
    // Pull
    // =========================================================================

    /// Returns whether the peer's manifest was applied
    async fn pull_peer(
        &self,
        state: &mut SyncState,
        manifest: SignedManifest,
        cancel: &CancellationToken,
        report: &mut CycleReport,
    ) -> Result<bool> {
        let device_id = manifest.device_id.clone();
        let peer = state.peers.get(&device_id).cloned().unwrap_or_default();
        if manifest.sequence <= peer.sequence {
            return Ok(false);
        }
        state.check_peer_key(&device_id, &manifest.verifying_key)?;

        let vault = self.vault.clone();
        let envelope = manifest.clone();
        let payload = blocking(move || vault.with_keys(|master, _| envelope.open(master))).await?;

        let mut plan = Vec::with_capacity(payload.entries.len());
        let mut remote_ids = HashSet::new();
        for entry in payload.entries {
            let id = entry.record.id;
            remote_ids.insert(id);

            if self.vault.index().contains(&id) {
                plan.push(PlannedChange::Merge(entry.record));
                continue;
            }

            let unchanged_since_sync = peer
                .entries
                .get(&id)
                .is_some_and(|known| known.remote_version == entry.record.version);
            if unchanged_since_sync {
                plan.push(PlannedChange::Seen(entry.record));
                continue;
            }

            let blob = if self.vault.blobs().contains(&entry.record.content_hash) {
                None
            } else {
                Some(self.fetch_blob(&entry, cancel).await?)
            };
            plan.push(PlannedChange::Insert {
                record: entry.record,
                blob,
            });
        }
        for id in peer.entries.keys().filter(|id| !remote_ids.contains(*id)) {
            plan.push(PlannedChange::RemoteDeleted(*id));
        }

        // Commit point: nothing has been written for this peer yet
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let vault = self.vault.clone();
        let verifying_key = manifest.verifying_key.clone();
        let sequence = manifest.sequence;
        let (peer, tally) = blocking(move || {
            // Session before writer, so a rotation cannot land mid-commit
            let (mut peer, tally) = vault.with_keys(|_, _| commit(&vault, peer, plan))?;
            peer.verifying_key = verifying_key;
            peer.sequence = sequence;
            peer.last_pulled = Some(Utc::now());
            Ok((peer, tally))
        })
        .await?;

        state.peers.insert(device_id, peer);
        self.save_state(state).await?;

        report.inserted += tally.inserted;
        report.merged += tally.merged;
        report.deleted += tally.deleted;
        report.skipped += tally.skipped;
        report.diverged += tally.diverged;
        Ok(true)
    }

    /// Fetch a blob, check it against its address, then against its hash
    async fn fetch_blob(&self, entry: &ManifestEntry, cancel: &CancellationToken) -> Result<VerifiedBlob> {
        let address = &entry.blob_address;
        let bytes = self
            .call("fetch blob", cancel, || self.network.fetch(address))
            .await?;
        if ContentHash::of(&bytes) != *address {
            return Err(Error::Corruption(format!(
                "Object {} does not match its address",
                address.short()
            )));
        }

        let vault = self.vault.clone();
        let record = entry.record.clone();
        blocking(move || {
            vault.with_keys(|master, _| {
                vault
                    .blobs()
                    .verify_sealed(master, &record.content_hash, &record.wrapped_data_key, bytes)
            })
        })
        .await
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Run a network call with a deadline, retrying retryable failures with
    /// exponential backoff. Cancellation interrupts both the call and the wait.
    async fn call<T, F, Fut>(&self, what: &str, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                result = tokio::time::timeout(self.request_timeout, op()) => match result {
                    Ok(result) => result,
                    Err(_) => Err(Error::SyncTimeout(format!(
                        "{} exceeded {:?}",
                        what, self.request_timeout
                    ))),
                },
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = backoff_delay(&self.config, attempt);
                    tracing::warn!(attempt, ?delay, "{} failed, retrying: {}", what, e);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn save_state(&self, state: &SyncState) -> Result<()> {
        let snapshot = state.clone();
        let dir = self.vault.sync_dir();
        blocking(move || snapshot.save(&dir)).await
    }

    fn update_status(&self, f: impl FnOnce(&mut SyncStatus)) {
        let mut status = self.status.write().unwrap_or_else(|p| p.into_inner());
        f(&mut status);
    }
}

/// `base * 2^(attempt - 1)`, capped at the configured maximum
fn backoff_delay(config: &SyncConfig, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    let delay = config.backoff_base_ms.saturating_mul(factor).min(config.backoff_max_ms);
    Duration::from_millis(delay)
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("Sync task failed: {}", e)))?
}

/// Apply a validated plan under the vault writer lock. Callers hold the
/// session lock first.
fn commit(vault: &Vault, mut peer: PeerState, plan: Vec<PlannedChange>) -> Result<(PeerState, CommitTally)> {
    let _writer = vault.writer();
    let previous = std::mem::take(&mut peer.entries);
    let mut tally = CommitTally::default();

    for change in plan {
        match change {
            PlannedChange::Seen(remote) => {
                let local_version = previous.get(&remote.id).map(|e| e.local_version).unwrap_or(0);
                peer.entries.insert(remote.id, peer_entry(&remote, local_version));
                tally.skipped += 1;
            }
            PlannedChange::Insert { record, blob } => {
                let id = record.id;
                if vault.index().contains(&id) {
                    let entry = merge_into_local(vault, &record, previous.get(&id), &mut tally)?;
                    peer.entries.insert(id, entry);
                    continue;
                }
                if let Some(entry) = insert_remote(vault, record, blob)? {
                    peer.entries.insert(id, entry);
                    tally.inserted += 1;
                }
            }
            PlannedChange::Merge(remote) => {
                let id = remote.id;
                if vault.index().contains(&id) {
                    let entry = merge_into_local(vault, &remote, previous.get(&id), &mut tally)?;
                    peer.entries.insert(id, entry);
                } else {
                    // Deleted locally while the batch was being validated
                    peer.entries.insert(id, peer_entry(&remote, 0));
                    tally.skipped += 1;
                }
            }
            PlannedChange::RemoteDeleted(id) => {
                let Some(known) = previous.get(&id) else {
                    continue;
                };
                let Ok(local) = vault.index().get(&id) else {
                    continue;
                };
                // A local edit since the last sync reverts the remote deletion
                if local.version == known.local_version {
                    let hash = vault.index().delete(&id)?;
                    vault.blobs().release(&hash)?;
                    tracing::debug!(id = %id, "Applied remote deletion");
                    tally.deleted += 1;
                }
            }
        }
    }

    Ok((peer, tally))
}

fn peer_entry(remote: &MemoryRecord, local_version: u64) -> PeerEntry {
    PeerEntry {
        content_hash: remote.content_hash.clone(),
        remote_version: remote.version,
        local_version,
    }
}

fn merge_into_local(
    vault: &Vault,
    remote: &MemoryRecord,
    known: Option<&PeerEntry>,
    tally: &mut CommitTally,
) -> Result<PeerEntry> {
    let local = vault.index().get(&remote.id)?;

    // Peer has not touched the record since we last synced with it; keep the
    // local version recorded then so a later remote edit is seen as concurrent
    // with any local edit made in between.
    if let Some(known) = known {
        if known.remote_version == remote.version {
            tally.skipped += 1;
            return Ok(known.clone());
        }
    }

    let relation = match known {
        Some(known) if local.version == known.local_version && remote.version > known.remote_version => {
            Relation::RemoteAhead
        }
        _ => Relation::Concurrent,
    };

    match merge_records(&local, remote, relation) {
        MergeOutcome::Unchanged => {
            tally.skipped += 1;
            Ok(peer_entry(remote, local.version))
        }
        MergeOutcome::Merged(merged) => {
            let stored = vault.index().replace(merged, local.version)?;
            tracing::debug!(id = %stored.id, version = stored.version, ?relation, "Merged remote edit");
            tally.merged += 1;
            Ok(peer_entry(remote, stored.version))
        }
        MergeOutcome::Diverged => {
            tracing::warn!(
                id = %remote.id,
                local_hash = %local.content_hash.short(),
                remote_hash = %remote.content_hash.short(),
                "Record diverged between devices; keeping local copy"
            );
            tally.diverged += 1;
            Ok(peer_entry(remote, local.version))
        }
    }
}

/// Insert a record we do not have, taking a reference on its blob
fn insert_remote(vault: &Vault, mut record: MemoryRecord, blob: Option<VerifiedBlob>) -> Result<Option<PeerEntry>> {
    let wrapped = match blob {
        Some(blob) => vault.blobs().import(blob)?.wrapped_key,
        None => match vault.blobs().acquire(&record.content_hash) {
            Ok(wrapped) => wrapped,
            Err(Error::NotFound(_)) => {
                // Erased locally after planning; the next cycle fetches it
                tracing::debug!(id = %record.id, "Blob vanished before commit, deferring");
                return Ok(None);
            }
            Err(e) => return Err(e),
        },
    };

    record.wrapped_data_key = wrapped;
    let hash = record.content_hash.clone();
    let entry = peer_entry(&record, record.version);
    if let Err(e) = vault.index().insert(record) {
        if let Err(release_err) = vault.blobs().release(&hash) {
            tracing::warn!(hash = %hash.short(), "Failed to release blob after insert failure: {}", release_err);
        }
        return Err(e);
    }
    Ok(Some(entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryPatch;
    use crate::sync::MemoryNetwork;
    use crate::vault::tests::{memory, test_config};
    use crate::vault::KEY_FILE;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    struct Devices {
        a: Arc<SyncEngine>,
        b: Arc<SyncEngine>,
        network: MemoryNetwork,
        _dir: TempDir,
    }

    fn sync_config() -> SyncConfig {
        SyncConfig {
            max_attempts: 2,
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            ..Default::default()
        }
    }

    fn devices() -> Devices {
        let dir = TempDir::new().unwrap();
        let vault_a = Vault::create(test_config(&dir.path().join("a")), b"pw").unwrap();
        let key_file = vault_a.root().join(KEY_FILE);
        let vault_b = Vault::join(test_config(&dir.path().join("b")), &key_file, b"pw").unwrap();

        let network = MemoryNetwork::new();
        let engine = |vault: Vault| {
            Arc::new(SyncEngine::new(Arc::new(vault), Arc::new(network.clone()), sync_config()).unwrap())
        };
        Devices {
            a: engine(vault_a),
            b: engine(vault_b),
            network,
            _dir: dir,
        }
    }

    async fn cycle(engine: &SyncEngine) -> CycleReport {
        engine.sync_once(&CancellationToken::new()).await.unwrap()
    }

    /// Both devices hold record R after this
    async fn shared_record(devices: &Devices) -> MemoryId {
        let record = devices.a.vault.add_memory(memory("R", "", b"shared photo")).unwrap();
        cycle(&devices.a).await;
        cycle(&devices.b).await;
        cycle(&devices.b).await;
        cycle(&devices.a).await;
        record.id
    }

    fn tags(engine: &SyncEngine, id: &MemoryId) -> BTreeSet<String> {
        engine.vault.get_record(id).unwrap().tags.clone()
    }

    fn add_tag(engine: &SyncEngine, id: &MemoryId, tag: &str) {
        let record = engine.vault.get_record(id).unwrap();
        let mut tags = record.tags.clone();
        tags.insert(tag.to_string());
        let patch = MemoryPatch {
            tags: Some(tags),
            ..Default::default()
        };
        engine.vault.update_memory(id, patch, record.version).unwrap();
    }

    #[tokio::test]
    async fn test_insert_propagates_with_media() {
        let devices = devices();
        let record = devices.a.vault.add_memory(memory("Beach", "summer", b"jpeg")).unwrap();

        let report = cycle(&devices.a).await;
        assert!(report.published);
        assert_eq!(report.blobs_uploaded, 1);

        let report = cycle(&devices.b).await;
        assert_eq!(report.inserted, 1);

        let detail = devices.b.vault.get_memory_by_id(&record.id).unwrap();
        assert_eq!(&detail.media[..], b"jpeg");
        assert_eq!(detail.title, "Beach");
        assert_eq!(detail.version, 1);
    }

    #[tokio::test]
    async fn test_concurrent_tag_edits_converge() {
        let devices = devices();
        let id = shared_record(&devices).await;

        add_tag(&devices.a, &id, "x");
        add_tag(&devices.b, &id, "y");

        cycle(&devices.a).await;
        cycle(&devices.b).await;
        cycle(&devices.a).await;
        cycle(&devices.b).await;

        let expected: BTreeSet<String> = ["x", "y"].iter().map(|t| t.to_string()).collect();
        assert_eq!(tags(&devices.a, &id), expected);
        assert_eq!(tags(&devices.b, &id), expected);

        let on_a = devices.a.vault.get_record(&id).unwrap();
        let on_b = devices.b.vault.get_record(&id).unwrap();
        assert_eq!(on_a.version, on_b.version);
        assert_eq!(on_a.title, on_b.title);
    }

    #[tokio::test]
    async fn test_title_conflict_recorded() {
        let devices = devices();
        let id = shared_record(&devices).await;

        let v = devices.a.vault.get_record(&id).unwrap().version;
        let rename = |title: &str| MemoryPatch {
            title: Some(title.to_string()),
            ..Default::default()
        };
        devices.a.vault.update_memory(&id, rename("Alpha"), v).unwrap();
        devices.b.vault.update_memory(&id, rename("Beta"), v).unwrap();

        cycle(&devices.a).await;
        cycle(&devices.b).await;
        cycle(&devices.a).await;

        for engine in [&devices.a, &devices.b] {
            let record = engine.vault.get_record(&id).unwrap();
            assert_eq!(record.title, "Beta");
            assert_eq!(record.conflicts.len(), 1);
            assert_eq!(record.conflicts[0].title, "Alpha");
            assert_eq!(engine.status().pending_conflicts, 1);
        }
    }

    #[tokio::test]
    async fn test_transcription_conflict_recorded() {
        let devices = devices();
        let id = shared_record(&devices).await;

        let v = devices.a.vault.get_record(&id).unwrap().version;
        let transcribe = |text: &str| MemoryPatch {
            transcription: Some(text.to_string()),
            ..Default::default()
        };
        devices.a.vault.update_memory(&id, transcribe("see you at noon"), v).unwrap();
        devices.b.vault.update_memory(&id, transcribe("see you at two"), v).unwrap();

        cycle(&devices.a).await;
        cycle(&devices.b).await;
        cycle(&devices.a).await;

        for engine in [&devices.a, &devices.b] {
            let record = engine.vault.get_record(&id).unwrap();
            assert_eq!(record.transcription.as_deref(), Some("see you at two"));
            assert_eq!(record.transcription_conflicts.len(), 1);
            assert_eq!(
                record.transcription_conflicts[0].transcription.as_deref(),
                Some("see you at noon")
            );
            assert!(record.conflicts.is_empty());
        }
    }

    #[tokio::test]
    async fn test_local_delete_stands_without_remote_edit() {
        let devices = devices();
        let id = shared_record(&devices).await;

        devices.b.vault.delete_memory(&id).unwrap();
        cycle(&devices.b).await;
        assert!(!devices.b.vault.index().contains(&id));

        // A applies the deletion since it never edited the record
        let report = cycle(&devices.a).await;
        assert_eq!(report.deleted, 1);
        assert!(!devices.a.vault.index().contains(&id));

        cycle(&devices.b).await;
        assert!(!devices.b.vault.index().contains(&id));
    }

    #[tokio::test]
    async fn test_edit_reverts_remote_delete() {
        let devices = devices();
        let id = shared_record(&devices).await;

        devices.b.vault.delete_memory(&id).unwrap();
        add_tag(&devices.a, &id, "keep");

        cycle(&devices.b).await;
        cycle(&devices.a).await;
        assert!(devices.a.vault.index().contains(&id));

        let report = cycle(&devices.b).await;
        assert_eq!(report.inserted, 1);
        assert!(tags(&devices.b, &id).contains("keep"));
        assert_eq!(&devices.b.vault.get_memory_by_id(&id).unwrap().media[..], b"shared photo");
    }

    #[tokio::test]
    async fn test_offline_network_leaves_vault_usable() {
        let devices = devices();
        devices.network.set_offline(true);

        let result = devices.a.sync_once(&CancellationToken::new()).await;
        // Nothing to upload yet, so publishing the empty manifest fails first
        assert!(matches!(result, Err(Error::Network(_))));
        assert!(devices.a.status().last_error.is_some());

        let record = devices.a.vault.add_memory(memory("offline", "", b"still works")).unwrap();
        assert_eq!(&devices.a.vault.get_memory_by_id(&record.id).unwrap().media[..], b"still works");

        devices.network.set_offline(false);
        cycle(&devices.a).await;
        assert!(devices.a.status().last_error.is_none());
        assert_eq!(devices.a.status().cycles, 1);
    }

    #[tokio::test]
    async fn test_slow_network_times_out() {
        let dir = TempDir::new().unwrap();
        let vault = Vault::create(test_config(dir.path()), b"pw").unwrap();
        let network = MemoryNetwork::new();
        network.set_latency(Duration::from_millis(500));

        let engine = SyncEngine::new(Arc::new(vault), Arc::new(network), sync_config())
            .unwrap()
            .with_request_timeout(Duration::from_millis(20));
        let result = engine.sync_once(&CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::SyncTimeout(_))));
    }

    #[tokio::test]
    async fn test_cancel_commits_nothing() {
        let devices = devices();
        devices.a.vault.add_memory(memory("pending", "", b"bytes")).unwrap();
        cycle(&devices.a).await;

        devices.network.set_latency(Duration::from_secs(10));
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = devices.b.sync_once(&cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(devices.b.vault.list_memories().is_empty());
    }

    #[tokio::test]
    async fn test_tampered_blob_rejects_peer_batch() {
        let devices = devices();
        let keep = devices.a.vault.add_memory(memory("one", "", b"first")).unwrap();
        let bad = devices.a.vault.add_memory(memory("two", "", b"second")).unwrap();
        cycle(&devices.a).await;

        let state = devices.a.state.lock().await;
        let address = state.published[&bad.content_hash].clone();
        drop(state);
        devices.network.tamper(&address, b"garbage".to_vec());

        let report = cycle(&devices.b).await;
        assert_eq!(report.peers_rejected, 1);
        // The batch is all or nothing
        assert!(!devices.b.vault.index().contains(&keep.id));
        assert!(devices.b.vault.list_memories().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_and_stop() {
        let devices = devices();
        devices.a.vault.add_memory(memory("bg", "", b"background")).unwrap();

        let handle = devices.a.clone().spawn();
        for _ in 0..100 {
            if handle.status().cycles > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(handle.status().running);
        assert!(handle.status().cycles >= 1);

        let engine = handle.engine().clone();
        handle.stop().await;
        assert!(!engine.status().running);
    }

    #[test]
    fn test_backoff_delay() {
        let config = SyncConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 1000,
            ..Default::default()
        };
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&config, 4), Duration::from_millis(800));
        assert_eq!(backoff_delay(&config, 5), Duration::from_millis(1000));
        assert_eq!(backoff_delay(&config, 80), Duration::from_millis(1000));
    }
}
