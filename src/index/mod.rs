//! Metadata index
//!
//! One JSON file per record under `records/`, mirrored by an in-memory
//! snapshot behind a reader/writer lock. Writers build a new snapshot
//! (copy-on-write) so listings taken earlier keep iterating the state they
//! started with.

mod record;

pub use record::{
    ListFilter, MemoryId, MemoryPatch, MemoryRecord, MemorySummary, TitleConflict,
    TranscriptionConflict,
};

use crate::blob::ContentHash;
use crate::error::{Error, Result};
use crate::persist;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

type OrderKey = (Reverse<DateTime<Utc>>, MemoryId);

#[derive(Debug, Clone, Default)]
struct IndexState {
    records: HashMap<MemoryId, Arc<MemoryRecord>>,
    /// Newest first
    order: BTreeSet<OrderKey>,
}

impl IndexState {
    fn put(&mut self, record: Arc<MemoryRecord>) {
        if let Some(old) = self.records.insert(record.id, record.clone()) {
            self.order.remove(&(Reverse(old.created_at), old.id));
        }
        self.order.insert((Reverse(record.created_at), record.id));
    }

    fn remove(&mut self, id: &MemoryId) -> Option<Arc<MemoryRecord>> {
        let old = self.records.remove(id)?;
        self.order.remove(&(Reverse(old.created_at), old.id));
        Some(old)
    }
}

/// Ordered, filtered view over an index snapshot.
///
/// Iteration is lazy and can be restarted any number of times; writes made
/// after the listing was taken are not visible through it.
#[derive(Debug, Clone)]
pub struct MemoryListing {
    snapshot: Arc<IndexState>,
    filter: ListFilter,
}

impl MemoryListing {
    /// Summaries, most recent first
    pub fn iter(&self) -> impl Iterator<Item = MemorySummary> + '_ {
        self.records().map(|r| r.summary())
    }

    /// Full records, most recent first
    pub fn records(&self) -> impl Iterator<Item = &MemoryRecord> + '_ {
        self.snapshot
            .order
            .iter()
            .filter_map(|(_, id)| self.snapshot.records.get(id))
            .map(|r| r.as_ref())
            .filter(|r| self.filter.matches(r))
    }
}

/// Catalog of memory records
pub struct MetadataIndex {
    dir: PathBuf,
    state: RwLock<Arc<IndexState>>,
}

impl MetadataIndex {
    /// Open (or create) the index under `root`.
    ///
    /// Fails if any record file is unreadable.
    pub fn open(root: &Path) -> Result<Self> {
        let dir = root.join("records");
        std::fs::create_dir_all(&dir)?;

        let mut state = IndexState::default();
        for record in persist::load_json_dir::<MemoryRecord>(&dir)? {
            state.put(Arc::new(record));
        }
        tracing::debug!(records = state.records.len(), "Metadata index loaded");

        Ok(Self {
            dir,
            state: RwLock::new(Arc::new(state)),
        })
    }

    /// Add a new record; fails with `Conflict` if the id is taken
    pub fn insert(&self, record: MemoryRecord) -> Result<Arc<MemoryRecord>> {
        let mut state = self.write();
        if state.records.contains_key(&record.id) {
            return Err(Error::Conflict(format!("Memory {} already exists", record.id)));
        }

        persist::write_json_atomic(&self.record_path(&record.id), &record)?;
        let record = Arc::new(record);
        Arc::make_mut(&mut state).put(record.clone());
        Ok(record)
    }

    /// Point lookup
    pub fn get(&self, id: &MemoryId) -> Result<Arc<MemoryRecord>> {
        self.read()
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Memory {}", id)))
    }

    pub fn contains(&self, id: &MemoryId) -> bool {
        self.read().records.contains_key(id)
    }

    /// Ordered listing over the current snapshot
    pub fn list(&self, filter: ListFilter) -> MemoryListing {
        MemoryListing {
            snapshot: self.read().clone(),
            filter,
        }
    }

    /// Edit title/tags if the stored version is still `expected_version`
    pub fn update(
        &self,
        id: &MemoryId,
        patch: MemoryPatch,
        expected_version: u64,
    ) -> Result<Arc<MemoryRecord>> {
        let mut state = self.write();
        let current = state
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Memory {}", id)))?;

        if current.version != expected_version {
            return Err(Error::VersionMismatch {
                expected: expected_version,
                actual: current.version,
            });
        }

        let mut updated = (*current).clone();
        patch.apply(&mut updated);
        updated.version += 1;

        persist::write_json_atomic(&self.record_path(id), &updated)?;
        let updated = Arc::new(updated);
        Arc::make_mut(&mut state).put(updated.clone());
        Ok(updated)
    }

    /// Remove a record, returning the hash whose reference the caller must release
    pub fn delete(&self, id: &MemoryId) -> Result<ContentHash> {
        let mut state = self.write();
        if !state.records.contains_key(id) {
            return Err(Error::NotFound(format!("Memory {}", id)));
        }

        persist::remove_if_exists(&self.record_path(id))?;
        let removed = Arc::make_mut(&mut state)
            .remove(id)
            .ok_or_else(|| Error::Internal(format!("Memory {} vanished during delete", id)))?;
        Ok(removed.content_hash.clone())
    }

    /// Swap in a whole record (sync merge). Same version check as `update`,
    /// but the caller chooses the new version.
    pub(crate) fn replace(&self, record: MemoryRecord, expected_version: u64) -> Result<Arc<MemoryRecord>> {
        let mut state = self.write();
        let current = state
            .records
            .get(&record.id)
            .ok_or_else(|| Error::NotFound(format!("Memory {}", record.id)))?;

        if current.version != expected_version {
            return Err(Error::VersionMismatch {
                expected: expected_version,
                actual: current.version,
            });
        }
        if current.content_hash != record.content_hash || current.created_at != record.created_at {
            return Err(Error::Internal(format!(
                "Immutable fields of memory {} cannot change",
                record.id
            )));
        }

        persist::write_json_atomic(&self.record_path(&record.id), &record)?;
        let record = Arc::new(record);
        Arc::make_mut(&mut state).put(record.clone());
        Ok(record)
    }

    /// Rewrite records through `f` (key rotation). `f` returns `None` to
    /// leave a record alone. Each changed record is persisted before the
    /// next is visited, so on error the records already rewritten stay
    /// rewritten on disk and in memory alike. Versions are left as `f`
    /// returns them.
    pub(crate) fn rewrite_all<F>(&self, mut f: F) -> Result<usize>
    where
        F: FnMut(&MemoryRecord) -> Result<Option<MemoryRecord>>,
    {
        let mut state = self.write();
        let current: Vec<Arc<MemoryRecord>> = state.records.values().cloned().collect();

        let mut rewritten = 0;
        for record in current {
            let Some(updated) = f(&record)? else {
                continue;
            };
            if updated.id != record.id {
                return Err(Error::Internal("Rewrite must not change record ids".to_string()));
            }
            persist::write_json_atomic(&self.record_path(&updated.id), &updated)?;
            Arc::make_mut(&mut state).put(Arc::new(updated));
            rewritten += 1;
        }
        Ok(rewritten)
    }

    /// Live reference count per content hash
    pub fn hash_refcounts(&self) -> HashMap<ContentHash, u64> {
        let mut counts = HashMap::new();
        for record in self.read().records.values() {
            *counts.entry(record.content_hash.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// All records, unordered
    pub fn records(&self) -> Vec<Arc<MemoryRecord>> {
        self.read().records.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Newest `created_at` in the vault
    pub fn latest_created_at(&self) -> Option<DateTime<Utc>> {
        self.read().order.first().map(|(Reverse(at), _)| *at)
    }

    /// Number of records carrying unresolved title conflicts
    pub fn pending_conflicts(&self) -> usize {
        self.read().records.values().filter(|r| r.has_conflicts()).count()
    }

    fn record_path(&self, id: &MemoryId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn read(&self) -> RwLockReadGuard<'_, Arc<IndexState>> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Arc<IndexState>> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::WrappedKey;
    use chrono::Duration;
    use tempfile::TempDir;

    fn record_at(title: &str, tags: &[&str], created_at: DateTime<Utc>) -> MemoryRecord {
        MemoryRecord {
            id: MemoryId::generate(),
            title: title.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            created_at,
            media_type: "image/jpeg".to_string(),
            filename: format!("{}.jpg", title),
            content_hash: ContentHash::of(title.as_bytes()),
            wrapped_data_key: WrappedKey::from_bytes(vec![0; 60]),
            size_bytes: title.len() as u64,
            version: 1,
            transcription: None,
            conflicts: Vec::new(),
            transcription_conflicts: Vec::new(),
        }
    }

    fn make_index() -> (MetadataIndex, TempDir) {
        let dir = TempDir::new().unwrap();
        (MetadataIndex::open(dir.path()).unwrap(), dir)
    }

    #[test]
    fn test_insert_and_get() {
        let (index, _dir) = make_index();
        let record = record_at("beach", &["summer"], Utc::now());
        let id = record.id;

        index.insert(record).unwrap();
        let fetched = index.get(&id).unwrap();
        assert_eq!(fetched.title, "beach");
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_duplicate_id_conflicts() {
        let (index, _dir) = make_index();
        let record = record_at("a", &[], Utc::now());
        index.insert(record.clone()).unwrap();
        assert!(matches!(index.insert(record), Err(Error::Conflict(_))));
    }

    #[test]
    fn test_get_unknown() {
        let (index, _dir) = make_index();
        assert!(matches!(index.get(&MemoryId::generate()), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_list_newest_first() {
        let (index, _dir) = make_index();
        let base = Utc::now();
        for i in [3, 1, 4, 0, 2] {
            index
                .insert(record_at(&format!("m{}", i), &[], base + Duration::seconds(i)))
                .unwrap();
        }

        let titles: Vec<String> = index.list(ListFilter::default()).iter().map(|s| s.title).collect();
        assert_eq!(titles, vec!["m4", "m3", "m2", "m1", "m0"]);
    }

    #[test]
    fn test_list_tag_filter() {
        let (index, _dir) = make_index();
        index.insert(record_at("a", &["beach"], Utc::now())).unwrap();
        index.insert(record_at("b", &["city"], Utc::now())).unwrap();
        index.insert(record_at("c", &["beach", "city"], Utc::now())).unwrap();

        let listing = index.list(ListFilter::tags(["beach"]));
        assert_eq!(listing.iter().count(), 2);
        let listing = index.list(ListFilter::tags(["forest"]));
        assert_eq!(listing.iter().count(), 0);
    }

    #[test]
    fn test_listing_is_restartable_snapshot() {
        let (index, _dir) = make_index();
        index.insert(record_at("a", &[], Utc::now())).unwrap();

        let listing = index.list(ListFilter::default());
        index.insert(record_at("b", &[], Utc::now())).unwrap();

        assert_eq!(listing.iter().count(), 1);
        assert_eq!(listing.iter().count(), 1);
        assert_eq!(index.list(ListFilter::default()).iter().count(), 2);
    }

    #[test]
    fn test_update_bumps_version() {
        let (index, _dir) = make_index();
        let record = record_at("old", &["x"], Utc::now());
        let id = record.id;
        index.insert(record).unwrap();

        let patch = MemoryPatch {
            title: Some("new".to_string()),
            ..Default::default()
        };
        let updated = index.update(&id, patch, 1).unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.title, "new");
        assert!(updated.tags.contains("x"));
        assert_eq!(updated.content_hash, ContentHash::of(b"old"));
    }

    #[test]
    fn test_stale_update_rejected() {
        let (index, _dir) = make_index();
        let record = record_at("a", &[], Utc::now());
        let id = record.id;
        index.insert(record).unwrap();
        index.update(&id, MemoryPatch::default(), 1).unwrap();

        let err = index.update(&id, MemoryPatch::default(), 1).unwrap_err();
        assert!(matches!(err, Error::VersionMismatch { expected: 1, actual: 2 }));
    }

    #[test]
    fn test_delete_returns_hash() {
        let (index, dir) = make_index();
        let record = record_at("gone", &[], Utc::now());
        let id = record.id;
        index.insert(record).unwrap();

        assert_eq!(index.delete(&id).unwrap(), ContentHash::of(b"gone"));
        assert!(!index.contains(&id));
        assert!(!dir.path().join("records").join(format!("{}.json", id)).exists());
        assert!(matches!(index.delete(&id), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_reopen_restores_state() {
        let dir = TempDir::new().unwrap();
        let id = {
            let index = MetadataIndex::open(dir.path()).unwrap();
            let record = record_at("kept", &["t"], Utc::now());
            let id = record.id;
            index.insert(record).unwrap();
            index
                .update(&id, MemoryPatch { title: Some("kept2".into()), ..Default::default() }, 1)
                .unwrap();
            id
        };

        let index = MetadataIndex::open(dir.path()).unwrap();
        let record = index.get(&id).unwrap();
        assert_eq!(record.title, "kept2");
        assert_eq!(record.version, 2);
    }

    #[test]
    fn test_corrupt_record_fails_open() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("records")).unwrap();
        std::fs::write(dir.path().join("records").join("x.json"), "{").unwrap();
        assert!(matches!(MetadataIndex::open(dir.path()), Err(Error::Corruption(_))));
    }

    #[test]
    fn test_replace_keeps_immutable_fields() {
        let (index, _dir) = make_index();
        let record = record_at("a", &[], Utc::now());
        index.insert(record.clone()).unwrap();

        let mut changed = record.clone();
        changed.content_hash = ContentHash::of(b"other");
        changed.version = 2;
        assert!(index.replace(changed, 1).is_err());

        let mut merged = record.clone();
        merged.tags.insert("y".to_string());
        merged.version = 2;
        assert_eq!(index.replace(merged, 1).unwrap().version, 2);
    }

    #[test]
    fn test_hash_refcounts() {
        let (index, _dir) = make_index();
        let a = record_at("same", &[], Utc::now());
        let mut b = record_at("same", &[], Utc::now());
        b.id = MemoryId::generate();
        index.insert(a).unwrap();
        index.insert(b).unwrap();

        let counts = index.hash_refcounts();
        assert_eq!(counts.get(&ContentHash::of(b"same")), Some(&2));
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        let (index, _dir) = make_index();
        let index = Arc::new(index);

        std::thread::scope(|scope| {
            for t in 0..4 {
                let index = index.clone();
                scope.spawn(move || {
                    for i in 0..10 {
                        index
                            .insert(record_at(&format!("t{}-{}", t, i), &[], Utc::now()))
                            .unwrap();
                        let _ = index.list(ListFilter::default()).iter().count();
                    }
                });
            }
        });

        assert_eq!(index.len(), 40);
    }
}
