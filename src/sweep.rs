//! Orphan refcount sweep
//!
//! Compares the blob ledger with the references held by live records and
//! reclaims the surplus. Conservative: anything touched within the grace
//! period is left alone, so an ingest between its blob write and its index
//! insert is never raced. Running it twice in a row changes nothing the
//! second time.

use crate::blob::{BlobStore, ContentHash, ReconcileStats};
use crate::error::Result;
use crate::index::MetadataIndex;
use chrono::{Duration, Utc};
use serde::Serialize;

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub blobs_scanned: u64,
    pub references_reclaimed: u64,
    pub blobs_erased: u64,
    pub bytes_reclaimed: u64,
    pub stray_files_removed: u64,
    /// Blobs referenced more often than their refcount; never auto-corrected
    pub undercounted: Vec<ContentHash>,
}

impl From<ReconcileStats> for SweepReport {
    fn from(stats: ReconcileStats) -> Self {
        Self {
            blobs_scanned: stats.scanned,
            references_reclaimed: stats.references_reclaimed,
            blobs_erased: stats.blobs_erased,
            bytes_reclaimed: stats.bytes_reclaimed,
            stray_files_removed: stats.stray_files_removed,
            undercounted: stats.undercounted,
        }
    }
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.references_reclaimed == 0 && self.stray_files_removed == 0 && self.undercounted.is_empty()
    }
}

/// Reconcile `blobs` against `index`.
///
/// Callers must hold the vault writer lock so no record is inserted or
/// deleted while live references are counted.
pub(crate) fn sweep(blobs: &BlobStore, index: &MetadataIndex, grace: Duration) -> Result<SweepReport> {
    let live = index.hash_refcounts();
    let cutoff = Utc::now() - grace;
    let report: SweepReport = blobs.reconcile(&live, cutoff)?.into();

    if report.is_clean() {
        tracing::debug!(scanned = report.blobs_scanned, "Sweep found nothing to reclaim");
    } else {
        tracing::info!(
            scanned = report.blobs_scanned,
            reclaimed = report.references_reclaimed,
            erased = report.blobs_erased,
            stray = report.stray_files_removed,
            undercounted = report.undercounted.len(),
            "Sweep completed"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IngestConfig, KdfConfig};
    use crate::crypto::{derive_master_key, generate_salt, MasterKey};
    use crate::index::{MemoryId, MemoryRecord};
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn setup() -> (BlobStore, MetadataIndex, MasterKey, TempDir) {
        let dir = TempDir::new().unwrap();
        let blobs = BlobStore::open(dir.path(), &IngestConfig::default()).unwrap();
        let index = MetadataIndex::open(dir.path()).unwrap();
        let master = derive_master_key(b"pw", &generate_salt(), &KdfConfig::insecure_for_tests()).unwrap();
        (blobs, index, master, dir)
    }

    fn record_for(blobs: &BlobStore, master: &MasterKey, media: &[u8]) -> MemoryRecord {
        let stored = blobs.put(master, media).unwrap();
        MemoryRecord {
            id: MemoryId::generate(),
            title: "t".to_string(),
            tags: BTreeSet::new(),
            created_at: Utc::now(),
            media_type: "text/plain".to_string(),
            filename: "t.txt".to_string(),
            content_hash: stored.hash,
            wrapped_data_key: stored.wrapped_key,
            size_bytes: media.len() as u64,
            version: 1,
            transcription: None,
            conflicts: Vec::new(),
            transcription_conflicts: Vec::new(),
        }
    }

    #[test]
    fn test_orphan_reclaimed_after_grace() {
        let (blobs, index, master, _dir) = setup();
        let kept = record_for(&blobs, &master, b"kept");
        index.insert(kept.clone()).unwrap();
        // Reference taken but the insert never happened
        let orphan = blobs.put(&master, b"orphan").unwrap();

        let report = sweep(&blobs, &index, Duration::hours(1)).unwrap();
        assert_eq!(report.blobs_erased, 0);
        assert!(blobs.contains(&orphan.hash));

        let report = sweep(&blobs, &index, Duration::zero()).unwrap();
        assert_eq!(report.blobs_erased, 1);
        assert!(!blobs.contains(&orphan.hash));
        assert!(blobs.contains(&kept.content_hash));

        let again = sweep(&blobs, &index, Duration::zero()).unwrap();
        assert!(again.is_clean());
    }

    #[test]
    fn test_surplus_reference_on_shared_blob() {
        let (blobs, index, master, _dir) = setup();
        let record = record_for(&blobs, &master, b"shared");
        index.insert(record.clone()).unwrap();
        blobs.put(&master, b"shared").unwrap();
        assert_eq!(blobs.entry(&record.content_hash).unwrap().refcount, 2);

        let report = sweep(&blobs, &index, Duration::zero()).unwrap();
        assert_eq!(report.references_reclaimed, 1);
        assert_eq!(report.blobs_erased, 0);
        assert_eq!(blobs.entry(&record.content_hash).unwrap().refcount, 1);
    }

    #[test]
    fn test_stray_files_removed() {
        let (blobs, index, _master, dir) = setup();
        let stray = dir.path().join("media").join("ab").join(ContentHash::of(b"stray").as_str());
        std::fs::create_dir_all(stray.parent().unwrap()).unwrap();
        std::fs::write(&stray, b"leftover").unwrap();

        let report = sweep(&blobs, &index, Duration::zero()).unwrap();
        assert_eq!(report.stray_files_removed, 1);
        assert!(!stray.exists());
    }
}
