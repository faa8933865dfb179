//! Metadata merge rules
//!
//! Blobs are never merged: a record whose content hash differs between
//! devices has diverged and is reported, not reconciled. Metadata merges on
//! the per-record logical clock (`version`), never on wall-clock time.

use crate::index::{MemoryRecord, TitleConflict, TranscriptionConflict};

/// How the remote copy relates to the local one since the last sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// Only the remote side changed; take its metadata as is
    RemoteAhead,
    /// Both sides may have changed
    Concurrent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// Local record already reflects the remote state
    Unchanged,
    /// New local record to store
    Merged(MemoryRecord),
    /// Immutable fields differ; nothing can be merged
    Diverged,
}

/// Merge `remote` into `local`.
///
/// Concurrent edits union the tag sets and let the higher `(version, title)`
/// win the title; the losing title is kept as a conflict note. The
/// transcription is resolved the same way on `(version, transcription)`. The result
/// keeps the local wrapped data key, which is the one that opens the local
/// blob.
pub fn merge_records(local: &MemoryRecord, remote: &MemoryRecord, relation: Relation) -> MergeOutcome {
    if local.id != remote.id
        || local.content_hash != remote.content_hash
        || local.created_at != remote.created_at
    {
        return MergeOutcome::Diverged;
    }

    let mut merged = local.clone();
    match relation {
        Relation::RemoteAhead => {
            merged.title = remote.title.clone();
            merged.tags = remote.tags.clone();
            merged.transcription = remote.transcription.clone();
            merged.conflicts = remote.conflicts.clone();
            merged.transcription_conflicts = remote.transcription_conflicts.clone();
        }
        Relation::Concurrent => {
            merged.tags = local.tags.union(&remote.tags).cloned().collect();

            let (winner, loser) = if (remote.version, &remote.title) > (local.version, &local.title) {
                (remote, local)
            } else {
                (local, remote)
            };
            merged.title = winner.title.clone();

            let mut notes: Vec<TitleConflict> = local
                .conflicts
                .iter()
                .chain(remote.conflicts.iter())
                .cloned()
                .collect();
            if loser.title != winner.title {
                notes.push(TitleConflict {
                    title: loser.title.clone(),
                    version: loser.version,
                });
            }
            notes.retain(|note| note.title != merged.title);
            notes.sort();
            notes.dedup();
            merged.conflicts = notes;

            let (winner, loser) = if (remote.version, &remote.transcription)
                > (local.version, &local.transcription)
            {
                (remote, local)
            } else {
                (local, remote)
            };
            merged.transcription = winner.transcription.clone();

            let mut notes: Vec<TranscriptionConflict> = local
                .transcription_conflicts
                .iter()
                .chain(remote.transcription_conflicts.iter())
                .cloned()
                .collect();
            if loser.transcription != winner.transcription {
                notes.push(TranscriptionConflict {
                    transcription: loser.transcription.clone(),
                    version: loser.version,
                });
            }
            notes.retain(|note| note.transcription != merged.transcription);
            notes.sort();
            notes.dedup();
            merged.transcription_conflicts = notes;
        }
    }

    if same_metadata(&merged, local) {
        return MergeOutcome::Unchanged;
    }

    merged.version = if same_metadata(&merged, remote) && remote.version > local.version {
        remote.version
    } else {
        local.version.max(remote.version) + 1
    };
    MergeOutcome::Merged(merged)
}

fn same_metadata(a: &MemoryRecord, b: &MemoryRecord) -> bool {
    a.title == b.title
        && a.tags == b.tags
        && a.transcription == b.transcription
        && a.conflicts == b.conflicts
        && a.transcription_conflicts == b.transcription_conflicts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::ContentHash;
    use crate::crypto::WrappedKey;
    use crate::index::MemoryId;
    use chrono::Utc;

    fn base() -> MemoryRecord {
        MemoryRecord {
            id: MemoryId::generate(),
            title: "Trip".to_string(),
            tags: Default::default(),
            created_at: Utc::now(),
            media_type: "image/png".to_string(),
            filename: "trip.png".to_string(),
            content_hash: ContentHash::of(b"trip"),
            wrapped_data_key: WrappedKey::from_bytes(vec![1; 60]),
            size_bytes: 4,
            version: 1,
            transcription: None,
            conflicts: Vec::new(),
            transcription_conflicts: Vec::new(),
        }
    }

    fn edited(record: &MemoryRecord, f: impl FnOnce(&mut MemoryRecord)) -> MemoryRecord {
        let mut next = record.clone();
        f(&mut next);
        next.version += 1;
        next
    }

    fn unwrap_merged(outcome: MergeOutcome) -> MemoryRecord {
        match outcome {
            MergeOutcome::Merged(record) => record,
            other => panic!("expected merge, got {:?}", other),
        }
    }

    #[test]
    fn test_concurrent_tags_union() {
        let r = base();
        let a = edited(&r, |r| {
            r.tags.insert("x".into());
        });
        let b = edited(&r, |r| {
            r.tags.insert("y".into());
        });

        let on_a = unwrap_merged(merge_records(&a, &b, Relation::Concurrent));
        let on_b = unwrap_merged(merge_records(&b, &a, Relation::Concurrent));

        assert_eq!(on_a.tags, on_b.tags);
        assert!(on_a.tags.contains("x") && on_a.tags.contains("y"));
        assert_eq!(on_a.version, 3);
        assert_eq!(on_b.version, 3);
    }

    #[test]
    fn test_title_conflict_keeps_loser() {
        let r = base();
        let a = edited(&r, |r| r.title = "Beach".into());
        let b = edited(&edited(&r, |r| r.title = "Lake".into()), |_| {});

        let merged = unwrap_merged(merge_records(&a, &b, Relation::Concurrent));
        assert_eq!(merged.title, "Lake");
        assert_eq!(
            merged.conflicts,
            vec![TitleConflict {
                title: "Beach".into(),
                version: 2
            }]
        );

        // The other side computes the same result
        let mirrored = unwrap_merged(merge_records(&b, &a, Relation::Concurrent));
        assert_eq!(mirrored.title, merged.title);
        assert_eq!(mirrored.conflicts, merged.conflicts);
    }

    #[test]
    fn test_transcription_conflict_keeps_loser() {
        let r = base();
        let a = edited(&r, |r| r.transcription = Some("we went swimming".into()));
        let b = edited(&edited(&r, |r| r.transcription = Some("we went sailing".into())), |_| {});

        let merged = unwrap_merged(merge_records(&a, &b, Relation::Concurrent));
        assert_eq!(merged.transcription.as_deref(), Some("we went sailing"));
        assert_eq!(
            merged.transcription_conflicts,
            vec![TranscriptionConflict {
                transcription: Some("we went swimming".into()),
                version: 2
            }]
        );
        assert!(merged.conflicts.is_empty());
        assert_eq!(merged.version, 4);

        let mirrored = unwrap_merged(merge_records(&b, &a, Relation::Concurrent));
        assert_eq!(mirrored.transcription, merged.transcription);
        assert_eq!(mirrored.transcription_conflicts, merged.transcription_conflicts);
    }

    #[test]
    fn test_transcription_added_on_one_side() {
        let r = base();
        let local = edited(&r, |r| r.title = "Zoo".into());
        let remote = edited(&r, |r| r.transcription = Some("hello".into()));

        let merged = unwrap_merged(merge_records(&local, &remote, Relation::Concurrent));
        assert_eq!(merged.title, "Zoo");
        assert_eq!(merged.transcription.as_deref(), Some("hello"));
        // A missing transcription loses to a present one and is noted
        assert_eq!(
            merged.transcription_conflicts,
            vec![TranscriptionConflict {
                transcription: None,
                version: 2
            }]
        );

        let fast_forward = unwrap_merged(merge_records(&r, &remote, Relation::RemoteAhead));
        assert_eq!(fast_forward.transcription.as_deref(), Some("hello"));
        assert_eq!(fast_forward.version, remote.version);
    }

    #[test]
    fn test_equal_versions_tie_break_on_title() {
        let r = base();
        let a = edited(&r, |r| r.title = "Alpha".into());
        let b = edited(&r, |r| r.title = "Beta".into());

        let on_a = unwrap_merged(merge_records(&a, &b, Relation::Concurrent));
        let on_b = unwrap_merged(merge_records(&b, &a, Relation::Concurrent));
        assert_eq!(on_a.title, "Beta");
        assert_eq!(on_b.title, "Beta");
        assert_eq!(on_a.conflicts, on_b.conflicts);
    }

    #[test]
    fn test_remote_ahead_fast_forwards() {
        let local = base();
        let remote = edited(&local, |r| {
            r.title = "Renamed".into();
            r.tags.insert("new".into());
        });

        let merged = unwrap_merged(merge_records(&local, &remote, Relation::RemoteAhead));
        assert_eq!(merged.title, "Renamed");
        assert_eq!(merged.version, remote.version);
        assert!(merged.conflicts.is_empty());
    }

    #[test]
    fn test_remote_ahead_can_remove_tags() {
        let mut local = base();
        local.tags.insert("old".into());
        let remote = edited(&local, |r| {
            r.tags.clear();
        });

        let merged = unwrap_merged(merge_records(&local, &remote, Relation::RemoteAhead));
        assert!(merged.tags.is_empty());
    }

    #[test]
    fn test_subsumed_remote_is_unchanged() {
        let r = base();
        let local = edited(&r, |r| {
            r.tags.insert("x".into());
        });
        assert_eq!(merge_records(&local, &r, Relation::Concurrent), MergeOutcome::Unchanged);
        assert_eq!(merge_records(&local, &local.clone(), Relation::Concurrent), MergeOutcome::Unchanged);
    }

    #[test]
    fn test_different_content_diverges() {
        let local = base();
        let mut remote = local.clone();
        remote.content_hash = ContentHash::of(b"other");
        assert_eq!(merge_records(&local, &remote, Relation::Concurrent), MergeOutcome::Diverged);
    }

    #[test]
    fn test_local_wrapped_key_kept() {
        let local = base();
        let mut remote = edited(&local, |r| r.title = "T".into());
        remote.wrapped_data_key = WrappedKey::from_bytes(vec![2; 60]);

        let merged = unwrap_merged(merge_records(&local, &remote, Relation::RemoteAhead));
        assert_eq!(merged.wrapped_data_key, local.wrapped_data_key);
    }
}
