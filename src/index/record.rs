//! Memory record types

use crate::blob::ContentHash;
use crate::crypto::WrappedKey;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique, immutable identifier of a memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryId(Uuid);

impl MemoryId {
    /// Generate a random 128-bit id
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for MemoryId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| Error::Validation(format!("Invalid memory id: {}", s)))
    }
}

impl From<Uuid> for MemoryId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// A losing title kept after a concurrent edit from another device
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TitleConflict {
    pub title: String,
    pub version: u64,
}

/// A losing transcription kept after a concurrent edit from another device
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionConflict {
    pub transcription: Option<String>,
    pub version: u64,
}

/// A memory as stored in the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRecord {
    pub id: MemoryId,
    pub title: String,
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub media_type: String,
    pub filename: String,
    pub content_hash: ContentHash,
    pub wrapped_data_key: WrappedKey,
    pub size_bytes: u64,
    /// Logical clock, bumped on every metadata mutation
    pub version: u64,
    /// Text of an audio memory, entered or imported by the owner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcription: Option<String>,
    /// Unresolved title conflicts from sync
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<TitleConflict>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transcription_conflicts: Vec<TranscriptionConflict>,
}

impl MemoryRecord {
    pub fn summary(&self) -> MemorySummary {
        MemorySummary {
            id: self.id,
            title: self.title.clone(),
            created_at: self.created_at,
            tags: self.tags.clone(),
        }
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty() || !self.transcription_conflicts.is_empty()
    }
}

/// Listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySummary {
    pub id: MemoryId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub tags: BTreeSet<String>,
}

/// Metadata edit. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryPatch {
    pub title: Option<String>,
    pub tags: Option<BTreeSet<String>>,
    /// Replace the transcription; an empty string removes it
    pub transcription: Option<String>,
    /// Drop recorded conflicts (the user has resolved them)
    pub clear_conflicts: bool,
}

impl MemoryPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.tags.is_none()
            && self.transcription.is_none()
            && !self.clear_conflicts
    }

    pub(crate) fn apply(self, record: &mut MemoryRecord) {
        if let Some(title) = self.title {
            record.title = title;
        }
        if let Some(tags) = self.tags {
            record.tags = tags;
        }
        if let Some(text) = self.transcription {
            record.transcription = (!text.is_empty()).then_some(text);
        }
        if self.clear_conflicts {
            record.conflicts.clear();
            record.transcription_conflicts.clear();
        }
    }
}

/// Tag filter for listings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Keep records whose tags intersect this set; empty keeps everything
    pub any_of_tags: BTreeSet<String>,
}

impl ListFilter {
    pub fn tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            any_of_tags: tags.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, record: &MemoryRecord) -> bool {
        self.any_of_tags.is_empty() || !self.any_of_tags.is_disjoint(&record.tags)
    }
}
