//! Ingest pipeline: validation, blob write, index write
//!
//! `add_memory` is two-phase. The blob reference is taken first and the
//! record inserted second; a failure in between leaves an orphaned
//! reference that the sweep reclaims once its grace period has passed.

use crate::blob::BlobStore;
use crate::config::IngestConfig;
use crate::crypto::MasterKey;
use crate::error::{Error, Result};
use crate::index::{MemoryId, MemoryRecord, MetadataIndex};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use std::sync::Mutex;

/// Attempts at finding an unused id before giving up
const MAX_ID_ATTEMPTS: usize = 8;

/// Fallback media type
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Input to `add_memory`
#[derive(Debug, Clone, Default)]
pub struct NewMemory {
    pub title: String,
    pub tags: BTreeSet<String>,
    pub media: Vec<u8>,
    pub filename: String,
    /// Inferred from `filename` when empty
    pub media_type: String,
}

/// Validated, normalized ingest input
#[derive(Debug)]
pub(crate) struct ValidMemory {
    pub title: String,
    pub tags: BTreeSet<String>,
    pub media: Vec<u8>,
    pub filename: String,
    pub media_type: String,
}

impl NewMemory {
    pub(crate) fn validate(self, limits: &IngestConfig) -> Result<ValidMemory> {
        let title = validate_title(&self.title, limits)?;
        let tags = validate_tags(self.tags, limits)?;

        if self.media.is_empty() {
            return Err(Error::Validation("Media must not be empty".to_string()));
        }
        if self.media.len() > limits.max_media_bytes {
            return Err(Error::Validation(format!(
                "Media is {} bytes, maximum is {}",
                self.media.len(),
                limits.max_media_bytes
            )));
        }

        let filename = sanitize_filename(&self.filename);
        let media_type = match self.media_type.trim() {
            "" => infer_media_type(&filename).to_string(),
            given => validate_media_type(given)?,
        };

        Ok(ValidMemory {
            title,
            tags,
            media: self.media,
            filename,
            media_type,
        })
    }
}

/// Trimmed, non-empty title within the byte limit
pub(crate) fn validate_title(title: &str, limits: &IngestConfig) -> Result<String> {
    let title = title.trim();
    if title.is_empty() {
        return Err(Error::Validation("Title must not be empty".to_string()));
    }
    if title.len() > limits.max_title_bytes {
        return Err(Error::Validation(format!(
            "Title is {} bytes, maximum is {}",
            title.len(),
            limits.max_title_bytes
        )));
    }
    Ok(title.to_string())
}

/// Trimmed transcription within the byte limit; blank text clears it
pub(crate) fn validate_transcription(text: &str, limits: &IngestConfig) -> Result<String> {
    let text = text.trim();
    if text.len() > limits.max_transcription_bytes {
        return Err(Error::Validation(format!(
            "Transcription is {} bytes, maximum is {}",
            text.len(),
            limits.max_transcription_bytes
        )));
    }
    Ok(text.to_string())
}

/// Trimmed, non-empty tags within the count and length limits
pub(crate) fn validate_tags<I>(tags: I, limits: &IngestConfig) -> Result<BTreeSet<String>>
where
    I: IntoIterator<Item = String>,
{
    let mut clean = BTreeSet::new();
    for tag in tags {
        let tag = tag.trim();
        if tag.is_empty() {
            continue;
        }
        if tag.len() > limits.max_tag_bytes {
            return Err(Error::Validation(format!(
                "Tag '{}' exceeds {} bytes",
                tag, limits.max_tag_bytes
            )));
        }
        clean.insert(tag.to_string());
    }

    if clean.len() > limits.max_tags {
        return Err(Error::Validation(format!(
            "{} tags given, maximum is {}",
            clean.len(),
            limits.max_tags
        )));
    }
    Ok(clean)
}

fn validate_media_type(media_type: &str) -> Result<String> {
    let valid = media_type.len() <= 127
        && media_type.split_once('/').is_some_and(|(kind, sub)| {
            !kind.is_empty() && !sub.is_empty() && !media_type.chars().any(|c| c.is_whitespace() || c.is_control())
        });
    if !valid {
        return Err(Error::Validation(format!("Invalid media type: {}", media_type)));
    }
    Ok(media_type.to_ascii_lowercase())
}

/// Split a comma-separated tag string: `"a, b,,c"` gives `{a, b, c}`
pub fn parse_tags(input: &str) -> BTreeSet<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Base name of a user-supplied file name, with path components and
/// control characters removed
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>();
    let base = base.trim();

    if base.is_empty() || base == "." || base == ".." {
        "untitled".to_string()
    } else {
        base.to_string()
    }
}

/// Media type from a file name's extension
pub fn infer_media_type(filename: &str) -> &'static str {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "m4a" => "audio/mp4",
        "txt" => "text/plain",
        "pdf" => "application/pdf",
        _ => OCTET_STREAM,
    }
}

/// Orchestrates `add_memory` over the blob store and index
pub(crate) struct IngestPipeline<'a> {
    pub blobs: &'a BlobStore,
    pub index: &'a MetadataIndex,
    pub limits: &'a IngestConfig,
    /// Vault-wide writer lock
    pub writer: &'a Mutex<()>,
}

impl IngestPipeline<'_> {
    pub fn add(&self, master: &MasterKey, input: NewMemory) -> Result<MemoryRecord> {
        let input = input.validate(self.limits)?;

        // Encryption and blob write happen outside the writer lock
        let stored = self.blobs.put(master, &input.media)?;

        let result = {
            let _writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
            let created_at = next_timestamp(self.index.latest_created_at());
            self.insert_with_fresh_id(MemoryRecord {
                id: MemoryId::generate(),
                title: input.title,
                tags: input.tags,
                created_at,
                media_type: input.media_type,
                filename: input.filename,
                content_hash: stored.hash.clone(),
                wrapped_data_key: stored.wrapped_key,
                size_bytes: input.media.len() as u64,
                version: 1,
                transcription: None,
                conflicts: Vec::new(),
                transcription_conflicts: Vec::new(),
            })
        };

        match result {
            Ok(record) => {
                tracing::info!(
                    id = %record.id,
                    hash = %record.content_hash.short(),
                    deduplicated = stored.deduplicated,
                    "Memory added"
                );
                Ok(record)
            }
            Err(e) => {
                // Best effort; the sweep reclaims the reference if this fails too
                if let Err(release_err) = self.blobs.release(&stored.hash) {
                    tracing::warn!(
                        hash = %stored.hash.short(),
                        "Failed to release blob after index insert failure: {}",
                        release_err
                    );
                }
                Err(e)
            }
        }
    }

    fn insert_with_fresh_id(&self, mut record: MemoryRecord) -> Result<MemoryRecord> {
        for _ in 0..MAX_ID_ATTEMPTS {
            match self.index.insert(record.clone()) {
                Ok(inserted) => return Ok((*inserted).clone()),
                Err(Error::Conflict(_)) => {
                    tracing::warn!(id = %record.id, "Generated id already in use, retrying");
                    record.id = MemoryId::generate();
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::Internal("Could not allocate a unique memory id".to_string()))
    }
}

/// Wall-clock time, nudged past the newest record so `created_at` stays
/// strictly increasing within the vault
fn next_timestamp(latest: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match latest {
        Some(latest) if latest >= now => latest + Duration::nanoseconds(1),
        _ => now,
    }
}
