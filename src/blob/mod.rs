//! Media blob store
//!
//! Content-addressed, deduplicating storage of encrypted media with a
//! reference-counted ledger.

mod hash;
mod store;

pub use hash::ContentHash;
pub use store::{BlobEntry, BlobStore, PutOutcome, ReconcileStats, VerifiedBlob};
