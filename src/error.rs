//! memvault error types

use thiserror::Error;

/// memvault error type
#[derive(Error, Debug)]
pub enum Error {
    /// Bad input shape or size
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown id, hash or file
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate id
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Stale metadata edit
    #[error("Version mismatch: expected {expected}, found {actual}")]
    VersionMismatch { expected: u64, actual: u64 },

    /// Hash or authentication-tag mismatch on read
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// Key derivation or unwrap failure (e.g. wrong passphrase)
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Disk full or configured quota exceeded
    #[error("Storage exhausted: {0}")]
    StorageExhausted(String),

    /// Release of a blob reference that was never taken
    #[error("Refcount underflow for blob {0}")]
    RefcountUnderflow(String),

    /// Two distinct plaintexts produced the same content hash
    #[error("Hash collision detected for blob {0}")]
    HashCollision(String),

    /// A network call exceeded its deadline
    #[error("Sync timeout: {0}")]
    SyncTimeout(String),

    /// Divergent state that sync could not reconcile automatically
    #[error("Sync conflict: {0}")]
    SyncConflict(String),

    /// Sync network failure other than a timeout
    #[error("Sync network error: {0}")]
    Network(String),

    /// A sync cycle was stopped before it committed
    #[error("Sync cancelled")]
    Cancelled,

    /// Operation on a vault handle that has been closed
    #[error("Vault is locked")]
    VaultLocked,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error signals a logic or storage-medium fault that must
    /// never be corrected silently.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, Error::RefcountUnderflow(_) | Error::HashCollision(_))
    }

    /// Whether a sync cycle may be retried after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::SyncTimeout(_) | Error::Network(_) | Error::Io(_))
    }

    /// Short machine-readable code, used by the HTTP boundary.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Conflict(_) => "CONFLICT",
            Error::VersionMismatch { .. } => "VERSION_MISMATCH",
            Error::Corruption(_) => "CORRUPTION",
            Error::Crypto(_) => "CRYPTO_ERROR",
            Error::StorageExhausted(_) => "STORAGE_EXHAUSTED",
            Error::RefcountUnderflow(_) => "REFCOUNT_UNDERFLOW",
            Error::HashCollision(_) => "HASH_COLLISION",
            Error::SyncTimeout(_) => "SYNC_TIMEOUT",
            Error::SyncConflict(_) => "SYNC_CONFLICT",
            Error::Network(_) => "NETWORK_ERROR",
            Error::Cancelled => "CANCELLED",
            Error::VaultLocked => "VAULT_LOCKED",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if is_storage_full(&err) {
            Error::StorageExhausted(err.to_string())
        } else {
            Error::Io(err)
        }
    }
}

/// ENOSPC on unix, ERROR_DISK_FULL / ERROR_HANDLE_DISK_FULL on windows
fn is_storage_full(err: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(28)
    }
    #[cfg(windows)]
    {
        matches!(err.raw_os_error(), Some(39) | Some(112))
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = err;
        false
    }
}

/// Result type alias for memvault operations
pub type Result<T> = std::result::Result<T, Error>;
