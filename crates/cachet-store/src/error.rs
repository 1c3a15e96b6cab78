//! Storage error types.

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Underlying storage engine error (lock contention, corruption, I/O).
    ///
    /// Repairable: the durable store reacts to this class by closing the
    /// handle, reopening (which discards any unrecoverable write-ahead
    /// artifacts), and retrying the operation exactly once.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Sealing or opening a value failed.
    ///
    /// An open failure on read means the value was tampered with or sealed
    /// under a different key; it is not repairable by reopening.
    #[error("value encryption error: {0}")]
    Crypto(String),

    /// The key-custody service could not supply the at-rest key.
    #[error("key custody error: {0}")]
    Custody(String),

    /// The repair-and-retry path was exhausted for this operation.
    ///
    /// Terminal for the operation; callers must not retry indefinitely.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Whether the automatic repair path applies to this error.
    pub fn is_repairable(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}
