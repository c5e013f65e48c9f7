//! Error taxonomy for cache machine operations.

use thiserror::Error;

use crate::batch::BatchError;
use crate::store::StoreError;

/// Result type alias for cache machine operations.
pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Error, Debug)]
pub enum CacheError {
    /// No tier, including the slowest, can hold the batch after spilling.
    #[error("Capacity exhausted: no tier can hold {bytes} bytes")]
    CapacityExhausted { bytes: u64 },

    /// The channel's duplicate policy rejected the identifier.
    #[error("Duplicate identifier '{identifier}' on channel '{channel}'")]
    DuplicateIdentifier { channel: String, identifier: String },

    /// Push after the channel was marked finished.
    #[error("Channel '{0}' is closed")]
    ChannelClosed(String),

    /// Identifier pull on a channel that will never produce it.
    #[error("Identifier '{identifier}' not found on channel '{channel}'")]
    NotFound { channel: String, identifier: String },

    /// Internal invariant violation. The instance must not be used afterwards.
    #[error("Corrupt cache entry: {0}")]
    CorruptEntry(String),

    /// A blocking wait was abandoned through its cancellation token.
    #[error("Operation on channel '{0}' cancelled")]
    Cancelled(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Invalid batch: {0}")]
    Batch(#[from] BatchError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl CacheError {
    /// Whether this error means the cache machine is no longer usable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CacheError::CorruptEntry(_))
    }
}
