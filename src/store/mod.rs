//! Physical storage behind each cache tier.
//!
//! - [`memory`]: accelerator and host memory stores (zero-copy handle retention)
//! - [`disk`]: spill store writing encoded batches to local disk
//! - [`codec`]: on-disk batch encoding with optional zstd compression
//!
//! Stores only hold bytes. Capacity accounting lives in the cache machine's
//! tier ledgers and is never consulted here.

pub mod codec;
pub mod disk;
pub mod memory;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

use crate::batch::TabularBatch;
use crate::cache::entry::EntryId;
use crate::cache::tier::TierKind;
use crate::store::codec::CodecError;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Entry {0} not present in {1} store")]
    Missing(EntryId, TierKind),

    #[error("Spill file not found: {0}")]
    FileNotFound(PathBuf),
}

/// One storage medium able to hold batches keyed by entry ID.
#[async_trait]
pub trait TierStore: Send + Sync {
    /// The medium this store represents.
    fn kind(&self) -> TierKind;

    /// Copy or move a batch into this store.
    async fn write(&self, id: EntryId, batch: &TabularBatch) -> Result<(), StoreError>;

    /// Materialize a batch previously written under `id`.
    async fn read(&self, id: EntryId) -> Result<TabularBatch, StoreError>;

    /// Release the storage held for `id`. Deleting an absent ID is a no-op.
    async fn delete(&self, id: EntryId) -> Result<(), StoreError>;

    /// Number of batches currently held.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
