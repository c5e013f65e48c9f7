//! In-memory store for the accelerator and host tiers.
//!
//! Batches are immutable handles, so holding one is enough to keep its
//! buffers resident; writes and reads are zero-copy.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::trace;

use crate::batch::TabularBatch;
use crate::cache::entry::EntryId;
use crate::cache::tier::TierKind;
use crate::store::{StoreError, TierStore};

pub struct MemoryStore {
    kind: TierKind,
    slots: RwLock<HashMap<EntryId, TabularBatch>>,
}

impl MemoryStore {
    pub fn new(kind: TierKind) -> Self {
        Self {
            kind,
            slots: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl TierStore for MemoryStore {
    fn kind(&self) -> TierKind {
        self.kind
    }

    async fn write(&self, id: EntryId, batch: &TabularBatch) -> Result<(), StoreError> {
        trace!(entry_id = id, tier = %self.kind, bytes = batch.byte_size(), "Stored batch");
        self.slots.write().insert(id, batch.clone());
        Ok(())
    }

    async fn read(&self, id: EntryId) -> Result<TabularBatch, StoreError> {
        self.slots
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::Missing(id, self.kind))
    }

    async fn delete(&self, id: EntryId) -> Result<(), StoreError> {
        self.slots.write().remove(&id);
        Ok(())
    }

    fn len(&self) -> usize {
        self.slots.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Column;

    #[tokio::test]
    async fn test_write_read_is_zero_copy() {
        let store = MemoryStore::new(TierKind::Device);
        let batch = TabularBatch::try_new([("a", Column::from_values(&[1u8, 2, 3]))]).unwrap();

        store.write(7, &batch).await.unwrap();
        let read = store.read(7).await.unwrap();
        assert!(read.ptr_eq(&batch));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_then_read_fails() {
        let store = MemoryStore::new(TierKind::Host);
        store.write(1, &TabularBatch::empty()).await.unwrap();
        store.delete(1).await.unwrap();

        let err = store.read(1).await.unwrap_err();
        assert!(matches!(err, StoreError::Missing(1, TierKind::Host)));
        assert!(store.is_empty());
    }
}
