//! Disk spill store.
//!
//! Writes encoded batches under a per-instance directory using tokio's async
//! file I/O. The layout is an implementation detail and is removed when the
//! owning cache machine shuts down.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, warn};

use crate::batch::TabularBatch;
use crate::cache::entry::EntryId;
use crate::cache::tier::TierKind;
use crate::config::CompressionConfig;
use crate::store::codec::BatchCodec;
use crate::store::{StoreError, TierStore};

/// Disk store for spilled batches.
pub struct DiskStore {
    /// Directory owned by this store instance.
    root: PathBuf,

    codec: BatchCodec,

    /// Number of batch files currently on disk.
    files: AtomicUsize,

    /// Transfer statistics.
    stats: DiskIoStats,
}

#[derive(Debug, Default)]
pub struct DiskIoStats {
    pub total_writes: AtomicU64,
    pub total_reads: AtomicU64,
    pub total_bytes_written: AtomicU64,
    pub total_bytes_read: AtomicU64,
}

impl DiskStore {
    /// Create a store rooted at a fresh subdirectory of `base`.
    pub async fn new(base: &Path, compression: CompressionConfig) -> Result<Self, StoreError> {
        let root = base.join(uuid::Uuid::new_v4().to_string());
        fs::create_dir_all(&root).await?;

        debug!(root = %root.display(), "Created spill directory");

        Ok(Self {
            root,
            codec: BatchCodec::new(compression),
            files: AtomicUsize::new(0),
            stats: DiskIoStats::default(),
        })
    }

    /// File path for an entry: entry 12345 → `<root>/12/12345.batch`.
    fn entry_path(&self, id: EntryId) -> PathBuf {
        let shard = id / 1000;
        self.root
            .join(format!("{shard}"))
            .join(format!("{id}.batch"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stats(&self) -> &DiskIoStats {
        &self.stats
    }

    /// Remove the store's directory and everything in it.
    pub async fn remove_all(&self) -> Result<(), StoreError> {
        if fs::try_exists(&self.root).await? {
            fs::remove_dir_all(&self.root).await?;
        }
        self.files.store(0, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl TierStore for DiskStore {
    fn kind(&self) -> TierKind {
        TierKind::Disk
    }

    async fn write(&self, id: EntryId, batch: &TabularBatch) -> Result<(), StoreError> {
        let path = self.entry_path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let data = self.codec.encode(batch)?;
        fs::write(&path, &data).await?;

        debug!(
            entry_id = id,
            path = %path.display(),
            logical = batch.byte_size(),
            on_disk = data.len(),
            "Wrote batch to disk"
        );

        self.files.fetch_add(1, Ordering::Relaxed);
        self.stats.total_writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn read(&self, id: EntryId) -> Result<TabularBatch, StoreError> {
        let path = self.entry_path(id);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::FileNotFound(path));
            }
            Err(e) => return Err(e.into()),
        };

        let batch = self.codec.decode(&data)?;

        debug!(entry_id = id, path = %path.display(), size = data.len(), "Read batch from disk");

        self.stats.total_reads.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_bytes_read
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(batch)
    }

    async fn delete(&self, id: EntryId) -> Result<(), StoreError> {
        let path = self.entry_path(id);
        match fs::remove_file(&path).await {
            Ok(()) => {
                self.files.fetch_sub(1, Ordering::Relaxed);
                debug!(entry_id = id, path = %path.display(), "Deleted spill file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(entry_id = id, "Spill file already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn len(&self) -> usize {
        self.files.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Column;
    use tempfile::TempDir;

    fn batch() -> TabularBatch {
        TabularBatch::try_new([("v", Column::from_values(&vec![42u8; 4096]))]).unwrap()
    }

    #[tokio::test]
    async fn test_write_and_read_batch() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::new(tmp.path(), CompressionConfig::default())
            .await
            .unwrap();

        store.write(0, &batch()).await.unwrap();
        assert!(store.entry_path(0).exists());

        let read = store.read(0).await.unwrap();
        assert_eq!(read, batch());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_batch() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::new(tmp.path(), CompressionConfig::default())
            .await
            .unwrap();

        store.write(5, &batch()).await.unwrap();
        store.delete(5).await.unwrap();

        let result = store.read(5).await;
        assert!(matches!(result, Err(StoreError::FileNotFound(_))));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_remove_all_cleans_directory() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::new(tmp.path(), CompressionConfig::default())
            .await
            .unwrap();
        store.write(1, &batch()).await.unwrap();

        store.remove_all().await.unwrap();
        assert!(!store.root().exists());
    }
}
