//! Checkpoint persistence
//!
//! The metadata store holds the per-vBucket resume points between runs.
//! Writes happen in dirty batches from the checkpoint scheduler; loads happen
//! once per stream open.
//!
//! ## Usage
//!
//! ```ignore
//! use dcpstream::metadata::FileMetadataStore;
//!
//! let store = FileMetadataStore::new("/var/lib/dcpstream/offsets.json").await?;
//! let offsets = store.load(&vb_ids).await?;
//! ```

use crate::error::{DcpError, Result};
use crate::models::Offset;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Persistence contract for per-vBucket offsets.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Persist a batch of offsets. The batch contains only dirty entries;
    /// existing entries for other vBuckets must survive.
    async fn save(&self, offsets: HashMap<u16, Offset>) -> Result<()>;

    /// Load persisted offsets for the given vBuckets. Absent vBuckets are
    /// simply missing from the result.
    async fn load(&self, vb_ids: &[u16]) -> Result<HashMap<u16, Offset>>;

    /// Remove persisted offsets for the given vBuckets.
    async fn clear(&self, vb_ids: &[u16]) -> Result<()>;
}

/// In-memory store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    offsets: RwLock<HashMap<u16, Offset>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn save(&self, offsets: HashMap<u16, Offset>) -> Result<()> {
        let mut stored = self.offsets.write().await;
        stored.extend(offsets);
        Ok(())
    }

    async fn load(&self, vb_ids: &[u16]) -> Result<HashMap<u16, Offset>> {
        let stored = self.offsets.read().await;
        Ok(vb_ids
            .iter()
            .filter_map(|vb_id| stored.get(vb_id).map(|offset| (*vb_id, *offset)))
            .collect())
    }

    async fn clear(&self, vb_ids: &[u16]) -> Result<()> {
        let mut stored = self.offsets.write().await;
        for vb_id in vb_ids {
            stored.remove(vb_id);
        }
        Ok(())
    }
}

/// File-backed store: one JSON document holding all offsets, written
/// atomically (temp file, fsync, rename).
pub struct FileMetadataStore {
    path: PathBuf,
    /// Serializes read-merge-write cycles
    lock: RwLock<()>,
    fsync: bool,
}

impl FileMetadataStore {
    /// Create a store at the given path, creating parent directories.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(DcpError::Io)?;
        }
        Ok(Self {
            path,
            lock: RwLock::new(()),
            fsync: true,
        })
    }

    /// Disable fsync after writes (tests, ephemeral deployments).
    pub fn without_fsync(mut self) -> Self {
        self.fsync = false;
        self
    }

    async fn read_all(&self) -> Result<HashMap<u16, Offset>> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(DcpError::Io(e)),
        }
    }

    async fn write_all(&self, offsets: &HashMap<u16, Offset>) -> Result<()> {
        let json = serde_json::to_vec_pretty(offsets)?;
        let temp_path = self.path.with_extension("tmp");

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await
            .map_err(DcpError::Io)?;
        file.write_all(&json).await.map_err(DcpError::Io)?;
        if self.fsync {
            file.sync_all().await.map_err(DcpError::Io)?;
        }
        drop(file);

        fs::rename(&temp_path, &self.path)
            .await
            .map_err(DcpError::Io)?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for FileMetadataStore {
    async fn save(&self, offsets: HashMap<u16, Offset>) -> Result<()> {
        if offsets.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.write().await;

        let mut stored = self.read_all().await?;
        let written = offsets.len();
        stored.extend(offsets);
        self.write_all(&stored).await?;

        debug!(written, path = %self.path.display(), "saved offsets");
        Ok(())
    }

    async fn load(&self, vb_ids: &[u16]) -> Result<HashMap<u16, Offset>> {
        let _guard = self.lock.read().await;
        let stored = self.read_all().await?;
        let loaded: HashMap<u16, Offset> = vb_ids
            .iter()
            .filter_map(|vb_id| stored.get(vb_id).map(|offset| (*vb_id, *offset)))
            .collect();

        info!(
            requested = vb_ids.len(),
            loaded = loaded.len(),
            path = %self.path.display(),
            "loaded offsets"
        );
        Ok(loaded)
    }

    async fn clear(&self, vb_ids: &[u16]) -> Result<()> {
        let _guard = self.lock.write().await;
        let mut stored = self.read_all().await?;
        for vb_id in vb_ids {
            stored.remove(vb_id);
        }
        self.write_all(&stored).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SnapshotMarker;

    fn offset(seq_no: u64) -> Offset {
        Offset::new(0xABCD, seq_no, SnapshotMarker::new(0, seq_no))
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryMetadataStore::new();
        store
            .save(HashMap::from([(0, offset(10)), (1, offset(20))]))
            .await
            .unwrap();

        let loaded = store.load(&[0, 1, 2]).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[&0].seq_no, 10);
        assert_eq!(loaded[&1].seq_no, 20);

        store.clear(&[0]).await.unwrap();
        let loaded = store.load(&[0, 1]).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key(&1));
    }

    #[tokio::test]
    async fn test_file_store_roundtrip_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsets.json");

        let store = FileMetadataStore::new(&path).await.unwrap();
        store
            .save(HashMap::from([(3, offset(33)), (4, offset(44))]))
            .await
            .unwrap();

        // Simulates restart.
        let store2 = FileMetadataStore::new(&path).await.unwrap();
        let loaded = store2.load(&[3, 4]).await.unwrap();
        assert_eq!(loaded[&3].seq_no, 33);
        assert_eq!(loaded[&4].seq_no, 44);
        assert_eq!(loaded[&4].vb_uuid, 0xABCD);
    }

    #[tokio::test]
    async fn test_file_store_merges_batches() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMetadataStore::new(dir.path().join("offsets.json"))
            .await
            .unwrap()
            .without_fsync();

        store.save(HashMap::from([(0, offset(1))])).await.unwrap();
        store.save(HashMap::from([(1, offset(2))])).await.unwrap();

        // The second batch must not truncate the first.
        let loaded = store.load(&[0, 1]).await.unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[tokio::test]
    async fn test_file_store_clear_is_selective() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMetadataStore::new(dir.path().join("offsets.json"))
            .await
            .unwrap()
            .without_fsync();

        store
            .save(HashMap::from([(0, offset(1)), (1, offset(2)), (2, offset(3))]))
            .await
            .unwrap();
        store.clear(&[0, 2]).await.unwrap();

        let loaded = store.load(&[0, 1, 2]).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key(&1));
    }

    #[tokio::test]
    async fn test_file_store_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMetadataStore::new(dir.path().join("offsets.json"))
            .await
            .unwrap();
        assert!(store.load(&[0]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_save_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsets.json");
        let store = FileMetadataStore::new(&path).await.unwrap();
        store.save(HashMap::new()).await.unwrap();
        assert!(!path.exists());
    }
}
