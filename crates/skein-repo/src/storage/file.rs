//! CAR file-backed block storage

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use skein_common::Cid;
use tokio::io::BufReader;

use crate::car::{self, CarLimits};
use crate::error::{RepoError, Result};
use crate::repo::CommitData;
use crate::storage::BlockStore;

/// CAR file-backed block storage
///
/// Loads the whole file into memory and writes it back on [`flush`](Self::flush).
#[derive(Debug, Clone)]
pub struct FileBlockStore {
    path: PathBuf,
    blocks: Arc<RwLock<BTreeMap<Cid, Bytes>>>,
    roots: Arc<RwLock<Vec<Cid>>>,
    dirty: Arc<RwLock<bool>>,
}

impl FileBlockStore {
    /// Load from an existing CAR file
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        Self::load_with_limits(path, &CarLimits::default()).await
    }

    /// Load from an existing CAR file with explicit size limits
    pub async fn load_with_limits(path: impl Into<PathBuf>, limits: &CarLimits) -> Result<Self> {
        let path = path.into();
        let file = tokio::fs::File::open(&path).await.map_err(RepoError::io)?;

        let mut roots = Vec::new();
        let mut blocks = BTreeMap::new();
        car::walk_repo_async(
            BufReader::new(file),
            limits,
            |header| {
                roots = header.roots.clone();
                true
            },
            |cid, data| {
                blocks.insert(cid, data);
                true
            },
        )
        .await?;

        tracing::debug!(path = %path.display(), blocks = blocks.len(), "loaded CAR store");
        Ok(Self {
            path,
            blocks: Arc::new(RwLock::new(blocks)),
            roots: Arc::new(RwLock::new(roots)),
            dirty: Arc::new(RwLock::new(false)),
        })
    }

    /// Create new empty storage that writes to `path` on flush
    ///
    /// The file is not created until the first flush.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            blocks: Arc::new(RwLock::new(BTreeMap::new())),
            roots: Arc::new(RwLock::new(Vec::new())),
            dirty: Arc::new(RwLock::new(false)),
        }
    }

    /// CAR roots; for a repository this is the commit CID
    pub fn roots(&self) -> Vec<Cid> {
        self.roots.read().unwrap().clone()
    }

    /// Set the CAR roots. Marks the store dirty.
    pub fn set_roots(&self, new_roots: Vec<Cid>) {
        *self.roots.write().unwrap() = new_roots;
        *self.dirty.write().unwrap() = true;
    }

    /// Write everything back to the file if anything changed since the last flush
    pub async fn flush(&self) -> Result<()> {
        if !self.is_dirty() {
            return Ok(());
        }

        let blocks = self.blocks.read().unwrap().clone();
        let roots = self.roots();
        car::write_car(&self.path, &roots, blocks).await?;

        *self.dirty.write().unwrap() = false;
        Ok(())
    }

    /// Check if store has unflushed changes
    pub fn is_dirty(&self) -> bool {
        *self.dirty.read().unwrap()
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockStore for FileBlockStore {
    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>> {
        Ok(self.blocks.read().unwrap().get(cid).cloned())
    }

    async fn put(&self, data: &[u8]) -> Result<Cid> {
        let cid = Cid::for_dag_cbor_bytes(data);
        self.blocks
            .write()
            .unwrap()
            .insert(cid, Bytes::copy_from_slice(data));
        *self.dirty.write().unwrap() = true;
        Ok(cid)
    }

    async fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(self.blocks.read().unwrap().contains_key(cid))
    }

    async fn put_many(&self, blocks: impl IntoIterator<Item = (Cid, Bytes)> + Send) -> Result<()> {
        self.blocks.write().unwrap().extend(blocks);
        *self.dirty.write().unwrap() = true;
        Ok(())
    }

    async fn get_many(&self, cids: &[Cid]) -> Result<Vec<Option<Bytes>>> {
        let store = self.blocks.read().unwrap();
        Ok(cids.iter().map(|cid| store.get(cid).cloned()).collect())
    }

    async fn apply_commit(&self, commit: CommitData) -> Result<()> {
        {
            let mut store = self.blocks.write().unwrap();
            store.extend(commit.blocks);
            for cid in &commit.deleted_cids {
                store.remove(cid);
            }
        }
        *self.roots.write().unwrap() = vec![commit.cid];
        *self.dirty.write().unwrap() = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn new_store_is_clean() {
        let temp_file = NamedTempFile::new().unwrap();
        let storage = FileBlockStore::new(temp_file.path());

        assert!(storage.roots().is_empty());
        assert!(!storage.is_dirty());
        assert_eq!(storage.path(), temp_file.path());
    }

    #[tokio::test]
    async fn put_marks_dirty() {
        let temp_file = NamedTempFile::new().unwrap();
        let storage = FileBlockStore::new(temp_file.path());

        let cid = storage.put(&[0x61, b'x']).await.unwrap();
        assert!(storage.is_dirty());
        assert_eq!(
            storage.get(&cid).await.unwrap().as_deref(),
            Some(&[0x61, b'x'][..])
        );
    }

    #[tokio::test]
    async fn flush_then_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let storage = FileBlockStore::new(temp_file.path());

        let a = storage.put(&[0x01]).await.unwrap();
        let b = storage.put(&[0x02]).await.unwrap();
        storage.set_roots(vec![a]);
        storage.flush().await.unwrap();
        assert!(!storage.is_dirty());

        let loaded = FileBlockStore::load(temp_file.path()).await.unwrap();
        assert_eq!(loaded.roots(), vec![a]);
        assert!(loaded.has(&a).await.unwrap());
        assert!(loaded.has(&b).await.unwrap());
        assert!(!loaded.is_dirty());
    }

    #[tokio::test]
    async fn flush_skipped_when_clean() {
        let temp_file = NamedTempFile::new().unwrap();
        let storage = FileBlockStore::new(temp_file.path());
        storage.flush().await.unwrap();
        // nothing written, the temp file is still empty
        let len = tokio::fs::metadata(temp_file.path()).await.unwrap().len();
        assert_eq!(len, 0);
    }
}
