//! Two-layer block storage: a writable overlay on top of a read-only base
//!
//! Write transactions and firehose validation both need to build new MST
//! nodes against an existing tree without touching the store that holds it.
//! Overlaying a scratch store avoids copying the previous tree.

use crate::error::Result;
use crate::repo::CommitData;
use crate::storage::BlockStore;
use bytes::Bytes;
use skein_common::Cid;
use std::sync::Arc;

/// Layered block storage with a writable overlay and read-only base
///
/// Reads check the writable layer first, then fall back to the base layer.
/// All writes go to the writable layer only.
///
/// ```rust,ignore
/// use skein_repo::storage::{LayeredBlockStore, MemoryBlockStore};
/// use std::sync::Arc;
///
/// let base = Arc::new(MemoryBlockStore::new()); // existing repo storage
/// let staged = LayeredBlockStore::new(MemoryBlockStore::new(), base);
/// ```
#[derive(Clone)]
pub struct LayeredBlockStore<W: BlockStore, B: BlockStore> {
    writable: W,
    base: Arc<B>,
}

impl<W: BlockStore, B: BlockStore> LayeredBlockStore<W, B> {
    /// Create a new layered storage
    pub fn new(writable: W, base: Arc<B>) -> Self {
        Self { writable, base }
    }

    /// Get reference to the writable layer
    pub fn writable(&self) -> &W {
        &self.writable
    }

    /// Get reference to the base layer
    pub fn base(&self) -> &Arc<B> {
        &self.base
    }
}

impl<W: BlockStore + Sync + 'static, B: BlockStore + Sync + Send + 'static> BlockStore
    for LayeredBlockStore<W, B>
{
    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>> {
        if let Some(data) = self.writable.get(cid).await? {
            return Ok(Some(data));
        }
        self.base.get(cid).await
    }

    async fn put(&self, data: &[u8]) -> Result<Cid> {
        self.writable.put(data).await
    }

    async fn has(&self, cid: &Cid) -> Result<bool> {
        if self.writable.has(cid).await? {
            return Ok(true);
        }
        self.base.has(cid).await
    }

    async fn put_many(&self, blocks: impl IntoIterator<Item = (Cid, Bytes)> + Send) -> Result<()> {
        self.writable.put_many(blocks).await
    }

    async fn get_many(&self, cids: &[Cid]) -> Result<Vec<Option<Bytes>>> {
        let mut results = Vec::with_capacity(cids.len());
        for cid in cids {
            results.push(self.get(cid).await?);
        }
        Ok(results)
    }

    async fn apply_commit(&self, commit: CommitData) -> Result<()> {
        // base is read-only
        self.writable.apply_commit(commit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBlockStore;

    #[tokio::test]
    async fn reads_fall_through_to_base() {
        let base = Arc::new(MemoryBlockStore::new());
        let base_cid = base.put(&[0x01]).await.unwrap();

        let layered = LayeredBlockStore::new(MemoryBlockStore::new(), base.clone());
        assert_eq!(layered.get(&base_cid).await.unwrap().as_deref(), Some(&[0x01][..]));
        assert!(layered.has(&base_cid).await.unwrap());
    }

    #[tokio::test]
    async fn writes_stay_in_overlay() {
        let base = Arc::new(MemoryBlockStore::new());
        let layered = LayeredBlockStore::new(MemoryBlockStore::new(), base.clone());

        let cid = layered.put(&[0x02]).await.unwrap();
        assert!(layered.has(&cid).await.unwrap());
        assert!(layered.writable().has(&cid).await.unwrap());
        assert!(!base.has(&cid).await.unwrap());
        assert!(base.is_empty());
    }

    #[tokio::test]
    async fn get_many_mixes_layers() {
        let base = Arc::new(MemoryBlockStore::new());
        let a = base.put(&[0x01]).await.unwrap();
        let layered = LayeredBlockStore::new(MemoryBlockStore::new(), base);
        let b = layered.put(&[0x02]).await.unwrap();
        let missing = Cid::for_raw_bytes(b"x");

        let got = layered.get_many(&[a, missing, b]).await.unwrap();
        assert!(got[0].is_some());
        assert!(got[1].is_none());
        assert!(got[2].is_some());
    }
}
