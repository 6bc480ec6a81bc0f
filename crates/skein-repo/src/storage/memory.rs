//! In-memory block storage

use crate::error::Result;
use crate::repo::CommitData;
use crate::storage::BlockStore;
use bytes::Bytes;
use skein_common::Cid;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// In-memory block storage over a shared `BTreeMap`
///
/// Clones share the same map. Used for tests, for staging writes in a
/// [`LayeredBlockStore`](super::LayeredBlockStore), and for small
/// repositories that fit in memory.
#[derive(Debug, Clone)]
pub struct MemoryBlockStore {
    blocks: Arc<RwLock<BTreeMap<Cid, Bytes>>>,
}

impl MemoryBlockStore {
    /// Create new empty memory store
    pub fn new() -> Self {
        Self {
            blocks: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Create new memory store from a map of blocks
    pub fn new_from_blocks(blocks: BTreeMap<Cid, Bytes>) -> Self {
        Self {
            blocks: Arc::new(RwLock::new(blocks)),
        }
    }

    /// Get number of blocks stored
    pub fn len(&self) -> usize {
        self.blocks.read().unwrap().len()
    }

    /// Check if store is empty
    pub fn is_empty(&self) -> bool {
        self.blocks.read().unwrap().is_empty()
    }

    /// Clear all blocks
    pub fn clear(&self) {
        self.blocks.write().unwrap().clear();
    }

    /// Copy of every block currently held
    pub fn snapshot(&self) -> BTreeMap<Cid, Bytes> {
        self.blocks.read().unwrap().clone()
    }
}

impl Default for MemoryBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStore for MemoryBlockStore {
    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>> {
        Ok(self.blocks.read().unwrap().get(cid).cloned())
    }

    async fn put(&self, data: &[u8]) -> Result<Cid> {
        let cid = Cid::for_dag_cbor_bytes(data);
        self.blocks
            .write()
            .unwrap()
            .insert(cid, Bytes::copy_from_slice(data));
        Ok(cid)
    }

    async fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(self.blocks.read().unwrap().contains_key(cid))
    }

    async fn put_many(&self, blocks: impl IntoIterator<Item = (Cid, Bytes)> + Send) -> Result<()> {
        let mut store = self.blocks.write().unwrap();
        store.extend(blocks);
        Ok(())
    }

    async fn get_many(&self, cids: &[Cid]) -> Result<Vec<Option<Bytes>>> {
        let store = self.blocks.read().unwrap();
        Ok(cids.iter().map(|cid| store.get(cid).cloned()).collect())
    }

    async fn apply_commit(&self, commit: CommitData) -> Result<()> {
        let mut store = self.blocks.write().unwrap();
        store.extend(commit.blocks);
        for cid in &commit.deleted_cids {
            store.remove(cid);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_and_get() {
        let store = MemoryBlockStore::new();
        let data = [0x63, b'a', b'b', b'c'];

        let cid = store.put(&data).await.unwrap();
        assert_eq!(cid, Cid::for_dag_cbor_bytes(&data));
        let retrieved = store.get(&cid).await.unwrap();
        assert_eq!(retrieved.as_deref(), Some(&data[..]));
    }

    #[tokio::test]
    async fn has_and_get_many() {
        let store = MemoryBlockStore::new();
        let cid1 = store.put(&[0x01]).await.unwrap();
        let cid2 = store.put(&[0x02]).await.unwrap();
        let missing = Cid::for_raw_bytes(b"nope");

        assert!(store.has(&cid1).await.unwrap());
        assert!(!store.has(&missing).await.unwrap());

        let results = store.get_many(&[cid1, missing, cid2]).await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_deref(), Some(&[0x01][..]));
        assert_eq!(results[1], None);
        assert_eq!(results[2].as_deref(), Some(&[0x02][..]));
    }

    #[tokio::test]
    async fn put_many_and_clear() {
        let store = MemoryBlockStore::new();
        let a = Cid::for_dag_cbor_bytes(&[0x01]);
        let b = Cid::for_dag_cbor_bytes(&[0x02]);
        store
            .put_many(vec![
                (a, Bytes::from_static(&[0x01])),
                (b, Bytes::from_static(&[0x02])),
            ])
            .await
            .unwrap();
        assert_eq!(store.len(), 2);

        store.clear();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn clone_shares_storage() {
        let store1 = MemoryBlockStore::new();
        let store2 = store1.clone();

        let cid = store1.put(&[0xf6]).await.unwrap();
        assert!(store2.has(&cid).await.unwrap());
    }
}
