//! Block storage abstraction for MST nodes, commits and records

use crate::{error::Result, repo::CommitData};
use bytes::Bytes;
use skein_common::Cid;

/// Async block storage trait
///
/// CID-keyed storage for MST nodes, commits and record data. The MST, the
/// diff collector and [`Repository`](crate::Repository) are all written once
/// against this trait, so the same algorithms run over:
/// - in-memory maps ([`MemoryBlockStore`])
/// - a staging overlay on top of another store ([`LayeredBlockStore`])
/// - a CAR file ([`FileBlockStore`])
///
/// Clone is required so trees can share storage handles across operations.
///
/// # Example
///
/// ```rust,ignore
/// use skein_repo::storage::{BlockStore, MemoryBlockStore};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let storage = MemoryBlockStore::new();
/// let cid = storage.put(&[0xa0]).await?; // empty map
/// assert!(storage.has(&cid).await?);
/// # Ok(())
/// # }
/// ```
#[trait_variant::make(Send)]
pub trait BlockStore: Clone {
    /// Get a block by CID
    ///
    /// Returns `None` if the block is not found.
    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>>;

    /// Put a block of canonical DAG-CBOR, return its CID
    async fn put(&self, data: &[u8]) -> Result<Cid>;

    /// Check if a block exists without retrieving it
    async fn has(&self, cid: &Cid) -> Result<bool>;

    /// Put many blocks with known CIDs at once
    ///
    /// The CIDs are trusted to match the data.
    async fn put_many(&self, blocks: impl IntoIterator<Item = (Cid, Bytes)> + Send) -> Result<()>;

    /// Get multiple blocks at once
    ///
    /// Returns a vec of the same length as the input, with `None` for missing blocks.
    async fn get_many(&self, cids: &[Cid]) -> Result<Vec<Option<Bytes>>>;

    /// Apply a commit: persist `commit.blocks`, then drop `commit.deleted_cids`
    ///
    /// Writes happen before deletes, so a block both written and deleted
    /// ends up absent.
    async fn apply_commit(&self, commit: CommitData) -> Result<()>;
}

pub mod file;
pub mod layered;
pub mod memory;

pub use file::FileBlockStore;
pub use layered::LayeredBlockStore;
pub use memory::MemoryBlockStore;
