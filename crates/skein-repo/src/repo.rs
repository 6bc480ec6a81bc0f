//! High-level repository operations
//!
//! A [`Repository`] is one account's signed tree: a head commit over an MST
//! root, stored in a [`BlockStore`]. Writes run as transactions that stage
//! every new block, sign, and only then hand the blocks to storage.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use skein_common::cbor::{self, DagCborValue};
use skein_common::types::crypto::PublicKey;
use skein_common::{Cid, Did, Tid, TidGenerator};
use smol_str::{SmolStr, format_smolstr};
use tokio::io::{AsyncWrite, BufWriter};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::car::{AsyncCarWriter, parse_car_bytes, write_car_bytes};
use crate::commit::firehose::{FirehoseCommit, RepoOp};
use crate::commit::{Commit, SigningKey};
use crate::config::RepoConfig;
use crate::error::{DiffError, RepoError, Result};
use crate::mst::diff::diff;
use crate::mst::util::empty_node_block;
use crate::mst::{Mst, MstBlock, WriteOp};
use crate::storage::{BlockStore, LayeredBlockStore, MemoryBlockStore};

/// Commit data for repository updates
///
/// Everything one write transaction produced: the signed commit, the blocks to
/// persist and the blocks that are no longer reachable.
#[derive(Debug, Clone)]
pub struct CommitData {
    /// Repository DID
    pub did: Did,

    /// Commit CID
    pub cid: Cid,

    /// New revision TID
    pub rev: Tid,

    /// Previous revision TID (None for initial commit)
    pub since: Option<Tid>,

    /// Previous commit CID (None for initial commit)
    pub prev: Option<Cid>,

    /// New MST root CID
    pub data: Cid,

    /// Previous MST root CID (for sync v1.1)
    pub prev_data: Option<Cid>,

    /// New blocks to persist (MST nodes + record data + commit block)
    pub blocks: BTreeMap<Cid, Bytes>,

    /// Record operations, sorted by path
    pub ops: Vec<RepoOp>,

    /// CIDs of blocks no longer referenced by the new tree
    pub deleted_cids: Vec<Cid>,
}

impl CommitData {
    /// Build a firehose commit event (sync v1.1)
    ///
    /// `blocks` is a CAR rooted at the commit holding every block of this
    /// commit. When the ops or the CAR are over the configured limits, the
    /// event is marked `tooBig` and carries only the commit block and no ops.
    pub fn to_firehose_commit(
        &self,
        seq: i64,
        time: DateTime<Utc>,
        blobs: Vec<Cid>,
        config: &RepoConfig,
    ) -> FirehoseCommit {
        let mut blocks = write_car_bytes(&[self.cid], self.blocks.clone());
        let mut ops = self.ops.clone();
        let too_big = ops.len() > config.max_ops_per_commit
            || blocks.len() > config.max_firehose_blocks_bytes;

        if too_big {
            tracing::warn!(
                did = %self.did,
                rev = %self.rev,
                ops = ops.len(),
                bytes = blocks.len(),
                "commit too big for firehose, sending commit block only"
            );
            let commit_block = self.blocks.get(&self.cid).cloned().map(|b| (self.cid, b));
            blocks = write_car_bytes(&[self.cid], commit_block);
            ops.clear();
        }

        FirehoseCommit {
            repo: self.did.clone(),
            rev: self.rev.clone(),
            seq,
            since: self.since.clone(),
            time,
            commit: self.cid,
            blocks: Bytes::from(blocks),
            ops,
            prev_data: self.prev_data,
            blobs,
            too_big,
            rebase: false,
        }
    }
}

/// One record write in a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordWrite {
    /// Create a record; fails if the path is taken
    Create {
        /// Collection/rkey path
        path: SmolStr,
        /// Record value
        record: DagCborValue,
    },
    /// Replace a record; fails if the path is free
    Update {
        /// Collection/rkey path
        path: SmolStr,
        /// New record value
        record: DagCborValue,
        /// Expected current CID, checked when given
        prev: Option<Cid>,
    },
    /// Remove a record; fails if the path is free
    Delete {
        /// Collection/rkey path
        path: SmolStr,
        /// Expected current CID, checked when given
        prev: Option<Cid>,
    },
}

impl RecordWrite {
    /// Create `collection/rkey`
    pub fn create(collection: &str, rkey: &str, record: DagCborValue) -> Self {
        RecordWrite::Create {
            path: format_smolstr!("{}/{}", collection, rkey),
            record,
        }
    }

    /// Replace `collection/rkey`
    pub fn update(collection: &str, rkey: &str, record: DagCborValue) -> Self {
        RecordWrite::Update {
            path: format_smolstr!("{}/{}", collection, rkey),
            record,
            prev: None,
        }
    }

    /// Delete `collection/rkey`
    pub fn delete(collection: &str, rkey: &str) -> Self {
        RecordWrite::Delete {
            path: format_smolstr!("{}/{}", collection, rkey),
            prev: None,
        }
    }

    /// Path this write touches
    pub fn path(&self) -> &str {
        match self {
            RecordWrite::Create { path, .. }
            | RecordWrite::Update { path, .. }
            | RecordWrite::Delete { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone)]
struct Head {
    cid: Cid,
    commit: Commit,
}

/// A single account's repository
///
/// Writes are serialized by an internal lock; reads only wait for the brief
/// swap of the head commit. Exports take a snapshot of the head and stream
/// immutable blocks without holding any lock.
///
/// # Example
///
/// ```rust,ignore
/// let storage = Arc::new(MemoryBlockStore::new());
/// let repo = Repository::create(storage, did, &signing_key, RepoConfig::default()).await?;
///
/// let commit = repo
///     .apply_writes(&[RecordWrite::create("app.bsky.feed.post", "3k1", record)], &signing_key)
///     .await?;
/// let event = commit.to_firehose_commit(seq, Utc::now(), vec![], repo.config());
/// ```
pub struct Repository<S: BlockStore> {
    storage: Arc<S>,
    config: RepoConfig,
    did: Did,
    writer: Mutex<TidGenerator>,
    head: RwLock<Head>,
}

impl<S: BlockStore + Sync + Send + 'static> Repository<S> {
    fn tid_generator(config: &RepoConfig) -> TidGenerator {
        match config.clock_id {
            Some(id) => TidGenerator::with_clock(skein_common::types::tid::SystemClock, id),
            None => TidGenerator::new(),
        }
    }

    /// Install a new repository: an empty tree and one signed commit over it
    #[tracing::instrument(skip_all, fields(did = %did))]
    pub async fn create(
        storage: Arc<S>,
        did: Did,
        signer: &impl SigningKey,
        config: RepoConfig,
    ) -> Result<Self> {
        config.validate()?;
        let mut tids = Self::tid_generator(&config);

        let (root, root_bytes) = empty_node_block();
        let commit =
            Commit::new_unsigned(did.clone(), root, tids.next_tid(), None).sign(signer)?;
        let cid = commit.cid();

        let mut blocks = BTreeMap::new();
        blocks.insert(root, root_bytes);
        blocks.insert(cid, Bytes::from(commit.to_cbor()));
        storage
            .apply_commit(CommitData {
                did: did.clone(),
                cid,
                rev: commit.rev.clone(),
                since: None,
                prev: None,
                data: root,
                prev_data: None,
                blocks,
                ops: Vec::new(),
                deleted_cids: Vec::new(),
            })
            .await?;

        tracing::debug!(commit = %cid, rev = %commit.rev, "created repository");
        Ok(Self {
            storage,
            config,
            did,
            writer: Mutex::new(tids),
            head: RwLock::new(Head { cid, commit }),
        })
    }

    /// Open the repository whose head commit is `commit_cid`
    pub async fn load(storage: Arc<S>, commit_cid: Cid, config: RepoConfig) -> Result<Self> {
        config.validate()?;
        let bytes = storage
            .get(&commit_cid)
            .await?
            .ok_or_else(|| RepoError::not_found("commit block", commit_cid))?;
        let commit = Commit::from_cbor(&bytes)?;

        Ok(Self {
            storage,
            did: commit.did.clone(),
            writer: Mutex::new(Self::tid_generator(&config)),
            config,
            head: RwLock::new(Head {
                cid: commit_cid,
                commit,
            }),
        })
    }

    /// Load a full repository export into `storage` and open it
    ///
    /// Every block is checked against its CID, and the tree is walked to make
    /// sure no node or record is missing.
    #[tracing::instrument(skip_all)]
    pub async fn import_car(storage: Arc<S>, car: &[u8], config: RepoConfig) -> Result<Self> {
        let parsed = parse_car_bytes(car, &config.car)?;
        let count = parsed.blocks.len();
        storage.put_many(parsed.blocks).await?;

        let repo = Self::load(storage, parsed.root, config).await?;
        for block in repo.mst().await.walk_blocks().await? {
            if let MstBlock::Record(cid) = block {
                if !repo.storage.has(&cid).await? {
                    return Err(RepoError::not_found("record block", cid)
                        .with_help("a repository export must contain every record it references"));
                }
            }
        }

        tracing::debug!(did = %repo.did, blocks = count, "imported repository");
        Ok(repo)
    }

    /// Repository DID
    pub fn did(&self) -> &Did {
        &self.did
    }

    /// Active configuration
    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    /// Get reference to the storage
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// CID of the head commit
    pub async fn head_cid(&self) -> Cid {
        self.head.read().await.cid
    }

    /// The head commit
    pub async fn head_commit(&self) -> Commit {
        self.head.read().await.commit.clone()
    }

    /// The tree of the head commit
    pub async fn mst(&self) -> Mst<S> {
        let data = self.head.read().await.commit.data;
        Mst::load(self.storage.clone(), data)
    }

    /// Check the head commit's signature
    pub async fn verify_head(&self, pubkey: &PublicKey) -> Result<()> {
        Ok(self.head.read().await.commit.verify(pubkey)?)
    }

    /// CID of the record at `collection/rkey`
    pub async fn get_record(&self, collection: &str, rkey: &str) -> Result<Option<Cid>> {
        self.mst()
            .await
            .get(&format_smolstr!("{}/{}", collection, rkey))
            .await
    }

    /// Decoded record at `collection/rkey`
    pub async fn get_record_value(
        &self,
        collection: &str,
        rkey: &str,
    ) -> Result<Option<DagCborValue>> {
        let Some(cid) = self.get_record(collection, rkey).await? else {
            return Ok(None);
        };
        let bytes = self
            .storage
            .get(&cid)
            .await?
            .ok_or_else(|| RepoError::not_found("record block", cid))?;
        Ok(Some(cbor::decode(&bytes)?))
    }

    /// Every record in a collection, in key order
    pub async fn list_records(&self, collection: &str) -> Result<Vec<(SmolStr, Cid)>> {
        self.mst().await.list_collection(collection).await
    }

    /// Apply writes as one signed commit
    ///
    /// New blocks are staged over the base storage and only reach it, in one
    /// [`BlockStore::apply_commit`], after the commit is signed. Any failure,
    /// signing included, leaves storage and the head untouched.
    #[tracing::instrument(skip_all, fields(did = %self.did, writes = writes.len()))]
    pub async fn apply_writes(
        &self,
        writes: &[RecordWrite],
        signer: &impl SigningKey,
    ) -> Result<CommitData> {
        if writes.len() > self.config.max_ops_per_commit {
            return Err(DiffError::TooManyOps {
                count: writes.len(),
                max: self.config.max_ops_per_commit,
            }
            .into());
        }

        let mut tids = self.writer.lock().await;
        let head = self.head.read().await.clone();

        let staging = Arc::new(LayeredBlockStore::new(
            MemoryBlockStore::new(),
            self.storage.clone(),
        ));
        let old_tree = Mst::load(staging.clone(), head.commit.data);

        let mut ops = Vec::with_capacity(writes.len());
        for write in writes {
            ops.push(match write {
                RecordWrite::Create { path, record } => WriteOp::Create {
                    key: path.clone(),
                    cid: staging.put(&cbor::encode(record)).await?,
                },
                RecordWrite::Update { path, record, prev } => WriteOp::Update {
                    key: path.clone(),
                    cid: staging.put(&cbor::encode(record)).await?,
                    prev: *prev,
                },
                RecordWrite::Delete { path, prev } => WriteOp::Delete {
                    key: path.clone(),
                    prev: *prev,
                },
            });
        }
        let new_tree = old_tree.apply_ops(&ops).await?;

        let diff = diff(&staging, Some(old_tree.root()), new_tree.root()).await?;
        diff.validate_limits(self.config.max_ops_per_commit)?;

        let mut blocks = diff.fetch_new_blocks(staging.as_ref()).await?;
        blocks.extend(diff.new_mst_blocks.clone());

        let rev = tids.next_after(Some(&head.commit.rev));
        let commit = Commit::new_unsigned(self.did.clone(), new_tree.root(), rev, Some(head.cid))
            .sign(signer)?;
        let cid = commit.cid();
        blocks.insert(cid, Bytes::from(commit.to_cbor()));

        let deleted_cids = unreferenced(&new_tree, &diff.removed_cids, &blocks)
            .await?
            .into_iter()
            .chain(diff.removed_mst_blocks.iter().copied())
            .collect();

        let data = CommitData {
            did: self.did.clone(),
            cid,
            rev: commit.rev.clone(),
            since: Some(head.commit.rev.clone()),
            prev: Some(head.cid),
            data: commit.data,
            prev_data: Some(head.commit.data),
            blocks,
            ops: diff.to_repo_ops(),
            deleted_cids,
        };

        // Exports collect their blocks under the read guard, so nothing is
        // deleted while one is still gathering the previous head's tree.
        let mut current = self.head.write().await;
        self.storage.apply_commit(data.clone()).await?;
        *current = Head { cid, commit };
        drop(current);

        tracing::debug!(
            commit = %cid,
            rev = %data.rev,
            ops = data.ops.len(),
            blocks = data.blocks.len(),
            deleted = data.deleted_cids.len(),
            "applied commit"
        );
        Ok(data)
    }

    /// Stream the whole repository as a CAR rooted at the head commit
    ///
    /// Blocks come in a fixed order: the commit, then the tree depth-first
    /// with each node before what it links to. Every block is read into
    /// memory under the head read guard before the first byte goes out, so a
    /// commit landing mid-stream cannot change the export or delete blocks
    /// it still needs. Writing holds no lock. Stops with a `Cancelled` error
    /// once `cancel` fires.
    #[tracing::instrument(skip_all, fields(did = %self.did))]
    pub async fn export_car<W: AsyncWrite + Unpin + Send>(
        &self,
        writer: W,
        cancel: CancellationToken,
    ) -> Result<W> {
        let (head, blocks) = self.snapshot_blocks().await?;

        let mut car = AsyncCarWriter::new(writer, &[head.cid], cancel).await?;
        car.write_block(&head.cid, &head.commit.to_cbor()).await?;
        for (cid, data) in &blocks {
            car.write_block(cid, data).await?;
        }

        tracing::debug!(commit = %head.cid, blocks = car.blocks_written(), "exported repository");
        Ok(car.finish().await?)
    }

    /// The head and every tree and record block under it, in export order
    async fn snapshot_blocks(&self) -> Result<(Head, Vec<(Cid, Bytes)>)> {
        let head = self.head.read().await;
        let tree = Mst::load(self.storage.clone(), head.commit.data);

        let mut blocks = Vec::new();
        for block in tree.walk_blocks().await? {
            blocks.push(match block {
                MstBlock::Node(cid) => (cid, tree.node_bytes(&cid).await?),
                MstBlock::Record(cid) => (
                    cid,
                    self.storage
                        .get(&cid)
                        .await?
                        .ok_or_else(|| RepoError::not_found("record block", cid))?,
                ),
            });
        }
        tracing::trace!(blocks = blocks.len(), "collected export snapshot");
        Ok((head.clone(), blocks))
    }

    /// Export to a file
    pub async fn export_car_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = tokio::fs::File::create(path).await.map_err(RepoError::io)?;
        self.export_car(BufWriter::new(file), CancellationToken::new())
            .await?;
        Ok(())
    }
}

/// Of `candidates`, those neither referenced by `tree` nor in `written`
async fn unreferenced<S: BlockStore + Sync + Send + 'static>(
    tree: &Mst<S>,
    candidates: &[Cid],
    written: &BTreeMap<Cid, Bytes>,
) -> Result<Vec<Cid>> {
    let candidates: Vec<Cid> = candidates
        .iter()
        .copied()
        .filter(|cid| !written.contains_key(cid))
        .collect();
    if candidates.is_empty() {
        return Ok(candidates);
    }
    // A record value can sit under more than one key
    let live: BTreeSet<Cid> = tree.leaves().await?.into_iter().map(|(_, cid)| cid).collect();
    Ok(candidates.into_iter().filter(|cid| !live.contains(cid)).collect())
}

impl<S: BlockStore> Display for Repository<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.head.try_read() {
            Ok(head) => write!(f, "Repository({} @ {})", self.did, head.commit.rev),
            Err(_) => write!(f, "Repository({})", self.did),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RepoErrorKind;

    fn did() -> Did {
        Did::new("did:plc:l3rouwludahu3ui3bt66mfvj").unwrap()
    }

    fn key() -> p256::ecdsa::SigningKey {
        p256::ecdsa::SigningKey::from_slice(&[7u8; 32]).unwrap()
    }

    fn post(text: &str) -> DagCborValue {
        DagCborValue::map([
            ("$type", "app.bsky.feed.post".into()),
            ("text", text.into()),
        ])
    }

    async fn new_repo() -> Repository<MemoryBlockStore> {
        Repository::create(
            Arc::new(MemoryBlockStore::new()),
            did(),
            &key(),
            RepoConfig::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn create_installs_minimal_repo() {
        let repo = new_repo().await;
        let head = repo.head_commit().await;
        assert_eq!(head.data, crate::mst::util::empty_node_cid());
        assert_eq!(head.prev, None);
        repo.verify_head(&key().public_key()).await.unwrap();
        // empty node and commit
        assert_eq!(repo.storage().len(), 2);
    }

    #[tokio::test]
    async fn writes_and_reads() {
        let repo = new_repo().await;
        let first = repo
            .apply_writes(
                &[
                    RecordWrite::create("app.bsky.feed.post", "3k1", post("one")),
                    RecordWrite::create("app.bsky.actor.profile", "self", post("me")),
                ],
                &key(),
            )
            .await
            .unwrap();
        assert_eq!(first.ops.len(), 2);
        assert_eq!(first.prev_data, Some(crate::mst::util::empty_node_cid()));
        assert_eq!(repo.head_cid().await, first.cid);

        let value = repo
            .get_record_value("app.bsky.feed.post", "3k1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value.get("text").unwrap().as_str(), Some("one"));
        assert_eq!(repo.list_records("app.bsky.feed.post").await.unwrap().len(), 1);

        let second = repo
            .apply_writes(&[RecordWrite::update("app.bsky.feed.post", "3k1", post("two"))], &key())
            .await
            .unwrap();
        assert!(second.rev > first.rev);
        assert_eq!(second.since, Some(first.rev.clone()));
        assert_eq!(second.prev, Some(first.cid));
        let old_record = first.ops[1].cid.unwrap();
        assert!(second.deleted_cids.contains(&old_record));
        assert!(!repo.storage().has(&old_record).await.unwrap());
    }

    #[tokio::test]
    async fn shared_record_value_is_not_deleted() {
        let repo = new_repo().await;
        repo.apply_writes(
            &[
                RecordWrite::create("app.bsky.feed.like", "a", post("same")),
                RecordWrite::create("app.bsky.feed.like", "b", post("same")),
            ],
            &key(),
        )
        .await
        .unwrap();
        let shared = repo.get_record("app.bsky.feed.like", "a").await.unwrap().unwrap();

        let commit = repo
            .apply_writes(&[RecordWrite::delete("app.bsky.feed.like", "a")], &key())
            .await
            .unwrap();
        assert!(!commit.deleted_cids.contains(&shared));
        assert!(repo.storage().has(&shared).await.unwrap());
    }

    #[tokio::test]
    async fn conflicting_writes_change_nothing() {
        let repo = new_repo().await;
        let head = repo.head_cid().await;
        let blocks = repo.storage().len();

        let err = repo
            .apply_writes(&[RecordWrite::delete("app.bsky.feed.post", "missing")], &key())
            .await
            .unwrap_err();
        assert_eq!(*err.kind(), RepoErrorKind::NotFound);
        assert_eq!(repo.head_cid().await, head);
        assert_eq!(repo.storage().len(), blocks);
    }

    #[tokio::test]
    async fn too_many_writes_rejected() {
        let storage = Arc::new(MemoryBlockStore::new());
        let config = RepoConfig::new().max_ops_per_commit(1).build();
        let repo = Repository::create(storage, did(), &key(), config).await.unwrap();
        let writes = [
            RecordWrite::create("app.bsky.feed.post", "a", post("a")),
            RecordWrite::create("app.bsky.feed.post", "b", post("b")),
        ];
        let err = repo.apply_writes(&writes, &key()).await.unwrap_err();
        assert_eq!(*err.kind(), RepoErrorKind::TooLarge);
    }

    #[tokio::test]
    async fn firehose_event_too_big() {
        let repo = new_repo().await;
        let commit = repo
            .apply_writes(&[RecordWrite::create("app.bsky.feed.post", "a", post("a"))], &key())
            .await
            .unwrap();

        let small = RepoConfig::new().max_firehose_blocks_bytes(10).build();
        let event = commit.to_firehose_commit(1, Utc::now(), vec![], &small);
        assert!(event.too_big);
        assert!(event.ops.is_empty());
        let parsed = parse_car_bytes(&event.blocks, &small.car).unwrap();
        assert_eq!(parsed.blocks.len(), 1);

        let event = commit.to_firehose_commit(1, Utc::now(), vec![], repo.config());
        assert!(!event.too_big);
        assert_eq!(event.ops.len(), 1);
    }

    #[tokio::test]
    async fn export_import_roundtrip() {
        let repo = new_repo().await;
        repo.apply_writes(
            &[
                RecordWrite::create("app.bsky.feed.post", "3k1", post("one")),
                RecordWrite::create("app.bsky.feed.post", "3k2", post("two")),
            ],
            &key(),
        )
        .await
        .unwrap();

        let car = repo.export_car(Vec::new(), CancellationToken::new()).await.unwrap();
        let again = repo.export_car(Vec::new(), CancellationToken::new()).await.unwrap();
        assert_eq!(car, again);

        let imported = Repository::import_car(
            Arc::new(MemoryBlockStore::new()),
            &car,
            RepoConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(imported.head_cid().await, repo.head_cid().await);
        assert_eq!(imported.did(), repo.did());
        assert_eq!(
            imported.list_records("app.bsky.feed.post").await.unwrap(),
            repo.list_records("app.bsky.feed.post").await.unwrap()
        );
    }

    #[tokio::test]
    async fn export_respects_cancellation() {
        let repo = new_repo().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = repo.export_car(Vec::new(), cancel).await.unwrap_err();
        assert_eq!(*err.kind(), RepoErrorKind::Cancelled);
    }
}
