//! Immutable Merkle Search Tree operations

use super::node::{NodeData, NodeEntry};
use super::util;
use crate::error::{MstError, RepoError, Result};
use crate::storage::BlockStore;
use bytes::Bytes;
use skein_common::Cid;
use smol_str::SmolStr;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Write operation for batch application
///
/// `prev` is optional here, as on the firehose; when present it is checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Create new record (error if exists)
    Create {
        /// Record key (collection/rkey)
        key: SmolStr,
        /// Record CID
        cid: Cid,
    },

    /// Update existing record (error if not exists)
    Update {
        /// Record key (collection/rkey)
        key: SmolStr,
        /// New record CID
        cid: Cid,
        /// Expected current CID
        prev: Option<Cid>,
    },

    /// Delete existing record (error if not exists)
    Delete {
        /// Record key (collection/rkey)
        key: SmolStr,
        /// Expected current CID
        prev: Option<Cid>,
    },
}

impl WriteOp {
    /// The key this operation touches
    pub fn key(&self) -> &str {
        match self {
            WriteOp::Create { key, .. } | WriteOp::Update { key, .. } | WriteOp::Delete { key, .. } => {
                key
            }
        }
    }
}

/// Write operation with required prev fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifiedWriteOp {
    /// Create new record (verified not to exist)
    Create {
        /// Record key (collection/rkey)
        key: SmolStr,
        /// Record CID
        cid: Cid,
    },

    /// Update existing record
    Update {
        /// Record key (collection/rkey)
        key: SmolStr,
        /// New record CID
        cid: Cid,
        /// Current CID, must match the tree
        prev: Cid,
    },

    /// Delete existing record
    Delete {
        /// Record key (collection/rkey)
        key: SmolStr,
        /// Current CID, must match the tree
        prev: Cid,
    },
}

impl From<VerifiedWriteOp> for WriteOp {
    fn from(op: VerifiedWriteOp) -> Self {
        match op {
            VerifiedWriteOp::Create { key, cid } => WriteOp::Create { key, cid },
            VerifiedWriteOp::Update { key, cid, prev } => WriteOp::Update {
                key,
                cid,
                prev: Some(prev),
            },
            VerifiedWriteOp::Delete { key, prev } => WriteOp::Delete {
                key,
                prev: Some(prev),
            },
        }
    }
}

/// A block reached while walking a tree for export
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MstBlock {
    /// An MST node
    Node(Cid),
    /// A record referenced by a leaf
    Record(Cid),
}

/// Immutable Merkle Search Tree
///
/// A tree is just a root CID over a [`BlockStore`]. Operations that change the
/// tree write the rebuilt nodes along the modified path into the store and
/// return a new `Mst`; the original stays valid and untouched, and siblings
/// off the path keep their CIDs.
///
/// # Layers
///
/// A key's layer is `leading_zero_bits(sha256(key)) / 2`. A node at layer
/// `d` holds only keys of layer `d`; its subtrees are nodes at `d - 1`. The
/// root sits at the highest key layer, and nodes with no keys of their own
/// bridge gaps between layers. The shape is a pure function of the key set.
///
/// ```rust,ignore
/// let mst = Mst::new(storage);
/// let mst = mst.add("app.bsky.feed.post/3jqfcqzm3fo2j", record_cid).await?;
/// assert_eq!(mst.get("app.bsky.feed.post/3jqfcqzm3fo2j").await?, Some(record_cid));
/// ```
#[derive(Debug, Clone)]
pub struct Mst<S> {
    storage: Arc<S>,
    root: Cid,
}

impl<S: BlockStore + Sync + Send + 'static> Mst<S> {
    /// Empty tree
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            root: util::empty_node_cid(),
        }
    }

    /// Tree rooted at an existing node
    ///
    /// Nothing is read until the tree is used.
    pub fn load(storage: Arc<S>, root: Cid) -> Self {
        Self { storage, root }
    }

    /// Root CID
    pub fn root(&self) -> Cid {
        self.root
    }

    /// Shared reference to the block storage
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Whether the tree holds no keys
    pub fn is_empty(&self) -> bool {
        self.root == util::empty_node_cid()
    }

    fn with_root(&self, root: Cid) -> Self {
        Self {
            storage: self.storage.clone(),
            root,
        }
    }

    /// Raw bytes of a node; the empty node never touches storage
    pub(crate) async fn node_bytes(&self, cid: &Cid) -> Result<Bytes> {
        if *cid == util::empty_node_cid() {
            return Ok(Bytes::from_static(util::EMPTY_NODE_BYTES));
        }
        self.storage
            .get(cid)
            .await?
            .ok_or_else(|| RepoError::not_found("MST node", cid))
    }

    /// Load and check a node.
    ///
    /// With a known layer every key must hash to it; without one, all keys
    /// must at least agree with each other.
    pub(crate) async fn load_node(&self, cid: &Cid, layer: Option<usize>) -> Result<Vec<NodeEntry>> {
        let bytes = self.node_bytes(cid).await?;
        parse_node(&bytes, layer)
    }

    /// Load a node reached through a subtree link; those are never empty
    async fn load_child(&self, cid: &Cid, layer: usize) -> Result<Vec<NodeEntry>> {
        let entries = self.load_node(cid, Some(layer)).await?;
        if entries.is_empty() {
            return Err(MstError::TreeInvariantViolation(format!("empty subtree {}", cid)).into());
        }
        Ok(entries)
    }

    async fn store_node(&self, entries: &[NodeEntry]) -> Result<Cid> {
        let bytes = NodeData::from_entries(entries)?.to_bytes();
        let cid = self.storage.put(&bytes).await?;
        tracing::trace!(%cid, entries = entries.len(), "stored MST node");
        Ok(cid)
    }

    /// Layer of the node at `cid`, following subtree links through bridge nodes
    fn node_layer<'a>(&'a self, cid: Cid) -> BoxFuture<'a, usize> {
        Box::pin(async move {
            let entries = self.load_node(&cid, None).await?;
            layer_of(self, &entries).await
        })
    }

    /// Root layer together with the root's entries
    async fn root_node(&self) -> Result<(usize, Vec<NodeEntry>)> {
        let entries = self.load_node(&self.root, None).await?;
        let layer = layer_of(self, &entries).await?;
        check_node(&entries, Some(layer))?;
        Ok((layer, entries))
    }

    /// Layer of the root node (0 for an empty tree)
    pub async fn layer(&self) -> Result<usize> {
        Ok(self.root_node().await?.0)
    }

    /// Look up a key
    pub async fn get(&self, key: &str) -> Result<Option<Cid>> {
        util::validate_key(key)?;

        let (mut layer, mut entries) = self.root_node().await?;
        loop {
            let index = find_gt_or_equal_leaf_index(&entries, key);
            if let Some(NodeEntry::Leaf { key: leaf_key, value }) = entries.get(index) {
                if leaf_key == key {
                    return Ok(Some(*value));
                }
            }
            match index.checked_sub(1).and_then(|i| entries[i].tree().copied()) {
                Some(subtree) => {
                    layer -= 1;
                    entries = self.load_child(&subtree, layer).await?;
                }
                None => return Ok(None),
            }
        }
    }

    /// Insert or replace a key (returns new tree)
    pub async fn add(&self, key: &str, cid: Cid) -> Result<Mst<S>> {
        util::validate_key(key)?;

        let key_layer = util::layer_for_key(key);
        let (root_layer, _) = self.root_node().await?;

        if key_layer <= root_layer {
            let root = self
                .add_recurse(Some(self.root), root_layer, key, key_layer, cid)
                .await?;
            return Ok(self.with_root(root));
        }

        // Key outranks the root: split the whole tree around it and grow
        // bridge levels until both halves sit just below the new root.
        let (mut left, mut right) = self.split_around(self.root, root_layer, key).await?;
        for _ in root_layer + 1..key_layer {
            if let Some(l) = left {
                left = Some(self.store_node(&[NodeEntry::Tree(l)]).await?);
            }
            if let Some(r) = right {
                right = Some(self.store_node(&[NodeEntry::Tree(r)]).await?);
            }
        }

        let mut entries = Vec::with_capacity(3);
        entries.extend(left.map(NodeEntry::Tree));
        entries.push(NodeEntry::Leaf {
            key: SmolStr::new(key),
            value: cid,
        });
        entries.extend(right.map(NodeEntry::Tree));
        let root = self.store_node(&entries).await?;
        Ok(self.with_root(root))
    }

    /// Insert into the node at `node` (a fresh empty node when `None`),
    /// returning the rebuilt node's CID. `key_layer <= layer`.
    fn add_recurse<'a>(
        &'a self,
        node: Option<Cid>,
        layer: usize,
        key: &'a str,
        key_layer: usize,
        cid: Cid,
    ) -> BoxFuture<'a, Cid> {
        Box::pin(async move {
            let mut entries = match node {
                Some(node) if node == self.root => self.load_node(&node, Some(layer)).await?,
                Some(node) => self.load_child(&node, layer).await?,
                None => Vec::new(),
            };
            let index = find_gt_or_equal_leaf_index(&entries, key);
            let leaf = NodeEntry::Leaf {
                key: SmolStr::new(key),
                value: cid,
            };

            if key_layer == layer {
                if let Some(NodeEntry::Leaf { key: leaf_key, .. }) = entries.get(index) {
                    if leaf_key == key {
                        entries[index] = leaf;
                        return self.store_node(&entries).await;
                    }
                }

                match index.checked_sub(1).and_then(|i| entries[i].tree().copied()) {
                    Some(subtree) => {
                        // Key lands inside the range of the subtree before it
                        let (left, right) = self.split_around(subtree, layer - 1, key).await?;
                        let tail = entries.split_off(index);
                        entries.pop();
                        entries.extend(left.map(NodeEntry::Tree));
                        entries.push(leaf);
                        entries.extend(right.map(NodeEntry::Tree));
                        entries.extend(tail);
                    }
                    None => entries.insert(index, leaf),
                }
            } else {
                match index.checked_sub(1).and_then(|i| entries[i].tree().copied()) {
                    Some(subtree) => {
                        let new_subtree = self
                            .add_recurse(Some(subtree), layer - 1, key, key_layer, cid)
                            .await?;
                        entries[index - 1] = NodeEntry::Tree(new_subtree);
                    }
                    None => {
                        let new_subtree = self
                            .add_recurse(None, layer - 1, key, key_layer, cid)
                            .await?;
                        entries.insert(index, NodeEntry::Tree(new_subtree));
                    }
                }
            }

            self.store_node(&entries).await
        })
    }

    /// Split the node at `node` into the parts below and above `key`
    ///
    /// Either side is `None` when it would hold no keys.
    fn split_around<'a>(
        &'a self,
        node: Cid,
        layer: usize,
        key: &'a str,
    ) -> BoxFuture<'a, (Option<Cid>, Option<Cid>)> {
        Box::pin(async move {
            let entries = self.load_node(&node, Some(layer)).await?;
            let index = find_gt_or_equal_leaf_index(&entries, key);
            let mut left = entries[..index].to_vec();
            let mut right = entries[index..].to_vec();

            if let Some(NodeEntry::Tree(last)) = left.last().cloned() {
                left.pop();
                let (split_left, split_right) = self.split_around(last, layer - 1, key).await?;
                left.extend(split_left.map(NodeEntry::Tree));
                if let Some(sr) = split_right {
                    right.insert(0, NodeEntry::Tree(sr));
                }
            }

            let left = match left.is_empty() {
                true => None,
                false => Some(self.store_node(&left).await?),
            };
            let right = match right.is_empty() {
                true => None,
                false => Some(self.store_node(&right).await?),
            };
            Ok((left, right))
        })
    }

    /// Replace the value of an existing key (returns new tree)
    pub async fn update(&self, key: &str, cid: Cid) -> Result<Mst<S>> {
        if self.get(key).await?.is_none() {
            return Err(RepoError::not_found("key", key));
        }
        self.add(key, cid).await
    }

    /// Remove an existing key (returns new tree)
    pub async fn delete(&self, key: &str) -> Result<Mst<S>> {
        util::validate_key(key)?;

        let (layer, _) = self.root_node().await?;
        let root = match self.delete_recurse(self.root, layer, key).await? {
            Some(root) => root,
            None => self.store_node(&[]).await?,
        };
        self.with_root(root).trim_top().await
    }

    /// Delete from the node at `node`; `None` when the node ends up empty
    fn delete_recurse<'a>(&'a self, node: Cid, layer: usize, key: &'a str) -> BoxFuture<'a, Option<Cid>> {
        Box::pin(async move {
            let mut entries = self.load_node(&node, Some(layer)).await?;
            let index = find_gt_or_equal_leaf_index(&entries, key);

            let found = matches!(
                entries.get(index),
                Some(NodeEntry::Leaf { key: leaf_key, .. }) if leaf_key == key
            );

            if found {
                let prev = index.checked_sub(1).and_then(|i| entries[i].tree().copied());
                let next = entries.get(index + 1).and_then(NodeEntry::tree).copied();
                match (prev, next) {
                    (Some(prev), Some(next)) => {
                        // The two neighbouring subtrees become one
                        let merged = self.merge(prev, next, layer - 1).await?;
                        entries[index - 1] = NodeEntry::Tree(merged);
                        entries.drain(index..index + 2);
                    }
                    _ => {
                        entries.remove(index);
                    }
                }
            } else {
                let Some(subtree) = index.checked_sub(1).and_then(|i| entries[i].tree().copied())
                else {
                    return Err(RepoError::not_found("key", key));
                };
                match self.delete_recurse(subtree, layer - 1, key).await? {
                    Some(new_subtree) => entries[index - 1] = NodeEntry::Tree(new_subtree),
                    None => {
                        entries.remove(index - 1);
                    }
                }
            }

            if entries.is_empty() {
                return Ok(None);
            }
            Ok(Some(self.store_node(&entries).await?))
        })
    }

    /// Join two adjacent nodes at the same layer; every key in `left` sorts
    /// before every key in `right`
    fn merge<'a>(&'a self, left: Cid, right: Cid, layer: usize) -> BoxFuture<'a, Cid> {
        Box::pin(async move {
            let mut left_entries = self.load_child(&left, layer).await?;
            let right_entries = self.load_child(&right, layer).await?;

            match (left_entries.last().cloned(), right_entries.first()) {
                (Some(NodeEntry::Tree(l)), Some(NodeEntry::Tree(r))) => {
                    let merged = self.merge(l, *r, layer - 1).await?;
                    left_entries.pop();
                    left_entries.push(NodeEntry::Tree(merged));
                    left_entries.extend_from_slice(&right_entries[1..]);
                }
                _ => left_entries.extend(right_entries),
            }

            self.store_node(&left_entries).await
        })
    }

    /// Drop root levels that only hold a single subtree link
    async fn trim_top(mut self) -> Result<Mst<S>> {
        loop {
            let entries = self.load_node(&self.root, None).await?;
            match entries.as_slice() {
                [NodeEntry::Tree(only)] => self.root = *only,
                _ => return Ok(self),
            }
        }
    }

    /// Apply verified operations in order (returns new tree)
    ///
    /// Creates fail if the key exists; updates and deletes fail unless the
    /// key's current CID equals `prev`.
    pub async fn batch(&self, ops: &[VerifiedWriteOp]) -> Result<Mst<S>> {
        let mut tree = self.clone();
        for op in ops {
            tree = tree.apply_op(&op.clone().into()).await?;
        }
        Ok(tree)
    }

    /// Apply operations whose `prev` may be absent (returns new tree)
    pub async fn apply_ops(&self, ops: &[WriteOp]) -> Result<Mst<S>> {
        let mut tree = self.clone();
        for op in ops {
            tree = tree.apply_op(op).await?;
        }
        Ok(tree)
    }

    async fn apply_op(&self, op: &WriteOp) -> Result<Mst<S>> {
        match op {
            WriteOp::Create { key, cid } => {
                if self.get(key).await?.is_some() {
                    return Err(RepoError::already_exists("key", key));
                }
                self.add(key, *cid).await
            }
            WriteOp::Update { key, cid, prev } => {
                self.check_prev(key, prev.as_ref()).await?;
                self.add(key, *cid).await
            }
            WriteOp::Delete { key, prev } => {
                self.check_prev(key, prev.as_ref()).await?;
                self.delete(key).await
            }
        }
    }

    async fn check_prev(&self, key: &str, prev: Option<&Cid>) -> Result<()> {
        let current = self
            .get(key)
            .await?
            .ok_or_else(|| RepoError::not_found("key", key))?;
        match prev {
            Some(prev) if *prev != current => Err(RepoError::prev_mismatch(key, prev, current)),
            _ => Ok(()),
        }
    }

    /// Every key and value, in key order
    pub async fn leaves(&self) -> Result<Vec<(SmolStr, Cid)>> {
        let mut out = Vec::new();
        let (layer, entries) = self.root_node().await?;
        self.collect_range(entries, layer, "", None, None, &mut out).await?;
        Ok(out)
    }

    /// Keys starting with `prefix`, in key order
    ///
    /// Subtrees whose key range lies outside the prefix are never loaded.
    pub async fn list_prefix(&self, prefix: &str) -> Result<Vec<(SmolStr, Cid)>> {
        let mut out = Vec::new();
        let (layer, entries) = self.root_node().await?;
        self.collect_range(entries, layer, prefix, None, None, &mut out).await?;
        Ok(out)
    }

    /// Records of one collection: keys under `{nsid}/`
    pub async fn list_collection(&self, nsid: &str) -> Result<Vec<(SmolStr, Cid)>> {
        self.list_prefix(&format!("{}/", nsid)).await
    }

    /// In-order walk of one node, bounded by the leaves around it
    fn collect_range<'a>(
        &'a self,
        entries: Vec<NodeEntry>,
        layer: usize,
        prefix: &'a str,
        lower: Option<SmolStr>,
        upper: Option<SmolStr>,
        out: &'a mut Vec<(SmolStr, Cid)>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            for (i, entry) in entries.iter().enumerate() {
                match entry {
                    NodeEntry::Leaf { key, value } => {
                        if key.starts_with(prefix) {
                            out.push((key.clone(), *value));
                        }
                    }
                    NodeEntry::Tree(subtree) => {
                        let lo = match i.checked_sub(1).and_then(|j| entries[j].leaf_key()) {
                            Some(k) => Some(SmolStr::new(k)),
                            None => lower.clone(),
                        };
                        let hi = match entries.get(i + 1).and_then(NodeEntry::leaf_key) {
                            Some(k) => Some(SmolStr::new(k)),
                            None => upper.clone(),
                        };
                        if !range_may_hold_prefix(lo.as_deref(), hi.as_deref(), prefix) {
                            continue;
                        }
                        let child = self.load_child(subtree, layer - 1).await?;
                        self.collect_range(child, layer - 1, prefix, lo, hi, out).await?;
                    }
                }
            }
            Ok(())
        })
    }

    /// CIDs on the path from the root to `key`
    ///
    /// Every node visited, root first, then the record CID when the key is
    /// present. The blocks behind these CIDs prove presence or absence.
    pub async fn cids_for_path(&self, key: &str) -> Result<Vec<Cid>> {
        util::validate_key(key)?;

        let mut cids = vec![self.root];
        let (mut layer, mut entries) = self.root_node().await?;
        loop {
            let index = find_gt_or_equal_leaf_index(&entries, key);
            if let Some(NodeEntry::Leaf { key: leaf_key, value }) = entries.get(index) {
                if leaf_key == key {
                    cids.push(*value);
                    return Ok(cids);
                }
            }
            match index.checked_sub(1).and_then(|i| entries[i].tree().copied()) {
                Some(subtree) => {
                    cids.push(subtree);
                    layer -= 1;
                    entries = self.load_child(&subtree, layer).await?;
                }
                None => return Ok(cids),
            }
        }
    }

    /// Every node and record CID, depth-first in key order
    ///
    /// Each node comes before everything beneath it. The order is a pure
    /// function of the tree, so exports are reproducible.
    pub async fn walk_blocks(&self) -> Result<Vec<MstBlock>> {
        let mut out = Vec::new();
        let (layer, entries) = self.root_node().await?;
        out.push(MstBlock::Node(self.root));
        self.walk_node(entries, layer, &mut out).await?;
        Ok(out)
    }

    fn walk_node<'a>(
        &'a self,
        entries: Vec<NodeEntry>,
        layer: usize,
        out: &'a mut Vec<MstBlock>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            for entry in entries {
                match entry {
                    NodeEntry::Leaf { value, .. } => out.push(MstBlock::Record(value)),
                    NodeEntry::Tree(subtree) => {
                        out.push(MstBlock::Node(subtree));
                        let child = self.load_child(&subtree, layer - 1).await?;
                        self.walk_node(child, layer - 1, out).await?;
                    }
                }
            }
            Ok(())
        })
    }

    /// Every node block of the tree, keyed by CID
    pub async fn node_blocks(&self) -> Result<std::collections::BTreeMap<Cid, Bytes>> {
        let mut blocks = std::collections::BTreeMap::new();
        for block in self.walk_blocks().await? {
            if let MstBlock::Node(cid) = block {
                blocks.insert(cid, self.node_bytes(&cid).await?);
            }
        }
        Ok(blocks)
    }
}

/// Decode a node block into checked, expanded entries
pub(crate) fn parse_node(bytes: &[u8], layer: Option<usize>) -> Result<Vec<NodeEntry>> {
    let entries = NodeData::from_bytes(bytes)?.to_entries()?;
    check_node(&entries, layer)?;
    Ok(entries)
}

/// Layer of a node given its entries
async fn layer_of<S: BlockStore + Sync + Send + 'static>(
    mst: &Mst<S>,
    entries: &[NodeEntry],
) -> Result<usize> {
    if let Some(key) = entries.iter().find_map(NodeEntry::leaf_key) {
        return Ok(util::layer_for_key(key));
    }
    match entries.first() {
        Some(NodeEntry::Tree(child)) => Ok(mst.node_layer(*child).await? + 1),
        _ => Ok(0),
    }
}

/// Structural checks shared by every node load
fn check_node(entries: &[NodeEntry], layer: Option<usize>) -> Result<()> {
    let mut expected = layer;
    let mut last: Option<&str> = None;

    for entry in entries {
        match entry {
            NodeEntry::Leaf { key, .. } => {
                let key_layer = util::layer_for_key(key);
                match expected {
                    Some(l) if l != key_layer => {
                        return Err(MstError::TreeInvariantViolation(format!(
                            "key {} has layer {} but sits in a layer {} node",
                            key, key_layer, l
                        ))
                        .into());
                    }
                    None => expected = Some(key_layer),
                    _ => {}
                }
                if let Some(prev) = last {
                    if prev.as_bytes() >= key.as_bytes() {
                        return Err(MstError::TreeInvariantViolation(format!(
                            "keys out of order: {} then {}",
                            prev, key
                        ))
                        .into());
                    }
                }
                last = Some(key.as_str());
            }
            NodeEntry::Tree(_) => {
                if expected == Some(0) {
                    return Err(MstError::TreeInvariantViolation(
                        "layer 0 node links to a subtree".into(),
                    )
                    .into());
                }
            }
        }
    }
    Ok(())
}

/// Index of the first leaf whose key is `>= key`, or `entries.len()`
fn find_gt_or_equal_leaf_index(entries: &[NodeEntry], key: &str) -> usize {
    entries
        .iter()
        .position(|e| matches!(e.leaf_key(), Some(k) if k.as_bytes() >= key.as_bytes()))
        .unwrap_or(entries.len())
}

/// Can a subtree holding keys strictly between `lo` and `hi` contain a key
/// starting with `prefix`?
fn range_may_hold_prefix(lo: Option<&str>, hi: Option<&str>, prefix: &str) -> bool {
    if let Some(hi) = hi {
        // all keys < hi <= prefix
        if hi.as_bytes() <= prefix.as_bytes() {
            return false;
        }
    }
    if let Some(lo) = lo {
        // all keys > lo, and lo is already past the prefix range
        if lo.as_bytes() > prefix.as_bytes() && !lo.starts_with(prefix) {
            return false;
        }
    }
    true
}
