//! MST diff calculation
//!
//! Both trees are walked together one layer at a time, from the top layer
//! down. At each layer, nodes present in both frontiers are identical
//! subtrees and are dropped without being read. What remains on the new side
//! is new; what remains on the old side is gone. Their children form the
//! next frontier, and their leaves are compared to derive record operations.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use skein_common::Cid;
use smol_str::SmolStr;

use super::node::NodeEntry;
use super::tree::{Mst, VerifiedWriteOp, parse_node};
use crate::commit::firehose::{RepoAction, RepoOp};
use crate::error::{DiffError, RepoError, Result};
use crate::storage::BlockStore;

/// Changes between two MST states
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MstDiff {
    /// New records created (key, new CID)
    pub creates: Vec<(SmolStr, Cid)>,

    /// Records updated (key, new CID, old CID)
    pub updates: Vec<(SmolStr, Cid, Cid)>,

    /// Records deleted (key, old CID)
    pub deletes: Vec<(SmolStr, Cid)>,

    /// Record CIDs newly referenced by creates and updates
    pub new_leaf_cids: Vec<Cid>,

    /// Record CIDs dropped by deletes and updates
    ///
    /// They may still be referenced under another key.
    pub removed_cids: Vec<Cid>,

    /// MST node blocks only present in the new tree
    pub new_mst_blocks: BTreeMap<Cid, Bytes>,

    /// MST node CIDs only present in the old tree
    pub removed_mst_blocks: Vec<Cid>,
}

impl MstDiff {
    /// Create empty diff
    pub fn new() -> Self {
        Self::default()
    }

    /// No record changed
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    /// Count total operations
    pub fn op_count(&self) -> usize {
        self.creates.len() + self.updates.len() + self.deletes.len()
    }

    /// Fail when the diff holds more than `max_ops` operations
    pub fn validate_limits(&self, max_ops: usize) -> Result<()> {
        if self.op_count() > max_ops {
            return Err(DiffError::TooManyOps {
                count: self.op_count(),
                max: max_ops,
            }
            .into());
        }
        Ok(())
    }

    /// As verified write operations, suitable for [`Mst::batch`]
    pub fn to_verified_ops(&self) -> Vec<VerifiedWriteOp> {
        let mut ops = Vec::with_capacity(self.op_count());
        for (key, cid) in &self.creates {
            ops.push(VerifiedWriteOp::Create {
                key: key.clone(),
                cid: *cid,
            });
        }
        for (key, new_cid, old_cid) in &self.updates {
            ops.push(VerifiedWriteOp::Update {
                key: key.clone(),
                cid: *new_cid,
                prev: *old_cid,
            });
        }
        for (key, old_cid) in &self.deletes {
            ops.push(VerifiedWriteOp::Delete {
                key: key.clone(),
                prev: *old_cid,
            });
        }
        ops
    }

    /// As firehose operations, sorted by path
    pub fn to_repo_ops(&self) -> Vec<RepoOp> {
        let mut ops = Vec::with_capacity(self.op_count());
        for (key, cid) in &self.creates {
            ops.push(RepoOp {
                action: RepoAction::Create,
                path: key.clone(),
                cid: Some(*cid),
                prev: None,
            });
        }
        for (key, new_cid, old_cid) in &self.updates {
            ops.push(RepoOp {
                action: RepoAction::Update,
                path: key.clone(),
                cid: Some(*new_cid),
                prev: Some(*old_cid),
            });
        }
        for (key, old_cid) in &self.deletes {
            ops.push(RepoOp {
                action: RepoAction::Delete,
                path: key.clone(),
                cid: None,
                prev: Some(*old_cid),
            });
        }
        ops.sort_by(|a, b| a.path.cmp(&b.path));
        ops
    }

    /// Fetch the blocks of newly referenced records
    ///
    /// Fails with `NotFound` when a record block is missing from `storage`.
    pub async fn fetch_new_blocks<S: BlockStore + Sync>(&self, storage: &S) -> Result<BTreeMap<Cid, Bytes>> {
        let mut blocks = BTreeMap::new();
        let found = storage.get_many(&self.new_leaf_cids).await?;
        for (cid, data) in self.new_leaf_cids.iter().zip(found) {
            let data = data.ok_or_else(|| RepoError::not_found("record block", cid))?;
            blocks.insert(*cid, data);
        }
        Ok(blocks)
    }
}

impl<S: BlockStore + Sync + Send + 'static> Mst<S> {
    /// Changes that turn `self` into `new`
    pub async fn diff(&self, new: &Mst<S>) -> Result<MstDiff> {
        diff(self.storage(), Some(self.root()), new.root()).await
    }
}

/// Diff the tree at `old_root` (or nothing) against the tree at `new_root`
///
/// With no old root every node of the new tree is new and every leaf is a
/// create.
pub async fn diff<S: BlockStore + Sync + Send + 'static>(
    storage: &Arc<S>,
    old_root: Option<Cid>,
    new_root: Cid,
) -> Result<MstDiff> {
    let new_tree = Mst::load(storage.clone(), new_root);
    let new_layer = new_tree.layer().await?;
    let old_layer = match old_root {
        Some(root) => Some(Mst::load(storage.clone(), root).layer().await?),
        None => None,
    };
    let top = new_layer.max(old_layer.unwrap_or(0));

    let mut out = MstDiff::new();
    let mut old_frontier: Vec<Cid> = Vec::new();
    let mut new_frontier: Vec<Cid> = Vec::new();
    let mut old_leaves: BTreeMap<SmolStr, Cid> = BTreeMap::new();
    let mut new_leaves: BTreeMap<SmolStr, Cid> = BTreeMap::new();
    let mut removed_nodes: BTreeSet<Cid> = BTreeSet::new();

    for layer in (0..=top).rev() {
        // A shorter tree's root joins the walk at its own layer
        if layer == new_layer {
            new_frontier.push(new_root);
        }
        if let (Some(root), Some(root_layer)) = (old_root, old_layer) {
            if root_layer == layer {
                old_frontier.push(root);
            }
        }

        let old_set: BTreeSet<Cid> = old_frontier.iter().copied().collect();
        let shared: BTreeSet<Cid> = new_frontier
            .iter()
            .copied()
            .filter(|cid| old_set.contains(cid))
            .collect();

        let mut next_new = Vec::new();
        for cid in new_frontier.drain(..) {
            if shared.contains(&cid) {
                continue;
            }
            let bytes = new_tree.node_bytes(&cid).await?;
            for entry in parse_node(&bytes, Some(layer))? {
                match entry {
                    NodeEntry::Leaf { key, value } => {
                        new_leaves.insert(key, value);
                    }
                    NodeEntry::Tree(child) => next_new.push(child),
                }
            }
            out.new_mst_blocks.insert(cid, bytes);
        }

        let mut next_old = Vec::new();
        for cid in old_frontier.drain(..) {
            if shared.contains(&cid) {
                continue;
            }
            let bytes = new_tree.node_bytes(&cid).await?;
            for entry in parse_node(&bytes, Some(layer))? {
                match entry {
                    NodeEntry::Leaf { key, value } => {
                        old_leaves.insert(key, value);
                    }
                    NodeEntry::Tree(child) => next_old.push(child),
                }
            }
            removed_nodes.insert(cid);
        }

        tracing::trace!(
            layer,
            shared = shared.len(),
            next_new = next_new.len(),
            next_old = next_old.len(),
            "diff layer"
        );
        new_frontier = next_new;
        old_frontier = next_old;
    }

    // A key's layer is fixed, so a key that moved into a rebuilt node shows up
    // on both sides with the same value and produces no operation.
    for (key, new_cid) in &new_leaves {
        match old_leaves.get(key) {
            None => {
                out.creates.push((key.clone(), *new_cid));
                out.new_leaf_cids.push(*new_cid);
            }
            Some(old_cid) if old_cid != new_cid => {
                out.updates.push((key.clone(), *new_cid, *old_cid));
                out.new_leaf_cids.push(*new_cid);
                out.removed_cids.push(*old_cid);
            }
            Some(_) => {}
        }
    }
    for (key, old_cid) in &old_leaves {
        if !new_leaves.contains_key(key) {
            out.deletes.push((key.clone(), *old_cid));
            out.removed_cids.push(*old_cid);
        }
    }
    out.new_leaf_cids.sort();
    out.new_leaf_cids.dedup();
    out.removed_cids.sort();
    out.removed_cids.dedup();
    out.removed_mst_blocks = removed_nodes
        .into_iter()
        .filter(|cid| !out.new_mst_blocks.contains_key(cid))
        .collect();

    tracing::debug!(
        creates = out.creates.len(),
        updates = out.updates.len(),
        deletes = out.deletes.len(),
        new_nodes = out.new_mst_blocks.len(),
        removed_nodes = out.removed_mst_blocks.len(),
        "computed MST diff"
    );
    Ok(out)
}

/// The minimal block set that takes a holder of `old_root` to `new_root`
///
/// New MST nodes plus the blocks of newly referenced records. Unchanged
/// subtrees contribute nothing.
pub async fn collect_changed_blocks<S: BlockStore + Sync + Send + 'static>(
    storage: &Arc<S>,
    old_root: Option<Cid>,
    new_root: Cid,
) -> Result<BTreeMap<Cid, Bytes>> {
    let diff = diff(storage, old_root, new_root).await?;
    let mut blocks = diff.fetch_new_blocks(storage.as_ref()).await?;
    blocks.extend(diff.new_mst_blocks);
    Ok(blocks)
}
