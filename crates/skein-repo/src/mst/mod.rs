//! Merkle Search Tree
//!
//! A deterministic, content-addressed ordered map from record paths to record
//! CIDs. Identical key sets produce identical root CIDs no matter the order
//! they were inserted in.

pub mod diff;
pub mod node;
pub mod tree;
pub mod util;

pub use diff::{MstDiff, collect_changed_blocks};
pub use node::{NodeData, NodeEntry, TreeEntry};
pub use tree::{Mst, MstBlock, VerifiedWriteOp, WriteOp};
