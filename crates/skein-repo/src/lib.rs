//! AT Protocol repository storage
//!
//! This crate provides the building blocks of an atproto repository:
//!
//! - **MST (Merkle Search Tree)**: Immutable tree operations with deterministic structure
//! - **Commits**: Signed commit objects (versions 2 and 3) with signature verification
//! - **CAR I/O**: Length-prefixed block framing for repository export and import
//! - **Diffs**: Minimal changed-block sets and firehose commit events
//! - **Storage**: Pluggable block storage with in-memory, layered and file-backed implementations
//!
//! Encoding primitives (varints, DAG-CBOR, CIDs, TIDs) live in `skein-common`.
//!
//! # Example
//!
//! ```rust,ignore
//! use skein_repo::{Mst, MemoryBlockStore};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = Arc::new(MemoryBlockStore::new());
//! let mst = Mst::new(storage);
//!
//! let cid = /* ... */;
//! let new_mst = mst.add("app.bsky.feed.post/abc123", cid).await?;
//!
//! if let Some(value) = new_mst.get("app.bsky.feed.post/abc123").await? {
//!     println!("Found: {}", value);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

/// Repository block framing (CAR v1)
pub mod car;
/// Commit structures, signing and firehose events
pub mod commit;
pub mod config;
pub mod error;
/// Merkle Search Tree implementation
pub mod mst;
/// High-level repository operations
pub mod repo;
/// Block storage abstraction
pub mod storage;

pub use commit::firehose::{FirehoseCommit, RepoAction, RepoOp};
pub use commit::{Commit, FnSigner, SigningKey};
pub use config::RepoConfig;
pub use error::{RepoError, RepoErrorKind, Result};
pub use mst::{Mst, MstDiff, VerifiedWriteOp, WriteOp};
pub use repo::{CommitData, RecordWrite, Repository};
pub use storage::{BlockStore, FileBlockStore, LayeredBlockStore, MemoryBlockStore};
