//! Common types for the skein implementation of the atproto repository format
//!
//! Everything here is synchronous and storage-agnostic: the varint and DAG-CBOR
//! codecs, content identifiers, and the string types (DIDs, TIDs) that commits
//! carry. The tree, commit and block framing layers live in `skein-repo`.

#![warn(missing_docs)]
pub use bytes;
pub use smol_str;

/// DAG-CBOR value model, canonical encoder, strict decoder and JSON interop.
pub mod cbor;
/// Baseline fundamental AT Protocol data types.
pub mod types;
pub mod varint;

pub use cbor::DagCborValue;
pub use types::cid::Cid;
pub use types::did::Did;
pub use types::tid::{Tid, TidGenerator};
