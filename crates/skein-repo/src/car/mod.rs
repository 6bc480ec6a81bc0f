//! Repository block framing (CAR v1)
//!
//! A repository travels as a single stream:
//!
//! ```text
//! stream := varint(headerLen) dagcbor({version: 1, roots: [commitCid]}) block*
//! block  := varint(blockLen) cidBytes data
//! ```
//!
//! The same framing carries full exports, firehose commit diffs and merkle
//! proofs. [`walk_repo`] is the one traversal primitive; everything that reads
//! a stream goes through it.
//!
//! ```ignore
//! use skein_repo::car::{CarLimits, parse_car_bytes, write_car_bytes};
//!
//! let bytes = write_car_bytes(&[commit_cid], blocks);
//! let parsed = parse_car_bytes(&bytes, &CarLimits::default())?;
//! assert_eq!(parsed.root, commit_cid);
//! ```

pub mod reader;
pub mod writer;

use serde::{Deserialize, Serialize};
use skein_common::Cid;
use skein_common::cbor::DagCborValue;

use crate::error::FramingError;

pub use reader::{
    ParsedCar, parse_car_bytes, read_car, read_car_header, walk_repo, walk_repo_async,
};
pub use writer::{AsyncCarWriter, CarWriter, write_car, write_car_bytes};

/// Default cap on the header section
pub const DEFAULT_MAX_HEADER_SIZE: usize = 1024 * 1024;

/// Default cap on a single block section (CID plus data)
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 2 * 1024 * 1024;

/// Size bounds applied to length prefixes before anything is read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[builder(start_fn = new)]
#[serde(default)]
pub struct CarLimits {
    /// Largest accepted header section, in bytes
    #[builder(default = DEFAULT_MAX_HEADER_SIZE)]
    pub max_header_size: usize,
    /// Largest accepted block section, in bytes
    #[builder(default = DEFAULT_MAX_BLOCK_SIZE)]
    pub max_block_size: usize,
}

impl Default for CarLimits {
    fn default() -> Self {
        Self {
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
        }
    }
}

/// The header section: format version and root CIDs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarHeader {
    /// Always 1
    pub version: u64,
    /// Root CIDs; a repository export carries exactly its commit CID
    pub roots: Vec<Cid>,
}

impl CarHeader {
    /// Version 1 header over the given roots
    pub fn new_v1(roots: Vec<Cid>) -> Self {
        Self { version: 1, roots }
    }

    /// First root, if any
    pub fn root(&self) -> Option<&Cid> {
        self.roots.first()
    }

    pub(crate) fn to_value(&self) -> DagCborValue {
        DagCborValue::map([
            ("version", self.version.into()),
            (
                "roots",
                DagCborValue::Array(self.roots.iter().copied().map(DagCborValue::Link).collect()),
            ),
        ])
    }

    pub(crate) fn from_value(value: &DagCborValue) -> Result<Self, FramingError> {
        let version = value
            .get("version")
            .and_then(DagCborValue::as_u64)
            .ok_or_else(|| FramingError::InvalidHeader("missing version".into()))?;
        if version != 1 {
            return Err(FramingError::InvalidHeader(format!(
                "unsupported version {}",
                version
            )));
        }
        let roots = value
            .get("roots")
            .and_then(DagCborValue::as_array)
            .ok_or_else(|| FramingError::InvalidHeader("missing roots".into()))?
            .iter()
            .map(|root| {
                root.as_link()
                    .copied()
                    .ok_or_else(|| FramingError::InvalidHeader("root is not a CID link".into()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { version, roots })
    }
}
