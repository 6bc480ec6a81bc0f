//! MST utility functions

use crate::error::{MstError, Result};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use skein_common::Cid;
use std::sync::LazyLock;

/// Longest key accepted, in bytes
pub const MAX_KEY_LEN: usize = 256;

/// Canonical bytes of the node with no entries: `{"e": [], "l": null}`
pub const EMPTY_NODE_BYTES: &[u8] = &[0xa2, 0x61, 0x65, 0x80, 0x61, 0x6c, 0xf6];

static EMPTY_NODE_CID: LazyLock<Cid> = LazyLock::new(|| Cid::for_dag_cbor_bytes(EMPTY_NODE_BYTES));

/// CID of the empty node
pub fn empty_node_cid() -> Cid {
    *EMPTY_NODE_CID
}

/// The empty node block
pub fn empty_node_block() -> (Cid, Bytes) {
    (empty_node_cid(), Bytes::from_static(EMPTY_NODE_BYTES))
}

/// Layer a key lives on: `leading_zero_bits(sha256(key)) / 2`
///
/// Counting two bits at a time gives an expected fanout of 4. Layer 0 is
/// the leaf level; higher layers sit closer to the root.
pub fn layer_for_key(key: &str) -> usize {
    let hash = Sha256::digest(key.as_bytes());
    leading_zeros(&hash) / 2
}

fn leading_zeros(hash: &[u8]) -> usize {
    let mut count = 0;
    for byte in hash {
        if *byte == 0 {
            count += 8;
        } else {
            count += byte.leading_zeros() as usize;
            break;
        }
    }
    count
}

/// Validate MST key format
///
/// Keys must match `[a-zA-Z0-9._:~/-]+` and be at most 256 bytes.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(MstError::EmptyKey.into());
    }

    if key.len() > MAX_KEY_LEN {
        return Err(MstError::KeyTooLong {
            len: key.len(),
            max: MAX_KEY_LEN,
        }
        .into());
    }

    if !key
        .bytes()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, b'.' | b'_' | b':' | b'~' | b'-' | b'/'))
    {
        return Err(MstError::InvalidKeyChars {
            key: key.to_string(),
        }
        .into());
    }

    Ok(())
}

/// Count shared prefix length between two keys, in bytes
pub fn common_prefix_len(a: &str, b: &str) -> usize {
    a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}
