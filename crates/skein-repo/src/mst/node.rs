//! MST node data structures

use std::fmt;

use bytes::Bytes;
use skein_common::Cid;
use skein_common::cbor::{self, DagCborValue};
use smol_str::SmolStr;

use super::util;
use crate::error::{MstError, Result};

/// Entry in an expanded MST node: either a subtree link or a leaf
///
/// Tree operations work on a flat `Vec<NodeEntry>` with entries interleaved
/// in key order, e.g. `[Tree, Leaf, Tree, Leaf, Leaf, Tree]`. Keys are held in
/// full; the wire form in [`NodeData`] is prefix-compressed.
#[derive(Clone, PartialEq, Eq)]
pub enum NodeEntry {
    /// Link to the subtree holding the keys between the neighbouring leaves
    Tree(Cid),

    /// Key and the CID of its record
    Leaf {
        /// Full key
        key: SmolStr,
        /// CID of the record value
        value: Cid,
    },
}

impl fmt::Debug for NodeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeEntry::Tree(cid) => write!(f, "Tree({})", cid),
            NodeEntry::Leaf { key, value } => write!(f, "Leaf {{ key: {}, value: {} }}", key, value),
        }
    }
}

impl NodeEntry {
    /// Check if this is a tree entry
    pub fn is_tree(&self) -> bool {
        matches!(self, NodeEntry::Tree(_))
    }

    /// Check if this is a leaf entry
    pub fn is_leaf(&self) -> bool {
        matches!(self, NodeEntry::Leaf { .. })
    }

    /// Get the key if this is a leaf
    pub fn leaf_key(&self) -> Option<&str> {
        match self {
            NodeEntry::Leaf { key, .. } => Some(key.as_str()),
            NodeEntry::Tree(_) => None,
        }
    }

    /// Get the subtree CID if this is a tree
    pub fn tree(&self) -> Option<&Cid> {
        match self {
            NodeEntry::Tree(cid) => Some(cid),
            NodeEntry::Leaf { .. } => None,
        }
    }
}

/// Wire format entry: prefix-compressed key, value, and right subtree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Bytes shared with the previous key in the node
    pub prefix_len: usize,
    /// Rest of the key after the shared prefix
    pub key_suffix: Bytes,
    /// Subtree holding keys between this entry and the next
    pub tree: Option<Cid>,
    /// CID of the record value
    pub value: Cid,
}

/// Wire format node: `{"l": Cid|null, "e": [{"p", "k", "t", "v"}]}`
///
/// Absent links are written as explicit `null`; skipping them would change
/// the bytes and therefore the CID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    /// Left-most subtree
    pub left: Option<Cid>,
    /// Entries, sorted by full key
    pub entries: Vec<TreeEntry>,
}

impl NodeData {
    /// The node with no entries and no left link
    pub fn empty() -> Self {
        Self {
            left: None,
            entries: Vec::new(),
        }
    }

    /// As a DAG-CBOR value
    pub fn to_value(&self) -> DagCborValue {
        let entries = self
            .entries
            .iter()
            .map(|e| {
                DagCborValue::map([
                    ("k", DagCborValue::Bytes(e.key_suffix.clone())),
                    ("p", (e.prefix_len as u64).into()),
                    ("t", e.tree.into()),
                    ("v", e.value.into()),
                ])
            })
            .collect();
        DagCborValue::map([("e", DagCborValue::Array(entries)), ("l", self.left.into())])
    }

    /// Canonical DAG-CBOR bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        cbor::encode(&self.to_value())
    }

    /// Parse the wire shape; does not check key ordering or layers
    pub fn from_value(value: &DagCborValue) -> Result<Self> {
        let left = optional_link(value.get("l"), "l")?;
        let raw_entries = value
            .get("e")
            .and_then(DagCborValue::as_array)
            .ok_or_else(|| MstError::InvalidNode("missing entry list".into()))?;

        let mut entries = Vec::with_capacity(raw_entries.len());
        for raw in raw_entries {
            let prefix_len = raw
                .get("p")
                .and_then(DagCborValue::as_u64)
                .ok_or_else(|| MstError::InvalidNode("entry missing prefix length".into()))?;
            let key_suffix = raw
                .get("k")
                .and_then(DagCborValue::as_bytes)
                .cloned()
                .ok_or_else(|| MstError::InvalidNode("entry missing key suffix".into()))?;
            let tree = optional_link(raw.get("t"), "t")?;
            let value = raw
                .get("v")
                .and_then(DagCborValue::as_link)
                .copied()
                .ok_or_else(|| MstError::InvalidNode("entry missing value link".into()))?;
            entries.push(TreeEntry {
                prefix_len: prefix_len as usize,
                key_suffix,
                tree,
                value,
            });
        }

        Ok(Self { left, entries })
    }

    /// Decode from DAG-CBOR bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let value = cbor::decode(bytes).map_err(|e| MstError::InvalidNode(e.to_string()))?;
        Self::from_value(&value)
    }

    /// Compress expanded entries into the wire form
    ///
    /// Prefixes are computed against the immediately preceding leaf, so an
    /// insertion never leaves a stale prefix behind.
    pub fn from_entries(entries: &[NodeEntry]) -> Result<Self> {
        let mut data = Self::empty();
        let mut iter = entries.iter().peekable();

        if let Some(NodeEntry::Tree(cid)) = iter.peek() {
            data.left = Some(*cid);
            iter.next();
        }

        let mut last_key: &str = "";
        while let Some(entry) = iter.next() {
            let NodeEntry::Leaf { key, value } = entry else {
                return Err(MstError::TreeInvariantViolation(
                    "two adjacent subtrees in one node".into(),
                )
                .into());
            };
            let tree = match iter.peek() {
                Some(NodeEntry::Tree(cid)) => {
                    let cid = *cid;
                    iter.next();
                    Some(cid)
                }
                _ => None,
            };
            let prefix_len = util::common_prefix_len(last_key, key);
            data.entries.push(TreeEntry {
                prefix_len,
                key_suffix: Bytes::copy_from_slice(&key.as_bytes()[prefix_len..]),
                tree,
                value: *value,
            });
            last_key = key.as_str();
        }

        Ok(data)
    }

    /// Expand into the flat entry list, rebuilding full keys
    pub fn to_entries(&self) -> Result<Vec<NodeEntry>> {
        let mut entries = Vec::with_capacity(self.entries.len() * 2 + 1);
        if let Some(left) = self.left {
            entries.push(NodeEntry::Tree(left));
        }

        let mut last_key: Vec<u8> = Vec::new();
        for (i, e) in self.entries.iter().enumerate() {
            if i == 0 && e.prefix_len != 0 {
                return Err(MstError::InvalidNode("first entry has a non-zero prefix".into()).into());
            }
            if e.prefix_len > last_key.len() {
                return Err(MstError::InvalidNode(format!(
                    "prefix length {} exceeds previous key length {}",
                    e.prefix_len,
                    last_key.len()
                ))
                .into());
            }
            let mut full = last_key[..e.prefix_len].to_vec();
            full.extend_from_slice(&e.key_suffix);
            let key = String::from_utf8(full)
                .map_err(|_| MstError::InvalidNode("key is not valid UTF-8".into()))?;
            util::validate_key(&key)?;

            last_key = key.as_bytes().to_vec();
            entries.push(NodeEntry::Leaf {
                key: SmolStr::new(&key),
                value: e.value,
            });
            if let Some(tree) = e.tree {
                entries.push(NodeEntry::Tree(tree));
            }
        }

        Ok(entries)
    }
}

fn optional_link(value: Option<&DagCborValue>, field: &str) -> Result<Option<Cid>> {
    match value {
        Some(DagCborValue::Null) => Ok(None),
        Some(DagCborValue::Link(cid)) => Ok(Some(*cid)),
        Some(other) => Err(MstError::InvalidNode(format!(
            "field {} should be a link or null, found {}",
            field,
            other.kind_name()
        ))
        .into()),
        None => Err(MstError::InvalidNode(format!("missing field {}", field)).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(n: u8) -> Cid {
        Cid::for_raw_bytes(&[n])
    }

    #[test]
    fn empty_node_bytes() {
        assert_eq!(hex::encode(NodeData::empty().to_bytes()), "a2616580616cf6");
    }

    #[test]
    fn prefix_compression_roundtrip() {
        let entries = vec![
            NodeEntry::Tree(cid(0)),
            NodeEntry::Leaf {
                key: "com.example/aaa".into(),
                value: cid(1),
            },
            NodeEntry::Leaf {
                key: "com.example/abc".into(),
                value: cid(2),
            },
            NodeEntry::Tree(cid(3)),
            NodeEntry::Leaf {
                key: "com.other/x".into(),
                value: cid(4),
            },
        ];
        let data = NodeData::from_entries(&entries).unwrap();
        assert_eq!(data.left, Some(cid(0)));
        assert_eq!(data.entries[0].prefix_len, 0);
        assert_eq!(data.entries[1].prefix_len, 13);
        assert_eq!(&data.entries[1].key_suffix[..], b"bc");
        assert_eq!(data.entries[1].tree, Some(cid(3)));
        assert_eq!(data.entries[2].prefix_len, 4);

        let back = NodeData::from_bytes(&data.to_bytes()).unwrap();
        assert_eq!(back, data);
        assert_eq!(back.to_entries().unwrap(), entries);
    }

    #[test]
    fn adjacent_trees_rejected() {
        let entries = vec![NodeEntry::Tree(cid(0)), NodeEntry::Tree(cid(1))];
        assert!(NodeData::from_entries(&entries).is_err());
    }

    #[test]
    fn bad_prefix_rejected() {
        let data = NodeData {
            left: None,
            entries: vec![TreeEntry {
                prefix_len: 3,
                key_suffix: Bytes::from_static(b"abc"),
                tree: None,
                value: cid(1),
            }],
        };
        assert!(data.to_entries().is_err());

        let data = NodeData {
            left: None,
            entries: vec![
                TreeEntry {
                    prefix_len: 0,
                    key_suffix: Bytes::from_static(b"ab"),
                    tree: None,
                    value: cid(1),
                },
                TreeEntry {
                    prefix_len: 5,
                    key_suffix: Bytes::from_static(b"c"),
                    tree: None,
                    value: cid(2),
                },
            ],
        };
        assert!(data.to_entries().is_err());
    }

    #[test]
    fn missing_fields_rejected() {
        let value = DagCborValue::map([("e", DagCborValue::Array(vec![]))]);
        assert!(NodeData::from_value(&value).is_err());
        let value = DagCborValue::map([("l", DagCborValue::Null), ("e", "nope".into())]);
        assert!(NodeData::from_value(&value).is_err());
    }
}
