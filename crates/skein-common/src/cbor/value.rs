use crate::types::cid::Cid;
use bytes::Bytes;
use smol_str::SmolStr;
use std::cmp::Ordering;

/// A value in the DAG-CBOR data model as used by atproto.
///
/// Floats, undefined, and tags other than the CID link tag are outside the
/// supported subset and cannot be represented.
///
/// Maps keep their entries in the order they were built or decoded in; the
/// encoder sorts them canonically on the way out. Equality on maps ignores
/// entry order, so a decoded map compares equal to the map it was encoded
/// from regardless of how it was originally built.
#[derive(Debug, Clone)]
pub enum DagCborValue {
    /// CBOR `null`
    Null,
    /// CBOR `true` / `false`
    Bool(bool),
    /// Major type 0
    UnsignedInt(u64),
    /// Major type 1. Always negative; non-negative integers are `UnsignedInt`.
    NegativeInt(i64),
    /// UTF-8 text string
    Text(SmolStr),
    /// Byte string
    Bytes(Bytes),
    /// Array
    Array(Vec<DagCborValue>),
    /// Map with text keys
    Map(Vec<(SmolStr, DagCborValue)>),
    /// CID link (tag 42)
    Link(Cid),
}

/// Canonical DAG-CBOR key order: shorter keys first, then bytewise.
pub fn canonical_key_order(a: &str, b: &str) -> Ordering {
    a.len()
        .cmp(&b.len())
        .then_with(|| a.as_bytes().cmp(b.as_bytes()))
}

impl DagCborValue {
    /// Build a map from key/value pairs
    pub fn map<K: Into<SmolStr>>(entries: impl IntoIterator<Item = (K, DagCborValue)>) -> Self {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Build an integer value, choosing the major type from the sign
    pub fn integer(value: i64) -> Self {
        if value < 0 {
            Self::NegativeInt(value)
        } else {
            Self::UnsignedInt(value as u64)
        }
    }

    /// Look up a key if this is a map
    pub fn get(&self, key: &str) -> Option<&DagCborValue> {
        match self {
            Self::Map(entries) => entries
                .iter()
                .find(|(k, _)| k.as_str() == key)
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// Borrow as text
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Unsigned integer value
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::UnsignedInt(n) => Some(*n),
            _ => None,
        }
    }

    /// Integer value of either sign, if it fits in an `i64`
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::UnsignedInt(n) => i64::try_from(*n).ok(),
            Self::NegativeInt(n) => Some(*n),
            _ => None,
        }
    }

    /// Boolean value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Byte string contents
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Linked CID
    pub fn as_link(&self) -> Option<&Cid> {
        match self {
            Self::Link(cid) => Some(cid),
            _ => None,
        }
    }

    /// Array items
    pub fn as_array(&self) -> Option<&[DagCborValue]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Map entries, in stored order
    pub fn as_map(&self) -> Option<&[(SmolStr, DagCborValue)]> {
        match self {
            Self::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Whether this is `null`
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Short name of the variant, for error messages
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::UnsignedInt(_) => "unsigned int",
            Self::NegativeInt(_) => "negative int",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Array(_) => "array",
            Self::Map(_) => "map",
            Self::Link(_) => "link",
        }
    }
}

impl PartialEq for DagCborValue {
    fn eq(&self, other: &Self) -> bool {
        use DagCborValue::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (UnsignedInt(a), UnsignedInt(b)) => a == b,
            (NegativeInt(a), NegativeInt(b)) => a == b,
            (Text(a), Text(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (Array(a), Array(b)) => a == b,
            (Link(a), Link(b)) => a == b,
            (Map(a), Map(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(key, value)| {
                        b.iter()
                            .find(|(k, _)| k == key)
                            .is_some_and(|(_, v)| v == value)
                    })
            }
            _ => false,
        }
    }
}

impl Eq for DagCborValue {}

impl From<bool> for DagCborValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<u64> for DagCborValue {
    fn from(value: u64) -> Self {
        Self::UnsignedInt(value)
    }
}

impl From<i64> for DagCborValue {
    fn from(value: i64) -> Self {
        Self::integer(value)
    }
}

impl From<&str> for DagCborValue {
    fn from(value: &str) -> Self {
        Self::Text(SmolStr::new(value))
    }
}

impl From<String> for DagCborValue {
    fn from(value: String) -> Self {
        Self::Text(SmolStr::from(value))
    }
}

impl From<SmolStr> for DagCborValue {
    fn from(value: SmolStr) -> Self {
        Self::Text(value)
    }
}

impl From<Bytes> for DagCborValue {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<Cid> for DagCborValue {
    fn from(value: Cid) -> Self {
        Self::Link(value)
    }
}

impl From<Option<Cid>> for DagCborValue {
    fn from(value: Option<Cid>) -> Self {
        value.map_or(Self::Null, Self::Link)
    }
}

impl From<Vec<DagCborValue>> for DagCborValue {
    fn from(value: Vec<DagCborValue>) -> Self {
        Self::Array(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_key_order() {
        let mut keys = vec!["version", "did", "sig", "data", "rev", "prev", "a", "bb", "ab"];
        keys.sort_by(|a, b| canonical_key_order(a, b));
        assert_eq!(
            keys,
            vec!["a", "ab", "bb", "did", "rev", "sig", "data", "prev", "version"]
        );
    }

    #[test]
    fn test_map_equality_ignores_order() {
        let a = DagCborValue::map([("x", 1u64.into()), ("y", "two".into())]);
        let b = DagCborValue::map([("y", "two".into()), ("x", 1u64.into())]);
        let c = DagCborValue::map([("y", "two".into()), ("x", 2u64.into())]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_integer_sign() {
        assert_eq!(DagCborValue::integer(5), DagCborValue::UnsignedInt(5));
        assert_eq!(DagCborValue::integer(-1), DagCborValue::NegativeInt(-1));
        assert_eq!(DagCborValue::integer(-1).as_i64(), Some(-1));
        assert_eq!(DagCborValue::UnsignedInt(u64::MAX).as_i64(), None);
    }

    #[test]
    fn test_accessors() {
        let v = DagCborValue::map([("text", "hello".into()), ("n", 3u64.into())]);
        assert_eq!(v.get("text").and_then(|t| t.as_str()), Some("hello"));
        assert_eq!(v.get("n").and_then(|n| n.as_u64()), Some(3));
        assert!(v.get("missing").is_none());
        assert!(DagCborValue::Null.get("text").is_none());
    }
}
