//! Content identifiers (CIDv1)
//!
//! A [`Cid`] keeps the exact bytes it was parsed from or built with.
//! Equality, ordering, hashing and the text form all work from those bytes,
//! so a CID written by another implementation with non-minimal varints
//! survives a parse/print round trip unchanged.

use crate::cbor::{self, DagCborValue};
use crate::varint::{self, VarIntError};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Multicodec for DAG-CBOR blocks
pub const DAG_CBOR: u64 = 0x71;
/// Multicodec for raw bytes (blobs)
pub const RAW: u64 = 0x55;
/// Multihash code for SHA2-256
pub const SHA2_256: u64 = 0x12;

/// Base used for the text form of CIDs in atproto
pub const ATP_CID_BASE: multibase::Base = multibase::Base::Base32Lower;

/// Largest binary CID accepted
pub const MAX_CID_LEN: usize = 96;

/// Errors from parsing a CID
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum CidError {
    /// CIDv0 or a version other than 1
    #[error("unsupported CID version {0}")]
    #[diagnostic(
        code(skein::cid::version),
        help("only CIDv1 is used in atproto repositories")
    )]
    CidVersionUnsupported(u64),

    /// Codec other than dag-cbor or raw
    #[error("unsupported multicodec 0x{0:x}")]
    #[diagnostic(
        code(skein::cid::multicodec),
        help("atproto CIDs use dag-cbor (0x71) or raw (0x55)")
    )]
    UnsupportedMulticodec(u64),

    /// Multihash other than a 32-byte sha2-256 digest
    #[error("unsupported multihash 0x{code:x} with {size}-byte digest")]
    #[diagnostic(
        code(skein::cid::multihash),
        help("atproto CIDs hash with sha2-256 (0x12) and a 32-byte digest")
    )]
    UnsupportedMultihash {
        /// Multihash function code
        code: u64,
        /// Declared digest size
        size: u64,
    },

    /// Not enough bytes for the declared digest
    #[error("CID truncated: digest needs {expected} bytes, {actual} available")]
    #[diagnostic(code(skein::cid::truncated))]
    Truncated {
        /// Declared digest size
        expected: usize,
        /// Bytes actually present
        actual: usize,
    },

    /// Bytes left after the digest when an exact CID was expected
    #[error("{0} unexpected bytes after CID")]
    #[diagnostic(code(skein::cid::trailing))]
    TrailingBytes(usize),

    /// Longer than [`MAX_CID_LEN`]
    #[error("CID is {0} bytes, longer than supported")]
    #[diagnostic(code(skein::cid::too_long))]
    TooLong(usize),

    /// Bad varint in the CID prefix
    #[error("malformed CID prefix")]
    #[diagnostic(code(skein::cid::varint))]
    Varint(#[from] VarIntError),

    /// Text form not in base32 lowercase
    #[error("unsupported multibase prefix {0:?}")]
    #[diagnostic(
        code(skein::cid::multibase),
        help("atproto CIDs are written in base32 lowercase, starting with 'b'")
    )]
    UnsupportedMultibase(char),

    /// Text form that does not decode
    #[error("invalid multibase string: {0}")]
    #[diagnostic(code(skein::cid::invalid_text))]
    InvalidMultibase(String),
}

/// A CIDv1 content identifier
#[derive(Clone, Copy)]
pub struct Cid {
    bytes: [u8; MAX_CID_LEN],
    len: u8,
    codec: u64,
    hash_code: u64,
    digest_offset: u8,
}

impl Cid {
    /// CID of a DAG-CBOR value: canonical encoding, SHA-256, codec 0x71
    pub fn for_dag_cbor(value: &DagCborValue) -> Self {
        Self::for_dag_cbor_bytes(&cbor::encode(value))
    }

    /// CID of bytes that are already canonical DAG-CBOR
    pub fn for_dag_cbor_bytes(bytes: &[u8]) -> Self {
        Self::new_v1(DAG_CBOR, &Sha256::digest(bytes).into())
    }

    /// CID of a raw byte blob, codec 0x55
    pub fn for_raw_bytes(bytes: &[u8]) -> Self {
        Self::new_v1(RAW, &Sha256::digest(bytes).into())
    }

    /// Build a CIDv1 from a codec and a SHA-256 digest
    pub fn new_v1(codec: u64, digest: &[u8; 32]) -> Self {
        let mut buf = Vec::with_capacity(4 + digest.len());
        varint::encode_varint(1, &mut buf);
        varint::encode_varint(codec, &mut buf);
        varint::encode_varint(SHA2_256, &mut buf);
        varint::encode_varint(digest.len() as u64, &mut buf);
        let digest_offset = buf.len();
        buf.extend_from_slice(digest);

        let mut bytes = [0u8; MAX_CID_LEN];
        bytes[..buf.len()].copy_from_slice(&buf);
        Self {
            bytes,
            len: buf.len() as u8,
            codec,
            hash_code: SHA2_256,
            digest_offset: digest_offset as u8,
        }
    }

    /// Parse a CID from the front of `data`, returning it and the number of
    /// bytes consumed.
    pub fn read_bytes(data: &[u8]) -> Result<(Self, usize), CidError> {
        // CIDv0 is a bare sha2-256 multihash
        if data.len() >= 2 && data[0] == 0x12 && data[1] == 0x20 {
            return Err(CidError::CidVersionUnsupported(0));
        }

        let mut pos = 0;
        let next = |pos: &mut usize| -> Result<u64, CidError> {
            let (value, used) = varint::decode_varint(&data[*pos..])?;
            *pos += used;
            Ok(value)
        };

        let version = next(&mut pos)?;
        if version != 1 {
            return Err(CidError::CidVersionUnsupported(version));
        }
        let codec = next(&mut pos)?;
        if codec != DAG_CBOR && codec != RAW {
            return Err(CidError::UnsupportedMulticodec(codec));
        }
        let hash_code = next(&mut pos)?;
        let digest_size = next(&mut pos)?;
        if hash_code != SHA2_256 || digest_size != 32 {
            return Err(CidError::UnsupportedMultihash {
                code: hash_code,
                size: digest_size,
            });
        }
        let digest_size = digest_size as usize;

        let digest_offset = pos;
        let available = data.len() - digest_offset;
        if available < digest_size {
            return Err(CidError::Truncated {
                expected: digest_size,
                actual: available,
            });
        }
        let total = digest_offset + digest_size;
        if total > MAX_CID_LEN {
            return Err(CidError::TooLong(total));
        }

        let mut bytes = [0u8; MAX_CID_LEN];
        bytes[..total].copy_from_slice(&data[..total]);
        Ok((
            Self {
                bytes,
                len: total as u8,
                codec,
                hash_code,
                digest_offset: digest_offset as u8,
            },
            total,
        ))
    }

    /// Parse a CID that spans all of `data`
    pub fn from_bytes(data: &[u8]) -> Result<Self, CidError> {
        let (cid, used) = Self::read_bytes(data)?;
        if used != data.len() {
            return Err(CidError::TrailingBytes(data.len() - used));
        }
        Ok(cid)
    }

    /// The binary encoding, exactly as parsed or built
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Always 1
    pub fn version(&self) -> u64 {
        1
    }

    /// Content multicodec
    pub fn codec(&self) -> u64 {
        self.codec
    }

    /// Multihash function code
    pub fn hash_code(&self) -> u64 {
        self.hash_code
    }

    /// Hash digest bytes
    pub fn digest(&self) -> &[u8] {
        &self.bytes[self.digest_offset as usize..self.len as usize]
    }

    /// Text form: `b` followed by unpadded lowercase base32 of the bytes
    pub fn to_base32(&self) -> String {
        multibase::encode(ATP_CID_BASE, self.as_bytes())
    }
}

impl PartialEq for Cid {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Cid {}

impl Hash for Cid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state)
    }
}

impl PartialOrd for Cid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base32())
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self.to_base32())
    }
}

impl FromStr for Cid {
    type Err = CidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 46 && s.starts_with("Qm") {
            return Err(CidError::CidVersionUnsupported(0));
        }
        match s.chars().next() {
            Some('b') => {}
            Some(other) => return Err(CidError::UnsupportedMultibase(other)),
            None => return Err(CidError::InvalidMultibase("empty string".into())),
        }
        let (_, bytes) =
            multibase::decode(s).map_err(|e| CidError::InvalidMultibase(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for Cid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base32())
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s: std::borrow::Cow<'de, str> = Deserialize::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_NODE_CID: &str = "bafyreie5737gdxlw5i64vzichcalba3z2v5n6icifvx5xytvske7mr3hpm";

    #[test]
    fn test_empty_mst_node_cid() {
        let node = DagCborValue::map([("e", DagCborValue::Array(vec![])), ("l", DagCborValue::Null)]);
        assert_eq!(Cid::for_dag_cbor(&node).to_string(), EMPTY_NODE_CID);
    }

    #[test]
    fn test_parse_and_print_roundtrip() {
        let cid: Cid = EMPTY_NODE_CID.parse().unwrap();
        assert_eq!(cid.codec(), DAG_CBOR);
        assert_eq!(cid.hash_code(), SHA2_256);
        assert_eq!(cid.digest().len(), 32);
        assert_eq!(cid.as_bytes().len(), 36);
        assert_eq!(cid.to_string(), EMPTY_NODE_CID);
        assert_eq!(Cid::from_bytes(cid.as_bytes()).unwrap(), cid);
    }

    #[test]
    fn test_raw_codec() {
        let cid = Cid::for_raw_bytes(b"hello");
        assert_eq!(cid.codec(), RAW);
        assert_eq!(cid.as_bytes()[..4], [0x01, 0x55, 0x12, 0x20]);
        assert!(cid.to_string().starts_with("bafkrei"));
    }

    #[test]
    fn test_non_minimal_varints_survive_roundtrip() {
        let canonical = Cid::for_raw_bytes(b"data");
        // version 1 written as 0x81 0x00
        let mut odd = vec![0x81, 0x00];
        odd.extend_from_slice(&canonical.as_bytes()[1..]);

        let cid = Cid::from_bytes(&odd).unwrap();
        assert_eq!(cid.as_bytes(), &odd[..]);
        assert_eq!(cid.digest(), canonical.digest());
        assert_ne!(cid, canonical);

        let text = cid.to_string();
        let reparsed: Cid = text.parse().unwrap();
        assert_eq!(reparsed.to_string(), text);
        assert_eq!(reparsed.as_bytes(), &odd[..]);
    }

    #[test]
    fn test_cid_v0_rejected() {
        assert!(matches!(
            "QmdfTbBqBPQ7VNxZEYEj14VmRuZBkqFbiwReogJgS1zR1n".parse::<Cid>(),
            Err(CidError::CidVersionUnsupported(0))
        ));
        let mut v0 = vec![0x12, 0x20];
        v0.extend_from_slice(&[0u8; 32]);
        assert!(matches!(
            Cid::from_bytes(&v0),
            Err(CidError::CidVersionUnsupported(0))
        ));
        assert!(matches!(
            Cid::from_bytes(&[0x02, 0x71, 0x12, 0x20]),
            Err(CidError::CidVersionUnsupported(2))
        ));
    }

    #[test]
    fn test_unknown_codec_rejected() {
        // dag-pb
        let mut bytes = vec![0x01, 0x70, 0x12, 0x20];
        bytes.extend_from_slice(&[0u8; 32]);
        assert!(matches!(
            Cid::from_bytes(&bytes),
            Err(CidError::UnsupportedMulticodec(0x70))
        ));
    }

    #[test]
    fn test_other_multihashes_rejected() {
        // sha2-512
        let mut sha512 = vec![0x01, 0x71, 0x13, 0x40];
        sha512.extend_from_slice(&[0u8; 64]);
        assert!(matches!(
            Cid::from_bytes(&sha512),
            Err(CidError::UnsupportedMultihash { code: 0x13, size: 64 })
        ));

        // sha2-256 truncated to 20 bytes
        let mut short = vec![0x01, 0x55, 0x12, 0x14];
        short.extend_from_slice(&[0u8; 20]);
        assert!(matches!(
            Cid::from_bytes(&short),
            Err(CidError::UnsupportedMultihash { code: 0x12, size: 20 })
        ));

        // identity hash in text form
        let mut identity = vec![0x01, 0x55, 0x00, 0x04];
        identity.extend_from_slice(b"abcd");
        let text = multibase::encode(multibase::Base::Base32Lower, &identity);
        assert!(matches!(
            text.parse::<Cid>(),
            Err(CidError::UnsupportedMultihash { code: 0x00, size: 4 })
        ));
    }

    #[test]
    fn test_truncated_digest() {
        let cid = Cid::for_raw_bytes(b"x");
        assert!(matches!(
            Cid::from_bytes(&cid.as_bytes()[..20]),
            Err(CidError::Truncated {
                expected: 32,
                actual: 16
            })
        ));
    }

    #[test]
    fn test_read_bytes_prefix() {
        let cid = Cid::for_raw_bytes(b"x");
        let mut data = cid.as_bytes().to_vec();
        data.extend_from_slice(b"block payload");
        let (parsed, used) = Cid::read_bytes(&data).unwrap();
        assert_eq!(parsed, cid);
        assert_eq!(used, 36);
        assert!(matches!(
            Cid::from_bytes(&data),
            Err(CidError::TrailingBytes(13))
        ));
    }

    #[test]
    fn test_wrong_multibase_rejected() {
        assert!(matches!(
            "zb2rhe5P4gXftAwvA4eXQ5HJwsER2owDyS9sKaQRRVQPn93bA".parse::<Cid>(),
            Err(CidError::UnsupportedMultibase('z'))
        ));
    }

    #[test]
    fn test_determinism_and_sensitivity() {
        let a = DagCborValue::map([("text", "hello".into())]);
        let b = DagCborValue::map([("text", "hello".into())]);
        let c = DagCborValue::map([("text", "hellp".into())]);
        assert_eq!(Cid::for_dag_cbor(&a), Cid::for_dag_cbor(&b));
        assert_ne!(Cid::for_dag_cbor(&a), Cid::for_dag_cbor(&c));
    }

    #[test]
    fn test_serde_as_string() {
        let cid: Cid = EMPTY_NODE_CID.parse().unwrap();
        let json = serde_json::to_string(&cid).unwrap();
        assert_eq!(json, format!("\"{}\"", EMPTY_NODE_CID));
        let back: Cid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cid);
    }

    #[test]
    fn test_matches_cid_crate() {
        let ours = Cid::for_raw_bytes(b"interop");
        let theirs = cid::Cid::try_from(ours.to_string().as_str()).unwrap();
        assert_eq!(theirs.to_bytes(), ours.as_bytes());
        assert_eq!(theirs.codec(), RAW);
    }
}
