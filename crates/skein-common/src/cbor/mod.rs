//! DAG-CBOR: the canonical CBOR subset every atproto block is written in.
//!
//! Supported: unsigned and negative integers, byte and text strings, arrays,
//! maps with text keys, `true`/`false`/`null`, and CID links as tag 42.
//! Encoding is canonical (shortest heads, map keys sorted by length then
//! bytes), which is what makes content addressing reproducible.
//!
//! ```
//! use skein_common::cbor::{self, DagCborValue};
//!
//! let record = DagCborValue::map([
//!     ("text", "hello".into()),
//!     ("$type", "app.bsky.feed.post".into()),
//! ]);
//! let bytes = cbor::encode(&record);
//! assert_eq!(cbor::decode(&bytes).unwrap(), record);
//! ```

mod decode;
mod encode;
pub mod json;
mod value;

pub use decode::{Decoder, decode, decode_prefix};
pub use encode::{CID_TAG, encode, encode_into};
pub use json::{from_json, to_json};
pub use value::{DagCborValue, canonical_key_order};

use smol_str::SmolStr;

/// Deepest nesting of arrays and maps the decoder will follow
pub const MAX_NESTING: usize = 128;

/// Errors from decoding DAG-CBOR or converting it from JSON
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum CborError {
    /// Input ended before a value was complete
    #[error("input ended before the value was complete")]
    #[diagnostic(code(skein::cbor::truncated))]
    TruncatedStream,

    /// A byte pattern outside the supported subset (floats, tags other than 42, ...)
    #[error("unsupported CBOR type: {0}")]
    #[diagnostic(
        code(skein::cbor::unsupported_type),
        help("DAG-CBOR excludes floats in atproto, undefined, and every tag except 42")
    )]
    UnsupportedCborType(String),

    /// Reserved or indefinite-length additional info
    #[error("invalid additional info {info} for major type {major}")]
    #[diagnostic(
        code(skein::cbor::invalid_additional_info),
        help("indefinite-length items are not allowed in DAG-CBOR")
    )]
    InvalidAdditionalInfo {
        /// Major type of the offending head
        major: u8,
        /// Low five bits of the head
        info: u8,
    },

    /// Text string that is not UTF-8
    #[error("text string is not valid UTF-8")]
    #[diagnostic(code(skein::cbor::invalid_utf8))]
    InvalidUtf8,

    /// Malformed tag-42 payload
    #[error("invalid CID link: {0}")]
    #[diagnostic(code(skein::cbor::invalid_link))]
    InvalidCidLink(String),

    /// Map key that is not a text string
    #[error("map keys must be text strings")]
    #[diagnostic(code(skein::cbor::non_string_key))]
    NonStringMapKey,

    /// Map key seen twice
    #[error("duplicate map key: {0}")]
    #[diagnostic(code(skein::cbor::duplicate_key))]
    DuplicateMapKey(SmolStr),

    /// Negative integer below `i64::MIN`
    #[error("integer out of range")]
    #[diagnostic(code(skein::cbor::integer_range))]
    IntegerOutOfRange,

    /// Arrays and maps nested past [`MAX_NESTING`]
    #[error("values nested deeper than {0} levels")]
    #[diagnostic(code(skein::cbor::too_deep))]
    NestingTooDeep(usize),

    /// Bytes left over after a complete value
    #[error("{0} trailing bytes after value")]
    #[diagnostic(code(skein::cbor::trailing))]
    TrailingBytes(usize),

    /// JSON with no DAG-CBOR equivalent
    #[error("cannot convert JSON: {0}")]
    #[diagnostic(code(skein::cbor::json))]
    InvalidJson(String),

    /// Underlying reader failed
    #[error("I/O error while decoding")]
    #[diagnostic(code(skein::cbor::io))]
    Io(#[source] std::io::Error),
}
