use super::value::{DagCborValue, canonical_key_order};

pub(crate) const MAJOR_UNSIGNED: u8 = 0;
pub(crate) const MAJOR_NEGATIVE: u8 = 1;
pub(crate) const MAJOR_BYTES: u8 = 2;
pub(crate) const MAJOR_TEXT: u8 = 3;
pub(crate) const MAJOR_ARRAY: u8 = 4;
pub(crate) const MAJOR_MAP: u8 = 5;
pub(crate) const MAJOR_TAG: u8 = 6;
pub(crate) const MAJOR_SIMPLE: u8 = 7;

/// Tag number for CID links
pub const CID_TAG: u64 = 42;

pub(crate) const FALSE: u8 = 0xF4;
pub(crate) const TRUE: u8 = 0xF5;
pub(crate) const NULL: u8 = 0xF6;

/// Encode a value as canonical DAG-CBOR
pub fn encode(value: &DagCborValue) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

/// Append the canonical DAG-CBOR encoding of a value to `out`.
///
/// Map keys are written in canonical order whatever order the map holds
/// them in. Maps must not contain duplicate keys.
pub fn encode_into(value: &DagCborValue, out: &mut Vec<u8>) {
    match value {
        DagCborValue::Null => out.push(NULL),
        DagCborValue::Bool(false) => out.push(FALSE),
        DagCborValue::Bool(true) => out.push(TRUE),
        DagCborValue::UnsignedInt(n) => write_head(out, MAJOR_UNSIGNED, *n),
        DagCborValue::NegativeInt(n) => {
            if *n < 0 {
                // argument is -1 - n, which is the bitwise complement
                write_head(out, MAJOR_NEGATIVE, !*n as u64);
            } else {
                write_head(out, MAJOR_UNSIGNED, *n as u64);
            }
        }
        DagCborValue::Text(s) => {
            write_head(out, MAJOR_TEXT, s.len() as u64);
            out.extend_from_slice(s.as_bytes());
        }
        DagCborValue::Bytes(b) => {
            write_head(out, MAJOR_BYTES, b.len() as u64);
            out.extend_from_slice(b);
        }
        DagCborValue::Array(items) => {
            write_head(out, MAJOR_ARRAY, items.len() as u64);
            for item in items {
                encode_into(item, out);
            }
        }
        DagCborValue::Map(entries) => {
            let mut sorted: Vec<_> = entries.iter().collect();
            sorted.sort_by(|a, b| canonical_key_order(&a.0, &b.0));

            write_head(out, MAJOR_MAP, sorted.len() as u64);
            for (key, value) in sorted {
                write_head(out, MAJOR_TEXT, key.len() as u64);
                out.extend_from_slice(key.as_bytes());
                encode_into(value, out);
            }
        }
        DagCborValue::Link(cid) => {
            write_head(out, MAJOR_TAG, CID_TAG);
            let bytes = cid.as_bytes();
            write_head(out, MAJOR_BYTES, bytes.len() as u64 + 1);
            out.push(0x00);
            out.extend_from_slice(bytes);
        }
    }
}

/// Write a type/argument head using the shortest form
pub(crate) fn write_head(out: &mut Vec<u8>, major: u8, arg: u64) {
    let major = major << 5;
    if arg < 24 {
        out.push(major | arg as u8);
    } else if arg <= u8::MAX as u64 {
        out.push(major | 24);
        out.push(arg as u8);
    } else if arg <= u16::MAX as u64 {
        out.push(major | 25);
        out.extend_from_slice(&(arg as u16).to_be_bytes());
    } else if arg <= u32::MAX as u64 {
        out.push(major | 26);
        out.extend_from_slice(&(arg as u32).to_be_bytes());
    } else {
        out.push(major | 27);
        out.extend_from_slice(&arg.to_be_bytes());
    }
}
