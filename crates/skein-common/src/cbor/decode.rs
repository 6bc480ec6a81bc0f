use super::encode::{
    CID_TAG, MAJOR_ARRAY, MAJOR_BYTES, MAJOR_MAP, MAJOR_NEGATIVE, MAJOR_SIMPLE, MAJOR_TAG,
    MAJOR_TEXT, MAJOR_UNSIGNED,
};
use super::value::DagCborValue;
use super::{CborError, MAX_NESTING};
use crate::types::cid::Cid;
use bytes::Bytes;
use smol_str::SmolStr;
use std::collections::HashSet;
use std::io::{self, Read};

/// Decode exactly one value from `bytes`, rejecting anything after it
pub fn decode(bytes: &[u8]) -> Result<DagCborValue, CborError> {
    let (value, used) = decode_prefix(bytes)?;
    if used != bytes.len() {
        return Err(CborError::TrailingBytes(bytes.len() - used));
    }
    Ok(value)
}

/// Decode one value from the front of `bytes`, returning it together with
/// the number of bytes it occupied.
///
/// Used for framed messages that concatenate several values.
pub fn decode_prefix(bytes: &[u8]) -> Result<(DagCborValue, usize), CborError> {
    let mut rest = bytes;
    let value = Decoder::new(&mut rest).read_value()?;
    Ok((value, bytes.len() - rest.len()))
}

/// Streaming decoder reading successive values from a byte source.
///
/// Declared lengths are never used to preallocate, so a hostile length
/// prefix costs at most what the stream actually delivers.
pub struct Decoder<R> {
    reader: R,
}

impl<R: Read> Decoder<R> {
    /// Wrap a reader
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Give back the underlying reader
    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Read the next value, or `None` if the stream ended cleanly between values
    pub fn next_value(&mut self) -> Result<Option<DagCborValue>, CborError> {
        let mut first = [0u8; 1];
        match self.reader.read_exact(&mut first) {
            Ok(()) => self.read_with_initial(first[0], 0).map(Some),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(CborError::Io(e)),
        }
    }

    /// Read the next value; end of stream is an error
    pub fn read_value(&mut self) -> Result<DagCborValue, CborError> {
        self.next_value()?.ok_or(CborError::TruncatedStream)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), CborError> {
        self.reader.read_exact(buf).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => CborError::TruncatedStream,
            _ => CborError::Io(e),
        })
    }

    fn read_u8(&mut self) -> Result<u8, CborError> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b)?;
        Ok(b[0])
    }

    /// Read a head's argument given the low five bits of the initial byte
    fn read_argument(&mut self, major: u8, info: u8) -> Result<u64, CborError> {
        match info {
            0..=23 => Ok(info as u64),
            24 => Ok(self.read_u8()? as u64),
            25 => {
                let mut b = [0u8; 2];
                self.read_exact(&mut b)?;
                Ok(u16::from_be_bytes(b) as u64)
            }
            26 => {
                let mut b = [0u8; 4];
                self.read_exact(&mut b)?;
                Ok(u32::from_be_bytes(b) as u64)
            }
            27 => {
                let mut b = [0u8; 8];
                self.read_exact(&mut b)?;
                Ok(u64::from_be_bytes(b))
            }
            _ => Err(CborError::InvalidAdditionalInfo { major, info }),
        }
    }

    fn read_payload(&mut self, len: u64) -> Result<Vec<u8>, CborError> {
        let mut buf = Vec::new();
        let read = (&mut self.reader)
            .take(len)
            .read_to_end(&mut buf)
            .map_err(CborError::Io)?;
        if (read as u64) < len {
            return Err(CborError::TruncatedStream);
        }
        Ok(buf)
    }

    fn read_text(&mut self, len: u64) -> Result<SmolStr, CborError> {
        let buf = self.read_payload(len)?;
        let s = String::from_utf8(buf).map_err(|_| CborError::InvalidUtf8)?;
        Ok(SmolStr::from(s))
    }

    fn read_with_initial(&mut self, initial: u8, depth: usize) -> Result<DagCborValue, CborError> {
        if depth > MAX_NESTING {
            return Err(CborError::NestingTooDeep(MAX_NESTING));
        }

        let major = initial >> 5;
        let info = initial & 0x1F;

        if major == MAJOR_SIMPLE {
            return match info {
                20 => Ok(DagCborValue::Bool(false)),
                21 => Ok(DagCborValue::Bool(true)),
                22 => Ok(DagCborValue::Null),
                25..=27 => Err(CborError::UnsupportedCborType(
                    "floating point numbers".into(),
                )),
                28..=31 => Err(CborError::InvalidAdditionalInfo { major, info }),
                _ => Err(CborError::UnsupportedCborType(format!(
                    "simple value {}",
                    info
                ))),
            };
        }

        let arg = self.read_argument(major, info)?;

        match major {
            MAJOR_UNSIGNED => Ok(DagCborValue::UnsignedInt(arg)),
            MAJOR_NEGATIVE => {
                let n = i64::try_from(arg).map_err(|_| CborError::IntegerOutOfRange)?;
                Ok(DagCborValue::NegativeInt(-1 - n))
            }
            MAJOR_BYTES => Ok(DagCborValue::Bytes(Bytes::from(self.read_payload(arg)?))),
            MAJOR_TEXT => Ok(DagCborValue::Text(self.read_text(arg)?)),
            MAJOR_ARRAY => {
                let mut items = Vec::new();
                for _ in 0..arg {
                    let initial = self.read_u8()?;
                    items.push(self.read_with_initial(initial, depth + 1)?);
                }
                Ok(DagCborValue::Array(items))
            }
            MAJOR_MAP => {
                let mut entries = Vec::new();
                let mut seen = HashSet::new();
                for _ in 0..arg {
                    let key_initial = self.read_u8()?;
                    if key_initial >> 5 != MAJOR_TEXT {
                        return Err(CborError::NonStringMapKey);
                    }
                    let key_len = self.read_argument(MAJOR_TEXT, key_initial & 0x1F)?;
                    let key = self.read_text(key_len)?;
                    if !seen.insert(key.clone()) {
                        return Err(CborError::DuplicateMapKey(key));
                    }

                    let initial = self.read_u8()?;
                    let value = self.read_with_initial(initial, depth + 1)?;
                    entries.push((key, value));
                }
                Ok(DagCborValue::Map(entries))
            }
            MAJOR_TAG => {
                if arg != CID_TAG {
                    return Err(CborError::UnsupportedCborType(format!("tag {}", arg)));
                }
                let inner = self.read_u8()?;
                if inner >> 5 != MAJOR_BYTES {
                    return Err(CborError::InvalidCidLink(
                        "tag 42 must wrap a byte string".into(),
                    ));
                }
                let len = self.read_argument(MAJOR_BYTES, inner & 0x1F)?;
                let payload = self.read_payload(len)?;
                match payload.split_first() {
                    Some((0x00, cid_bytes)) => Cid::from_bytes(cid_bytes)
                        .map(DagCborValue::Link)
                        .map_err(|e| CborError::InvalidCidLink(e.to_string())),
                    _ => Err(CborError::InvalidCidLink(
                        "missing 0x00 multibase prefix".into(),
                    )),
                }
            }
            // major is three bits wide and 7 is handled above
            _ => Err(CborError::UnsupportedCborType(format!("major type {}", major))),
        }
    }
}
