//! Unsigned LEB128 variable-length integers
//!
//! Used for CAR section lengths and inside the binary CID encoding. Values are
//! written seven bits at a time, least significant group first, with the high
//! bit of each byte set while more bytes follow.

use std::io::{self, Read, Write};

/// Longest possible encoding of a `u64`
pub const MAX_VARINT_LEN: usize = 10;

/// Errors from reading a varint
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum VarIntError {
    /// Input ended while the continuation bit was still set
    #[error("input ended in the middle of a varint")]
    #[diagnostic(code(skein::varint::malformed))]
    MalformedVarInt,

    /// More than ten bytes, or a value wider than 64 bits
    #[error("varint does not fit in 64 bits")]
    #[diagnostic(code(skein::varint::overflow))]
    Overflow,

    /// The underlying reader failed
    #[error("failed to read varint")]
    #[diagnostic(code(skein::varint::io))]
    Io(#[from] io::Error),
}

fn read_byte<R: Read + ?Sized>(reader: &mut R) -> io::Result<Option<u8>> {
    let mut byte = [0u8; 1];
    match reader.read_exact(&mut byte) {
        Ok(()) => Ok(Some(byte[0])),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

/// Read a varint, returning `None` if the reader is already exhausted.
///
/// End of input after at least one byte has been consumed is an error, so a
/// caller walking a stream of length-prefixed sections can tell a clean end
/// from a truncated one.
pub fn read_varint_opt<R: Read + ?Sized>(reader: &mut R) -> Result<Option<u64>, VarIntError> {
    let mut value: u64 = 0;
    for i in 0..MAX_VARINT_LEN {
        let byte = match read_byte(reader)? {
            Some(b) => b,
            None if i == 0 => return Ok(None),
            None => return Err(VarIntError::MalformedVarInt),
        };

        let group = (byte & 0x7F) as u64;
        // tenth byte may only contribute the top bit
        if i == MAX_VARINT_LEN - 1 && group > 1 {
            return Err(VarIntError::Overflow);
        }
        value |= group << (7 * i);

        if byte & 0x80 == 0 {
            return Ok(Some(value));
        }
    }

    Err(VarIntError::Overflow)
}

/// Read a varint from a reader
pub fn read_varint<R: Read + ?Sized>(reader: &mut R) -> Result<u64, VarIntError> {
    read_varint_opt(reader)?.ok_or(VarIntError::MalformedVarInt)
}

/// Decode a varint from the front of a slice, returning the value and the
/// number of bytes consumed.
pub fn decode_varint(bytes: &[u8]) -> Result<(u64, usize), VarIntError> {
    let mut rest = bytes;
    let value = read_varint(&mut rest)?;
    Ok((value, bytes.len() - rest.len()))
}

/// Append the minimal encoding of `value` to `out`
pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Write the minimal encoding of `value` to a writer
pub fn write_varint<W: Write + ?Sized>(writer: &mut W, value: u64) -> io::Result<()> {
    let mut buf = Vec::with_capacity(MAX_VARINT_LEN);
    encode_varint(value, &mut buf);
    writer.write_all(&buf)
}

/// Number of bytes the minimal encoding of `value` takes
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}
