//! Reading repository streams

use super::{CarHeader, CarLimits};
use crate::error::{FramingError, RepoError, Result};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use skein_common::Cid;
use skein_common::cbor;
use skein_common::types::cid::SHA2_256;
use skein_common::varint::{self, MAX_VARINT_LEN};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

/// A fully parsed in-memory stream
#[derive(Debug, Clone)]
pub struct ParsedCar {
    /// The first root CID from the header
    pub root: Cid,
    /// Every root from the header
    pub roots: Vec<Cid>,
    /// All blocks, keyed by CID
    pub blocks: BTreeMap<Cid, Bytes>,
}

/// Walk a stream, handing the header and then each block to a callback.
///
/// Either callback returns `false` to stop the walk early. A clean end of
/// stream at a block boundary ends the walk; any other short read fails.
pub fn walk_repo<R, H, B>(
    mut reader: R,
    limits: &CarLimits,
    mut on_header: H,
    mut on_block: B,
) -> std::result::Result<(), FramingError>
where
    R: Read,
    H: FnMut(&CarHeader) -> bool,
    B: FnMut(Cid, Bytes) -> bool,
{
    let header_len = match varint::read_varint_opt(&mut reader)? {
        Some(len) => len,
        None => return Err(FramingError::TruncatedStream),
    };
    check_header_len(header_len, limits)?;
    let header = read_section(&mut reader, header_len)?;
    let header = parse_header(&header)?;
    if !on_header(&header) {
        return Ok(());
    }

    while let Some(block_len) = varint::read_varint_opt(&mut reader)? {
        check_block_len(block_len, limits)?;
        let section = read_section(&mut reader, block_len)?;
        let (cid, data) = split_block(section)?;
        if !on_block(cid, data) {
            break;
        }
    }
    Ok(())
}

/// [`walk_repo`] over an async reader
pub async fn walk_repo_async<R, H, B>(
    mut reader: R,
    limits: &CarLimits,
    mut on_header: H,
    mut on_block: B,
) -> std::result::Result<(), FramingError>
where
    R: AsyncRead + Unpin,
    H: FnMut(&CarHeader) -> bool,
    B: FnMut(Cid, Bytes) -> bool,
{
    let header_len = match read_varint_async(&mut reader).await? {
        Some(len) => len,
        None => return Err(FramingError::TruncatedStream),
    };
    check_header_len(header_len, limits)?;
    let header = read_section_async(&mut reader, header_len).await?;
    let header = parse_header(&header)?;
    if !on_header(&header) {
        return Ok(());
    }

    while let Some(block_len) = read_varint_async(&mut reader).await? {
        check_block_len(block_len, limits)?;
        let section = read_section_async(&mut reader, block_len).await?;
        let (cid, data) = split_block(section)?;
        if !on_block(cid, data) {
            break;
        }
    }
    Ok(())
}

/// Parse an in-memory stream into its root and block map
///
/// For firehose commit blocks and proofs. Every block is checked against its
/// CID, since this data usually arrives from the network.
pub fn parse_car_bytes(data: &[u8], limits: &CarLimits) -> Result<ParsedCar> {
    let mut roots = Vec::new();
    let mut blocks = BTreeMap::new();
    let mut mismatch = None;

    walk_repo(
        data,
        limits,
        |header| {
            roots = header.roots.clone();
            true
        },
        |cid, data| {
            if !block_matches_cid(&cid, &data) {
                mismatch = Some(cid);
                return false;
            }
            blocks.insert(cid, data);
            true
        },
    )?;

    if let Some(cid) = mismatch {
        return Err(FramingError::InvalidBlock(format!("block does not hash to {}", cid)).into());
    }
    let root = roots
        .first()
        .copied()
        .ok_or_else(|| RepoError::from(FramingError::InvalidHeader("no roots".into())))?;

    Ok(ParsedCar {
        root,
        roots,
        blocks,
    })
}

/// Read an entire file into memory
///
/// Returns a map of CID to block data.
pub async fn read_car(path: impl AsRef<Path>, limits: &CarLimits) -> Result<BTreeMap<Cid, Bytes>> {
    let file = tokio::fs::File::open(path).await.map_err(RepoError::io)?;
    let mut blocks = BTreeMap::new();
    walk_repo_async(
        BufReader::new(file),
        limits,
        |_| true,
        |cid, data| {
            blocks.insert(cid, data);
            true
        },
    )
    .await?;
    Ok(blocks)
}

/// Read only the roots of a file
pub async fn read_car_header(path: impl AsRef<Path>, limits: &CarLimits) -> Result<Vec<Cid>> {
    let file = tokio::fs::File::open(path).await.map_err(RepoError::io)?;
    let mut roots = Vec::new();
    walk_repo_async(
        BufReader::new(file),
        limits,
        |header| {
            roots = header.roots.clone();
            false
        },
        |_, _| false,
    )
    .await?;
    Ok(roots)
}

/// Does `data` hash to the digest in `cid`?
pub(crate) fn block_matches_cid(cid: &Cid, data: &[u8]) -> bool {
    cid.hash_code() == SHA2_256 && Sha256::digest(data).as_slice() == cid.digest()
}

fn check_header_len(len: u64, limits: &CarLimits) -> std::result::Result<(), FramingError> {
    if len == 0 {
        return Err(FramingError::InvalidHeader("empty header".into()));
    }
    if len > limits.max_header_size as u64 {
        return Err(FramingError::HeaderTooLarge {
            size: len,
            max: limits.max_header_size,
        });
    }
    Ok(())
}

fn check_block_len(len: u64, limits: &CarLimits) -> std::result::Result<(), FramingError> {
    if len == 0 {
        return Err(FramingError::InvalidBlock("zero-length block".into()));
    }
    if len > limits.max_block_size as u64 {
        return Err(FramingError::BlockTooLarge {
            size: len,
            max: limits.max_block_size,
        });
    }
    Ok(())
}

fn parse_header(bytes: &[u8]) -> std::result::Result<CarHeader, FramingError> {
    let value = cbor::decode(bytes).map_err(|e| FramingError::InvalidHeader(e.to_string()))?;
    CarHeader::from_value(&value)
}

fn split_block(section: Vec<u8>) -> std::result::Result<(Cid, Bytes), FramingError> {
    let (cid, used) =
        Cid::read_bytes(&section).map_err(|e| FramingError::InvalidBlock(e.to_string()))?;
    let section = Bytes::from(section);
    Ok((cid, section.slice(used..)))
}

// Lengths are bounded by the limits checks, but the buffer still only grows
// as bytes actually arrive.
fn read_section<R: Read>(reader: &mut R, len: u64) -> std::result::Result<Vec<u8>, FramingError> {
    let mut buf = Vec::new();
    reader.take(len).read_to_end(&mut buf)?;
    if (buf.len() as u64) < len {
        return Err(FramingError::TruncatedStream);
    }
    Ok(buf)
}

async fn read_section_async<R: AsyncRead + Unpin>(
    reader: &mut R,
    len: u64,
) -> std::result::Result<Vec<u8>, FramingError> {
    let mut buf = Vec::new();
    (&mut *reader).take(len).read_to_end(&mut buf).await?;
    if (buf.len() as u64) < len {
        return Err(FramingError::TruncatedStream);
    }
    Ok(buf)
}

async fn read_varint_async<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> std::result::Result<Option<u64>, FramingError> {
    // Gather up to the final group, then decode with the shared rules
    let mut buf = [0u8; MAX_VARINT_LEN];
    let mut len = 0;
    while len < MAX_VARINT_LEN {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                if len == 0 {
                    return Ok(None);
                }
                break;
            }
            Err(e) => return Err(FramingError::Io(e)),
        };
        buf[len] = byte;
        len += 1;
        if byte & 0x80 == 0 {
            break;
        }
    }
    let (value, _) = varint::decode_varint(&buf[..len])?;
    Ok(Some(value))
}
