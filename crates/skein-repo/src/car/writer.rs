//! Writing repository streams
//!
//! Output depends only on the roots and the order blocks are handed in, so
//! identical content always produces identical bytes.

use super::CarHeader;
use crate::error::{FramingError, RepoError, Result};
use bytes::Bytes;
use skein_common::Cid;
use skein_common::cbor;
use skein_common::varint;
use std::io::Write;
use std::path::Path;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;

fn push_header(out: &mut Vec<u8>, roots: &[Cid]) {
    let header = cbor::encode(&CarHeader::new_v1(roots.to_vec()).to_value());
    varint::encode_varint(header.len() as u64, out);
    out.extend_from_slice(&header);
}

fn push_block(out: &mut Vec<u8>, cid: &Cid, data: &[u8]) {
    let cid = cid.as_bytes();
    varint::encode_varint((cid.len() + data.len()) as u64, out);
    out.extend_from_slice(cid);
    out.extend_from_slice(data);
}

/// Frame blocks into an in-memory stream
pub fn write_car_bytes(roots: &[Cid], blocks: impl IntoIterator<Item = (Cid, Bytes)>) -> Vec<u8> {
    let mut out = Vec::new();
    push_header(&mut out, roots);
    for (cid, data) in blocks {
        push_block(&mut out, &cid, &data);
    }
    out
}

/// Streaming writer over a blocking sink
///
/// The header goes out in [`CarWriter::new`]; blocks follow one by one.
pub struct CarWriter<W: Write> {
    inner: W,
    scratch: Vec<u8>,
}

impl<W: Write> CarWriter<W> {
    /// Write the header and return a writer ready for blocks
    pub fn new(mut inner: W, roots: &[Cid]) -> std::result::Result<Self, FramingError> {
        let mut scratch = Vec::new();
        push_header(&mut scratch, roots);
        inner.write_all(&scratch)?;
        scratch.clear();
        Ok(Self { inner, scratch })
    }

    /// Append one block
    pub fn write_block(&mut self, cid: &Cid, data: &[u8]) -> std::result::Result<(), FramingError> {
        self.scratch.clear();
        push_block(&mut self.scratch, cid, data);
        self.inner.write_all(&self.scratch)?;
        Ok(())
    }

    /// Flush and hand back the sink
    pub fn finish(mut self) -> std::result::Result<W, FramingError> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

/// Streaming writer over an async sink
///
/// Checks its [`CancellationToken`] before every block, so an export whose
/// consumer has gone away stops at the next block boundary with
/// [`FramingError::Cancelled`].
pub struct AsyncCarWriter<W: AsyncWrite + Unpin> {
    inner: W,
    cancel: CancellationToken,
    scratch: Vec<u8>,
    blocks_written: usize,
}

impl<W: AsyncWrite + Unpin> AsyncCarWriter<W> {
    /// Write the header and return a writer ready for blocks
    pub async fn new(
        mut inner: W,
        roots: &[Cid],
        cancel: CancellationToken,
    ) -> std::result::Result<Self, FramingError> {
        if cancel.is_cancelled() {
            return Err(FramingError::Cancelled);
        }
        let mut scratch = Vec::new();
        push_header(&mut scratch, roots);
        inner.write_all(&scratch).await?;
        scratch.clear();
        Ok(Self {
            inner,
            cancel,
            scratch,
            blocks_written: 0,
        })
    }

    /// Append one block
    pub async fn write_block(
        &mut self,
        cid: &Cid,
        data: &[u8],
    ) -> std::result::Result<(), FramingError> {
        if self.cancel.is_cancelled() {
            tracing::warn!(blocks_written = self.blocks_written, "CAR write cancelled");
            return Err(FramingError::Cancelled);
        }
        self.scratch.clear();
        push_block(&mut self.scratch, cid, data);
        self.inner.write_all(&self.scratch).await?;
        self.blocks_written += 1;
        Ok(())
    }

    /// Number of blocks written so far
    pub fn blocks_written(&self) -> usize {
        self.blocks_written
    }

    /// Flush and hand back the sink
    pub async fn finish(mut self) -> std::result::Result<W, FramingError> {
        self.inner.flush().await?;
        Ok(self.inner)
    }
}

/// Write blocks to a file
pub async fn write_car(
    path: impl AsRef<Path>,
    roots: &[Cid],
    blocks: impl IntoIterator<Item = (Cid, Bytes)>,
) -> Result<()> {
    let file = tokio::fs::File::create(path).await.map_err(RepoError::io)?;
    let mut writer = AsyncCarWriter::new(BufWriter::new(file), roots, CancellationToken::new()).await?;
    for (cid, data) in blocks {
        writer.write_block(&cid, &data).await?;
    }
    writer.finish().await?;
    Ok(())
}
