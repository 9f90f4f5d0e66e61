//! Streaming chunk encryptor.

use std::io::{self, Write};
use std::sync::Arc;

use cfat_core::BlobSink;
use tracing::{debug, warn};

use crate::cipher::ChunkCipher;
use crate::error::CodecError;
use crate::iv::Iv;
use crate::TAG_SIZE;

/// What a closed stream reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSummary {
    /// Total cleartext bytes written
    pub len: u64,
    /// BLAKE3 of the cleartext (hex)
    pub content_hash: String,
    /// Number of sealed chunks forwarded to the sink
    pub chunks: u64,
}

/// Seals cleartext into fixed-size chunks and forwards each to a [`BlobSink`].
///
/// Whole chunks leave as soon as they fill. [`close`](Self::close) is
/// mandatory: it seals the final short chunk, commits the sink and only then
/// makes [`len`](Self::len) and [`content_hash`](Self::content_hash) available.
pub struct StreamWriter<W: BlobSink> {
    cipher: Arc<ChunkCipher>,
    iv: Iv,
    chunk_size: usize,
    buf: Vec<u8>,
    sink: W,
    hasher: blake3::Hasher,
    written: u64,
    chunks: u64,
    summary: Option<StreamSummary>,
}

impl<W: BlobSink> StreamWriter<W> {
    pub fn new(cipher: Arc<ChunkCipher>, iv: Iv, chunk_size: usize, sink: W) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            cipher,
            iv,
            chunk_size,
            buf: Vec::with_capacity(chunk_size + TAG_SIZE),
            sink,
            hasher: blake3::Hasher::new(),
            written: 0,
            chunks: 0,
            summary: None,
        }
    }

    /// Append cleartext, sealing and forwarding every chunk that fills up.
    pub fn write(&mut self, mut data: &[u8]) -> Result<(), CodecError> {
        if self.summary.is_some() {
            return Err(CodecError::Closed);
        }
        while !data.is_empty() {
            let room = self.chunk_size - self.buf.len();
            let (head, rest) = data.split_at(room.min(data.len()));
            self.buf.extend_from_slice(head);
            self.hasher.update(head);
            data = rest;
            if self.buf.len() == self.chunk_size {
                self.flush_chunk()?;
            }
        }
        Ok(())
    }

    /// Seal the final chunk and commit the sink. Idempotent.
    pub fn close(&mut self) -> Result<(), CodecError> {
        if self.summary.is_some() {
            return Ok(());
        }
        if !self.buf.is_empty() {
            self.flush_chunk()?;
        }
        self.sink.flush()?;
        self.sink.commit()?;

        let summary = StreamSummary {
            len: self.written,
            content_hash: self.hasher.finalize().to_hex().to_string(),
            chunks: self.chunks,
        };
        debug!(len = summary.len, chunks = summary.chunks, "stream closed");
        self.summary = Some(summary);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.summary.is_some()
    }

    /// Total cleartext length. Only valid after `close()`.
    pub fn len(&self) -> Result<u64, CodecError> {
        self.summary().map(|s| s.len)
    }

    /// BLAKE3 hex digest of the cleartext. Only valid after `close()`.
    pub fn content_hash(&self) -> Result<&str, CodecError> {
        self.summary().map(|s| s.content_hash.as_str())
    }

    pub fn summary(&self) -> Result<&StreamSummary, CodecError> {
        self.summary.as_ref().ok_or(CodecError::NotClosed)
    }

    fn flush_chunk(&mut self) -> Result<(), CodecError> {
        let clear_len = self.buf.len() as u64;
        self.cipher
            .seal_in_place(&self.iv, self.chunks, &mut self.buf)?;
        self.sink.write_all(&self.buf)?;
        self.buf.clear();
        self.iv.increment();
        self.chunks += 1;
        self.written += clear_len;
        Ok(())
    }
}

impl<W: BlobSink> Write for StreamWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        StreamWriter::write(self, buf)?;
        Ok(buf.len())
    }

    /// Chunks are fixed-size, so there is nothing to push early.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<W: BlobSink> Drop for StreamWriter<W> {
    fn drop(&mut self) {
        if self.summary.is_none() && (self.chunks > 0 || !self.buf.is_empty()) {
            warn!(
                chunks = self.chunks,
                pending = self.buf.len(),
                "stream writer dropped before close; blob not committed"
            );
        }
    }
}
