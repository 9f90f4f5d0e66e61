//! Byte-level seams between the cipher codec and a storage backend.
//!
//! A backend hands out a [`Blob`] for reading (a seekable source plus the
//! length it reports) and a [`BlobSink`] for writing. Nothing written to a sink
//! is visible to readers until [`BlobSink::commit`] returns.

use std::io::{self, Cursor, Read, Seek, Write};

/// Seekable byte source for an existing blob.
pub trait BlobSource: Read + Seek + Send {}

impl<T: Read + Seek + Send> BlobSource for T {}

/// A blob opened for reading: the stream and the length the backend reports.
pub struct Blob {
    pub source: Box<dyn BlobSource>,
    pub len: u64,
}

impl Blob {
    pub fn new(source: impl BlobSource + 'static, len: u64) -> Self {
        Blob {
            source: Box::new(source),
            len,
        }
    }

    /// A blob served straight from memory.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let len = bytes.len() as u64;
        Blob::new(Cursor::new(bytes), len)
    }
}

impl std::fmt::Debug for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blob").field("len", &self.len).finish()
    }
}

/// Append-only byte sink for a blob being written.
///
/// Every `write` call is forwarded to the backend as-is. `commit` publishes
/// the blob atomically; a sink dropped without `commit` leaves the previously
/// committed blob (if any) untouched.
pub trait BlobSink: Write + Send {
    fn commit(&mut self) -> io::Result<()>;
}

impl BlobSink for Vec<u8> {
    fn commit(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BlobSink for Cursor<Vec<u8>> {
    fn commit(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<S: BlobSink + ?Sized> BlobSink for Box<S> {
    fn commit(&mut self) -> io::Result<()> {
        (**self).commit()
    }
}

impl<S: BlobSink + ?Sized> BlobSink for &mut S {
    fn commit(&mut self) -> io::Result<()> {
        (**self).commit()
    }
}
