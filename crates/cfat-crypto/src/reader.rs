//! Seekable chunk decryptor.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use tracing::trace;

use crate::buffer::ChunkBuffer;
use crate::cipher::ChunkCipher;
use crate::error::CodecError;
use crate::iv::Iv;
use crate::TAG_SIZE;

/// Decrypts a chunked stream with random access.
///
/// The cleartext length is derived from the ciphertext length the backend
/// reports, without touching the stream. One decrypted chunk is held at a
/// time; reads drain it and pull the next chunk on demand.
pub struct StreamReader<R: Read + Seek> {
    cipher: Arc<ChunkCipher>,
    base_iv: Iv,
    /// IV of `next_chunk`
    iv: Iv,
    chunk_size: usize,
    source: R,
    ciphertext_len: u64,
    len: u64,
    buf: ChunkBuffer,
    /// Cleartext offset of the next byte `read` returns
    pos: u64,
    next_chunk: u64,
}

impl<R: Read + Seek> StreamReader<R> {
    /// `source` must be positioned at the start of the ciphertext.
    pub fn new(
        cipher: Arc<ChunkCipher>,
        iv: Iv,
        chunk_size: usize,
        source: R,
        ciphertext_len: u64,
    ) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            cipher,
            base_iv: iv,
            iv,
            chunk_size,
            source,
            ciphertext_len,
            len: crate::cleartext_len(ciphertext_len, chunk_size),
            buf: ChunkBuffer::with_capacity(chunk_size + TAG_SIZE),
            pos: 0,
            next_chunk: 0,
        }
    }

    /// Cleartext length of the whole stream.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current cleartext offset.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Fill `out` as far as the stream allows. Returns 0 at end of stream.
    pub fn read(&mut self, out: &mut [u8]) -> Result<usize, CodecError> {
        let mut filled = 0;
        while filled < out.len() && self.pos < self.len {
            if self.buf.is_drained() {
                self.load_next_chunk()?;
            }
            let unread = self.buf.unread();
            let n = unread
                .len()
                .min(out.len() - filled)
                .min((self.len - self.pos) as usize);
            out[filled..filled + n].copy_from_slice(&unread[..n]);
            self.buf.consume(n);
            self.pos += n as u64;
            filled += n;
        }
        Ok(filled)
    }

    /// Reposition to an absolute cleartext offset resolved from `target`.
    ///
    /// Always cold: buffers and IV are reset, the backend is repositioned at
    /// the start of the chunk holding the offset, and that chunk is decrypted.
    pub fn seek(&mut self, target: SeekFrom) -> Result<u64, CodecError> {
        let offset: i128 = match target {
            SeekFrom::Start(o) => i128::from(o),
            SeekFrom::Current(d) => i128::from(self.pos) + i128::from(d),
            SeekFrom::End(d) => i128::from(self.len) + i128::from(d),
        };
        if offset < 0 || offset > i128::from(self.len) {
            return Err(CodecError::InvalidSeek {
                offset,
                len: self.len,
            });
        }
        let offset = offset as u64;

        self.buf.reset();
        self.iv = self.base_iv;
        self.next_chunk = 0;

        let chunk = offset / self.chunk_size as u64;
        self.iv.advance(chunk);
        self.next_chunk = chunk;
        self.source
            .seek(SeekFrom::Start(chunk * self.sealed_chunk_size()))?;

        if offset < self.len {
            self.load_next_chunk()?;
            self.buf.skip_to((offset % self.chunk_size as u64) as usize);
        }
        self.pos = offset;
        trace!(offset, chunk, "seek");
        Ok(offset)
    }

    /// Read everything from the current position to the end.
    pub fn read_to_vec(&mut self) -> Result<Vec<u8>, CodecError> {
        let mut out = vec![0u8; (self.len - self.pos) as usize];
        let n = self.read(&mut out)?;
        out.truncate(n);
        Ok(out)
    }

    pub fn into_inner(self) -> R {
        self.source
    }

    fn sealed_chunk_size(&self) -> u64 {
        (self.chunk_size + TAG_SIZE) as u64
    }

    fn load_next_chunk(&mut self) -> Result<(), CodecError> {
        let chunk = self.next_chunk;
        let start = chunk * self.sealed_chunk_size();
        let sealed_len = self
            .sealed_chunk_size()
            .min(self.ciphertext_len.saturating_sub(start)) as usize;

        let raw = self.buf.load(sealed_len);
        let opened = match self.source.read_exact(raw) {
            Ok(()) => self.cipher.open_in_place(&self.iv, chunk, raw),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = opened {
            // never hand out bytes of a chunk that failed to open
            self.buf.reset();
            return Err(e);
        }

        self.iv.increment();
        self.next_chunk += 1;
        Ok(())
    }
}

impl<R: Read + Seek> Read for StreamReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(StreamReader::read(self, buf)?)
    }
}

impl<R: Read + Seek> Seek for StreamReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Ok(StreamReader::seek(self, pos)?)
    }

    fn stream_position(&mut self) -> io::Result<u64> {
        Ok(self.pos)
    }
}

impl<R: Read + Seek> std::fmt::Debug for StreamReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader")
            .field("len", &self.len)
            .field("pos", &self.pos)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::VolumeKey;
    use crate::writer::StreamWriter;
    use std::io::Cursor;

    fn cipher() -> Arc<ChunkCipher> {
        Arc::new(ChunkCipher::new(&VolumeKey::from_bytes([11u8; 32])))
    }

    fn seal(data: &[u8], chunk: usize, iv: Iv) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut w = StreamWriter::new(cipher(), iv, chunk, &mut out);
            w.write(data).unwrap();
            w.close().unwrap();
        }
        out
    }

    fn open(sealed: Vec<u8>, chunk: usize, iv: Iv) -> StreamReader<Cursor<Vec<u8>>> {
        let len = sealed.len() as u64;
        StreamReader::new(cipher(), iv, chunk, Cursor::new(sealed), len)
    }

    #[test]
    fn test_reads_across_chunks() {
        let data: Vec<u8> = (0..100u8).collect();
        let iv = Iv::from_bytes([4u8; 12]);
        let mut r = open(seal(&data, 16, iv), 16, iv);

        assert_eq!(r.len(), 100);
        let mut small = [0u8; 7];
        assert_eq!(r.read(&mut small).unwrap(), 7);
        assert_eq!(&small, &data[..7]);
        assert_eq!(r.read_to_vec().unwrap(), &data[7..]);
        assert_eq!(r.read(&mut small).unwrap(), 0);
    }

    #[test]
    fn test_seek_bounds() {
        let iv = Iv::random();
        let mut r = open(seal(b"0123456789", 4, iv), 4, iv);

        assert_eq!(r.seek(SeekFrom::End(0)).unwrap(), 10);
        assert_eq!(r.read_to_vec().unwrap(), b"");
        assert!(matches!(
            r.seek(SeekFrom::Start(11)),
            Err(CodecError::InvalidSeek { offset: 11, len: 10 })
        ));
        assert!(matches!(
            r.seek(SeekFrom::Current(-20)),
            Err(CodecError::InvalidSeek { .. })
        ));
        assert_eq!(r.seek(SeekFrom::End(-3)).unwrap(), 7);
        assert_eq!(r.read_to_vec().unwrap(), b"789");
    }

    #[test]
    fn test_seek_current_is_relative() {
        let iv = Iv::random();
        let mut r = open(seal(b"abcdefghijkl", 5, iv), 5, iv);
        let mut two = [0u8; 2];
        r.read(&mut two).unwrap();
        r.seek(SeekFrom::Current(4)).unwrap();
        assert_eq!(r.position(), 6);
        assert_eq!(r.read_to_vec().unwrap(), b"ghijkl");
    }

    #[test]
    fn test_corrupt_chunk_reported() {
        let iv = Iv::random();
        let mut sealed = seal(&[7u8; 40], 10, iv);
        sealed[(10 + TAG_SIZE) + 3] ^= 1;
        let mut r = open(sealed, 10, iv);

        let mut out = [0u8; 10];
        assert_eq!(r.read(&mut out).unwrap(), 10);
        assert!(matches!(
            r.read(&mut out),
            Err(CodecError::Corrupt { chunk: 1 })
        ));
    }

    #[test]
    fn test_io_adapter_carries_corruption() {
        let iv = Iv::random();
        let mut sealed = seal(b"json payload", 64, iv);
        sealed[0] ^= 0x80;
        let mut r = open(sealed, 64, iv);

        let mut out = Vec::new();
        let err = Read::read_to_end(&mut r, &mut out).unwrap_err();
        assert!(matches!(
            CodecError::from_io(err),
            CodecError::Corrupt { chunk: 0 }
        ));
    }
}
