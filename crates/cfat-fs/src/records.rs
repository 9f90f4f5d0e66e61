//! Metadata table serialization.
//!
//! A table is a JSON integer format version, a JSON integer record count,
//! then that many JSON objects, all on one cipher stream. Several tables
//! can follow each other on the same stream; each is read from the same
//! streaming deserializer.
//!
//! A sealed metadata blob starts with a 12-byte cleartext salt. The stream
//! IV is the volume base IV masked with the salt, then advanced by the
//! table's fixed offset, so tables written together never share a counter
//! range and a rewrite never repeats an IV.

use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use cfat_core::{Blob, BlobSink, BlobSource, CfatError, CfatResult};
use cfat_crypto::{ChunkCipher, CodecError, Iv, StreamReader, StreamWriter, IV_SIZE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::de::IoRead;

pub const FORMAT_VERSION: u32 = 1;

/// Cap on preallocation from a count read off the wire
const MAX_PREALLOC: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Fat,
    Users,
    Groups,
}

impl Table {
    pub const ALL: [Table; 3] = [Table::Fat, Table::Users, Table::Groups];

    /// Backend key of the table blob
    pub fn name(self) -> &'static str {
        match self {
            Table::Fat => "fat",
            Table::Users => "users",
            Table::Groups => "groups",
        }
    }

    /// IV increments between the masked base and this table's first chunk
    pub fn iv_offset(self) -> u64 {
        match self {
            Table::Fat => 0,
            Table::Users => 1 << 32,
            Table::Groups => 2 << 32,
        }
    }
}

/// IV offset of the local cache snapshot
pub const CACHE_IV_OFFSET: u64 = 3 << 32;

pub type TableDeserializer<R> = serde_json::Deserializer<IoRead<BufReader<R>>>;

/// Map an I/O error that may carry a codec failure.
pub(crate) fn io_error(err: io::Error) -> CfatError {
    CodecError::from_io(err).into()
}

pub(crate) fn json_error(err: serde_json::Error) -> CfatError {
    if err.is_io() {
        io_error(err.into())
    } else {
        CfatError::CorruptData(format!("malformed metadata record: {err}"))
    }
}

pub fn write_table<W: Write, T: Serialize>(out: &mut W, records: &[T]) -> CfatResult<()> {
    serde_json::to_writer(&mut *out, &FORMAT_VERSION).map_err(json_error)?;
    out.write_all(b"\n").map_err(io_error)?;
    serde_json::to_writer(&mut *out, &records.len()).map_err(json_error)?;
    out.write_all(b"\n").map_err(io_error)?;
    for record in records {
        serde_json::to_writer(&mut *out, record).map_err(json_error)?;
        out.write_all(b"\n").map_err(io_error)?;
    }
    Ok(())
}

pub fn read_table<R: Read, T: DeserializeOwned>(
    de: &mut TableDeserializer<R>,
) -> CfatResult<Vec<T>> {
    let version = u32::deserialize(&mut *de).map_err(json_error)?;
    if version != FORMAT_VERSION {
        return Err(CfatError::CorruptData(format!(
            "metadata format version {version}, expected {FORMAT_VERSION}"
        )));
    }
    let count = u64::deserialize(&mut *de).map_err(json_error)?;
    let mut records = Vec::with_capacity((count as usize).min(MAX_PREALLOC));
    for _ in 0..count {
        records.push(T::deserialize(&mut *de).map_err(json_error)?);
    }
    Ok(records)
}

pub fn table_deserializer<R: Read>(reader: R) -> TableDeserializer<R> {
    serde_json::Deserializer::from_reader(BufReader::new(reader))
}

/// Fail if anything but whitespace follows the last table.
pub fn finish<R: Read>(mut de: TableDeserializer<R>) -> CfatResult<()> {
    de.end().map_err(json_error)
}

pub type SealedReader = StreamReader<Framed<Box<dyn BlobSource>>>;

/// Cipher, base IV and chunk size used for metadata blobs
#[derive(Clone)]
pub struct Sealing {
    cipher: Arc<ChunkCipher>,
    base_iv: Iv,
    chunk_size: usize,
}

impl Sealing {
    pub fn new(cipher: Arc<ChunkCipher>, base_iv: Iv, chunk_size: usize) -> Self {
        Sealing {
            cipher,
            base_iv,
            chunk_size,
        }
    }

    /// Write a fresh salt to `sink` and return a codec writer behind it.
    pub fn writer<W: BlobSink>(&self, mut sink: W, offset: u64) -> CfatResult<StreamWriter<W>> {
        let salt: [u8; IV_SIZE] = rand::random();
        sink.write_all(&salt)?;
        let iv = self.base_iv.masked(&salt).advanced(offset);
        Ok(StreamWriter::new(
            self.cipher.clone(),
            iv,
            self.chunk_size,
            sink,
        ))
    }

    pub fn reader(&self, blob: Blob, offset: u64) -> CfatResult<SealedReader> {
        let header = IV_SIZE as u64;
        if blob.len < header {
            return Err(CfatError::CorruptData(format!(
                "metadata blob of {} bytes is shorter than its header",
                blob.len
            )));
        }
        let mut source = blob.source;
        let mut salt = [0u8; IV_SIZE];
        source.read_exact(&mut salt)?;
        let iv = self.base_iv.masked(&salt).advanced(offset);
        Ok(StreamReader::new(
            self.cipher.clone(),
            iv,
            self.chunk_size,
            Framed {
                inner: source,
                start: header,
            },
            blob.len - header,
        ))
    }

    /// Read one table out of a sealed blob.
    pub fn read_one<T: DeserializeOwned>(&self, blob: Blob, table: Table) -> CfatResult<Vec<T>> {
        let mut de = table_deserializer(self.reader(blob, table.iv_offset())?);
        let records = read_table(&mut de)?;
        finish(de)?;
        Ok(records)
    }
}

/// A source whose first `start` bytes are hidden from seeks.
pub struct Framed<R> {
    inner: R,
    start: u64,
}

impl<R: Read> Read for Framed<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<R: Seek> Seek for Framed<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let pos = match pos {
            SeekFrom::Start(o) => SeekFrom::Start(self.start + o),
            other => other,
        };
        let abs = self.inner.seek(pos)?;
        abs.checked_sub(self.start).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek into blob header")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfat_crypto::VolumeKey;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Rec {
        id: u32,
        name: String,
    }

    fn sealing() -> Sealing {
        let cipher = Arc::new(ChunkCipher::new(&VolumeKey::from_bytes([5u8; 32])));
        Sealing::new(cipher, Iv::from_bytes([9u8; IV_SIZE]), 32)
    }

    fn recs(n: u32) -> Vec<Rec> {
        (0..n)
            .map(|id| Rec {
                id,
                name: format!("record {id}"),
            })
            .collect()
    }

    #[test]
    fn test_tables_back_to_back() {
        let mut buf = Vec::new();
        write_table(&mut buf, &recs(3)).unwrap();
        write_table(&mut buf, &recs(0)).unwrap();
        write_table(&mut buf, &["x".to_string()]).unwrap();

        let mut de = table_deserializer(buf.as_slice());
        assert_eq!(read_table::<_, Rec>(&mut de).unwrap(), recs(3));
        assert!(read_table::<_, Rec>(&mut de).unwrap().is_empty());
        assert_eq!(read_table::<_, String>(&mut de).unwrap(), vec!["x"]);
        finish(de).unwrap();
    }

    #[test]
    fn test_version_mismatch_is_corrupt() {
        let mut de = table_deserializer(&b"2\n0\n"[..]);
        let err = read_table::<_, Rec>(&mut de).unwrap_err();
        assert!(err.is_corrupt(), "{err}");
    }

    #[test]
    fn test_short_table_is_corrupt() {
        let mut de = table_deserializer(&b"1\n3\n{\"id\":0,\"name\":\"a\"}\n"[..]);
        assert!(read_table::<_, Rec>(&mut de).unwrap_err().is_corrupt());
    }

    #[test]
    fn test_trailing_garbage_is_corrupt() {
        let mut de = table_deserializer(&b"1\n0\n[]"[..]);
        read_table::<_, Rec>(&mut de).unwrap();
        assert!(finish(de).unwrap_err().is_corrupt());
    }

    #[test]
    fn test_sealed_roundtrip_and_fresh_salt() {
        let s = sealing();
        let mut first = Vec::new();
        let mut w = s.writer(&mut first, Table::Users.iv_offset()).unwrap();
        write_table(&mut w, &recs(10)).unwrap();
        w.close().unwrap();
        drop(w);

        let mut second = Vec::new();
        let mut w = s.writer(&mut second, Table::Users.iv_offset()).unwrap();
        write_table(&mut w, &recs(10)).unwrap();
        w.close().unwrap();
        drop(w);

        assert_ne!(first, second, "each write draws a new salt");
        let back: Vec<Rec> = s.read_one(Blob::from_bytes(first), Table::Users).unwrap();
        assert_eq!(back, recs(10));
    }

    #[test]
    fn test_wrong_table_offset_is_corrupt() {
        let s = sealing();
        let mut buf = Vec::new();
        let mut w = s.writer(&mut buf, Table::Fat.iv_offset()).unwrap();
        write_table(&mut w, &recs(2)).unwrap();
        w.close().unwrap();
        drop(w);

        let err = s.read_one::<Rec>(Blob::from_bytes(buf), Table::Groups).unwrap_err();
        assert!(err.is_corrupt(), "{err}");
    }

    #[test]
    fn test_tampered_blob_is_corrupt() {
        let s = sealing();
        let mut buf = Vec::new();
        let mut w = s.writer(&mut buf, 0).unwrap();
        write_table(&mut w, &recs(20)).unwrap();
        w.close().unwrap();
        drop(w);

        let last = buf.len() - 1;
        buf[last] ^= 0x01;
        let err = s.read_one::<Rec>(Blob::from_bytes(buf), Table::Fat).unwrap_err();
        assert!(err.is_corrupt(), "{err}");
    }

    #[test]
    fn test_header_only_blob_rejected() {
        let s = sealing();
        assert!(s
            .read_one::<Rec>(Blob::from_bytes(vec![0u8; 4]), Table::Fat)
            .unwrap_err()
            .is_corrupt());
    }

    #[test]
    fn test_framed_seek_skips_header() {
        let mut f = Framed {
            inner: io::Cursor::new(b"HEADbody".to_vec()),
            start: 4,
        };
        f.seek(SeekFrom::Start(0)).unwrap();
        let mut out = String::new();
        f.read_to_string(&mut out).unwrap();
        assert_eq!(out, "body");
        assert_eq!(f.seek(SeekFrom::Start(2)).unwrap(), 2);
    }
}
