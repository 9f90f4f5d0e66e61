//! In-process connector. Clones share the same blob map, which lets a test
//! "reopen" a backend after dropping an engine.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cfat_core::{Blob, BlobSink};

use crate::{check_key, Connector};

type BlobMap = Arc<Mutex<HashMap<String, Vec<u8>>>>;

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    name: String,
    blobs: BlobMap,
}

impl MemoryConnector {
    pub fn new(name: impl Into<String>) -> Self {
        MemoryConnector {
            name: name.into(),
            blobs: Arc::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Raw stored bytes under a full key such as `content/<id>` or `meta/fat`.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().get(key).cloned()
    }

    /// Overwrite raw stored bytes (fault injection).
    pub fn set_raw(&self, key: &str, bytes: Vec<u8>) {
        self.lock().insert(key.to_string(), bytes);
    }

    /// All stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn get(&self, key: &str) -> Option<Blob> {
        self.raw(key).map(Blob::from_bytes)
    }

    fn sink(&self, key: String) -> Box<dyn BlobSink> {
        Box::new(MemorySink {
            key,
            buf: Vec::new(),
            blobs: self.blobs.clone(),
        })
    }
}

fn content_key(id: &str) -> io::Result<String> {
    check_key(id)?;
    Ok(format!("content/{id}"))
}

fn meta_key(table: &str) -> io::Result<String> {
    check_key(table)?;
    Ok(format!("meta/{table}"))
}

impl Connector for MemoryConnector {
    fn identity(&self) -> String {
        format!("memory:{}", self.name)
    }

    fn prepare(&self) -> io::Result<()> {
        Ok(())
    }

    fn open_content_reader(&self, id: &str) -> io::Result<Blob> {
        let key = content_key(id)?;
        self.get(&key).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no such blob: {key}"))
        })
    }

    fn open_content_writer(&self, id: &str) -> io::Result<Box<dyn BlobSink>> {
        Ok(self.sink(content_key(id)?))
    }

    fn open_metadata_reader(&self, table: &str) -> io::Result<Option<Blob>> {
        Ok(self.get(&meta_key(table)?))
    }

    fn open_metadata_writer(&self, table: &str) -> io::Result<Box<dyn BlobSink>> {
        Ok(self.sink(meta_key(table)?))
    }

    fn remove_content(&self, id: &str) -> io::Result<()> {
        let key = content_key(id)?;
        self.lock().remove(&key);
        Ok(())
    }

    fn remove_metadata(&self, table: &str) -> io::Result<()> {
        let key = meta_key(table)?;
        self.lock().remove(&key);
        Ok(())
    }
}

struct MemorySink {
    key: String,
    buf: Vec<u8>,
    blobs: BlobMap,
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BlobSink for MemorySink {
    fn commit(&mut self) -> io::Result<()> {
        let data = std::mem::take(&mut self.buf);
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.key.clone(), data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_clones_share_blobs() {
        let a = MemoryConnector::new("t");
        let b = a.clone();

        let mut sink = a.open_content_writer("f1").unwrap();
        sink.write_all(b"data").unwrap();
        assert!(b.open_content_reader("f1").is_err(), "not visible before commit");
        sink.commit().unwrap();

        let mut blob = b.open_content_reader("f1").unwrap();
        let mut out = Vec::new();
        blob.source.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"data");
        assert_eq!(a.keys(), vec!["content/f1".to_string()]);
    }

    #[test]
    fn test_raw_access() {
        let conn = MemoryConnector::new("raw");
        conn.set_raw("meta/fat", vec![1, 2, 3]);
        let blob = conn.open_metadata_reader("fat").unwrap().unwrap();
        assert_eq!(blob.len, 3);
        conn.remove_metadata("fat").unwrap();
        assert!(conn.raw("meta/fat").is_none());
    }
}
