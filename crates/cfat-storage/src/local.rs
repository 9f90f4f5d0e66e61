//! Local-disk connector.
//!
//! Layout: `{root}/content/{dirent id}` and `{root}/meta/{table}`. Writes go
//! to a temp file next to the destination and are renamed into place on
//! commit, so readers only ever see complete blobs.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use cfat_core::{Blob, BlobSink};
use tracing::{debug, warn};

use crate::{check_key, Connector};

#[derive(Debug, Clone)]
pub struct LocalConnector {
    root: PathBuf,
}

impl LocalConnector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalConnector { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn content_path(&self, id: &str) -> io::Result<PathBuf> {
        check_key(id)?;
        Ok(self.root.join("content").join(id))
    }

    fn meta_path(&self, table: &str) -> io::Result<PathBuf> {
        check_key(table)?;
        Ok(self.root.join("meta").join(table))
    }
}

fn open_blob(path: &Path) -> io::Result<Blob> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    Ok(Blob::new(file, len))
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

impl Connector for LocalConnector {
    fn identity(&self) -> String {
        let root = fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone());
        format!("local:{}", root.display())
    }

    fn prepare(&self) -> io::Result<()> {
        fs::create_dir_all(self.root.join("content"))?;
        fs::create_dir_all(self.root.join("meta"))?;
        debug!(root = %self.root.display(), "local backend ready");
        Ok(())
    }

    fn open_content_reader(&self, id: &str) -> io::Result<Blob> {
        open_blob(&self.content_path(id)?)
    }

    fn open_content_writer(&self, id: &str) -> io::Result<Box<dyn BlobSink>> {
        Ok(Box::new(AtomicFileSink::create(self.content_path(id)?)?))
    }

    fn open_metadata_reader(&self, table: &str) -> io::Result<Option<Blob>> {
        match open_blob(&self.meta_path(table)?) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn open_metadata_writer(&self, table: &str) -> io::Result<Box<dyn BlobSink>> {
        Ok(Box::new(AtomicFileSink::create(self.meta_path(table)?)?))
    }

    fn remove_content(&self, id: &str) -> io::Result<()> {
        remove_if_present(&self.content_path(id)?)
    }

    fn remove_metadata(&self, table: &str) -> io::Result<()> {
        remove_if_present(&self.meta_path(table)?)
    }
}

/// File sink published by rename on commit; the temp file is removed if the
/// sink is dropped first.
pub struct AtomicFileSink {
    dest: PathBuf,
    tmp: PathBuf,
    file: File,
    committed: bool,
}

impl AtomicFileSink {
    pub fn create(dest: PathBuf) -> io::Result<Self> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = dest.with_extension(format!("{:08x}.tmp", rand::random::<u32>()));
        let file = File::create(&tmp)?;
        Ok(AtomicFileSink {
            dest,
            tmp,
            file,
            committed: false,
        })
    }
}

impl Write for AtomicFileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl BlobSink for AtomicFileSink {
    fn commit(&mut self) -> io::Result<()> {
        if self.committed {
            return Ok(());
        }
        self.file.sync_all()?;
        fs::rename(&self.tmp, &self.dest)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for AtomicFileSink {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = fs::remove_file(&self.tmp) {
                warn!("failed to remove abandoned blob {}: {e}", self.tmp.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_write_commit_read() {
        let dir = tempfile::tempdir().unwrap();
        let conn = LocalConnector::new(dir.path());
        conn.prepare().unwrap();

        let mut sink = conn.open_content_writer("abc123").unwrap();
        sink.write_all(b"hello ").unwrap();
        sink.write_all(b"world").unwrap();
        sink.commit().unwrap();

        let mut blob = conn.open_content_reader("abc123").unwrap();
        assert_eq!(blob.len, 11);
        let mut out = String::new();
        blob.source.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn test_uncommitted_write_keeps_old_blob() {
        let dir = tempfile::tempdir().unwrap();
        let conn = LocalConnector::new(dir.path());
        conn.prepare().unwrap();

        let mut sink = conn.open_metadata_writer("fat").unwrap();
        sink.write_all(b"v1").unwrap();
        sink.commit().unwrap();

        {
            let mut sink = conn.open_metadata_writer("fat").unwrap();
            sink.write_all(b"v2-partial").unwrap();
        }

        let blob = conn.open_metadata_reader("fat").unwrap().unwrap();
        assert_eq!(blob.len, 2);
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("meta"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1, "temp file must be cleaned up");
    }

    #[test]
    fn test_missing_metadata_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let conn = LocalConnector::new(dir.path());
        conn.prepare().unwrap();
        assert!(conn.open_metadata_reader("users").unwrap().is_none());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let conn = LocalConnector::new(dir.path());
        conn.prepare().unwrap();
        conn.remove_content("never-written").unwrap();
        conn.remove_metadata("groups").unwrap();
    }

    #[test]
    fn test_identity_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let a = LocalConnector::new(dir.path());
        let b = LocalConnector::new(dir.path());
        a.prepare().unwrap();
        assert_eq!(a.identity(), b.identity());
        assert!(a.identity().starts_with("local:"));
    }

    #[test]
    fn test_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let conn = LocalConnector::new(dir.path());
        assert!(conn.open_content_reader("../secret").is_err());
    }
}
