//! OpenDAL-backed connector for object stores.
//!
//! OpenDAL is async; the connector contract is blocking. Each connector owns
//! a small Tokio runtime and every backend call is a `block_on` on it. Reads
//! are ranged, so a codec reader fetches one sealed chunk per request.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use cfat_core::config::StorageConfig;
use cfat_core::{Blob, BlobSink, CfatError, CfatResult};
use opendal::Operator;
use tokio::runtime::Runtime;
use tracing::warn;

use crate::{check_key, Connector};

/// Access keys for an S3-compatible endpoint
#[derive(Clone)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .finish()
    }
}

pub struct OpendalConnector {
    op: Operator,
    rt: Arc<Runtime>,
    identity: String,
}

fn to_io(err: opendal::Error) -> io::Error {
    let kind = match err.kind() {
        opendal::ErrorKind::NotFound => io::ErrorKind::NotFound,
        opendal::ErrorKind::PermissionDenied => io::ErrorKind::PermissionDenied,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, err)
}

impl OpendalConnector {
    /// Wrap an existing operator. `identity` must be stable across processes.
    pub fn new(op: Operator, identity: impl Into<String>) -> io::Result<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("cfat-opendal")
            .enable_all()
            .build()?;
        Ok(OpendalConnector {
            op,
            rt: Arc::new(rt),
            identity: identity.into(),
        })
    }

    /// S3 (or any S3-compatible endpoint) with path-style addressing.
    ///
    /// If `enforce_tls` is set and the endpoint uses HTTP, this is an error.
    /// Otherwise a warning is logged for non-HTTPS endpoints.
    pub fn s3(cfg: &StorageConfig, creds: &S3Credentials) -> CfatResult<Self> {
        if cfg.endpoint.starts_with("http://") {
            if cfg.enforce_tls {
                return Err(CfatError::Config(format!(
                    "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                     Use an HTTPS endpoint or set storage.enforce_tls = false for local development.",
                    cfg.endpoint
                )));
            }
            warn!(
                endpoint = %cfg.endpoint,
                "S3 endpoint uses plaintext HTTP; credentials are transmitted unencrypted"
            );
        }

        // opendal 0.55: builders use the consuming pattern
        let builder = opendal::services::S3::default()
            .endpoint(&cfg.endpoint)
            .region(&cfg.region)
            .bucket(&cfg.bucket)
            .access_key_id(&creds.access_key_id)
            .secret_access_key(&creds.secret_access_key);

        let op = Operator::new(builder)
            .map_err(|e| CfatError::Config(format!("creating OpenDAL S3 operator: {e}")))?
            .layer(opendal::layers::LoggingLayer::default())
            .layer(
                opendal::layers::RetryLayer::new()
                    .with_max_times(5)
                    .with_jitter(),
            )
            .finish();

        Ok(Self::new(op, format!("s3:{}/{}", cfg.endpoint, cfg.bucket))?)
    }

    /// A local directory through OpenDAL's fs service.
    pub fn fs(root: &Path) -> CfatResult<Self> {
        let builder = opendal::services::Fs::default().root(&root.to_string_lossy());
        let op = Operator::new(builder)
            .map_err(|e| CfatError::Config(format!("creating OpenDAL fs operator: {e}")))?
            .finish();
        Ok(Self::new(op, format!("fs:{}", root.display()))?)
    }

    /// Process-local OpenDAL memory service.
    pub fn memory(name: &str) -> CfatResult<Self> {
        let op = Operator::new(opendal::services::Memory::default())
            .map_err(|e| CfatError::Config(format!("creating OpenDAL memory operator: {e}")))?
            .finish();
        Ok(Self::new(op, format!("opendal-memory:{name}"))?)
    }

    fn reader(&self, path: String) -> io::Result<Blob> {
        let meta = self.rt.block_on(self.op.stat(&path)).map_err(to_io)?;
        let len = meta.content_length();
        let source = OpendalSource {
            op: self.op.clone(),
            rt: self.rt.clone(),
            path,
            len,
            pos: 0,
        };
        Ok(Blob::new(source, len))
    }

    fn writer(&self, path: String) -> io::Result<Box<dyn BlobSink>> {
        let writer = self.rt.block_on(self.op.writer(&path)).map_err(to_io)?;
        Ok(Box::new(OpendalSink {
            writer: Some(writer),
            rt: self.rt.clone(),
            path,
        }))
    }

    fn delete(&self, path: &str) -> io::Result<()> {
        self.rt.block_on(self.op.delete(path)).map_err(to_io)
    }
}

impl Connector for OpendalConnector {
    fn identity(&self) -> String {
        self.identity.clone()
    }

    fn prepare(&self) -> io::Result<()> {
        self.rt.block_on(async {
            self.op.create_dir("content/").await?;
            self.op.create_dir("meta/").await
        })
        .map_err(to_io)
    }

    fn open_content_reader(&self, id: &str) -> io::Result<Blob> {
        check_key(id)?;
        self.reader(format!("content/{id}"))
    }

    fn open_content_writer(&self, id: &str) -> io::Result<Box<dyn BlobSink>> {
        check_key(id)?;
        self.writer(format!("content/{id}"))
    }

    fn open_metadata_reader(&self, table: &str) -> io::Result<Option<Blob>> {
        check_key(table)?;
        match self.reader(format!("meta/{table}")) {
            Ok(blob) => Ok(Some(blob)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn open_metadata_writer(&self, table: &str) -> io::Result<Box<dyn BlobSink>> {
        check_key(table)?;
        self.writer(format!("meta/{table}"))
    }

    fn remove_content(&self, id: &str) -> io::Result<()> {
        check_key(id)?;
        self.delete(&format!("content/{id}"))
    }

    fn remove_metadata(&self, table: &str) -> io::Result<()> {
        check_key(table)?;
        self.delete(&format!("meta/{table}"))
    }
}

/// Ranged reader over one object.
struct OpendalSource {
    op: Operator,
    rt: Arc<Runtime>,
    path: String,
    len: u64,
    pos: u64,
}

impl Read for OpendalSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.pos >= self.len {
            return Ok(0);
        }
        let end = (self.pos + buf.len() as u64).min(self.len);
        let data = self
            .rt
            .block_on(async { self.op.read_with(&self.path).range(self.pos..end).await })
            .map_err(to_io)?
            .to_vec();
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for OpendalSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(o) => i128::from(o),
            SeekFrom::Current(d) => i128::from(self.pos) + i128::from(d),
            SeekFrom::End(d) => i128::from(self.len) + i128::from(d),
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of object",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

/// Streaming object writer; the object appears only when `commit` closes it.
struct OpendalSink {
    writer: Option<opendal::Writer>,
    rt: Arc<Runtime>,
    path: String,
}

impl Write for OpendalSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::other(format!("writer for {} already closed", self.path)))?;
        self.rt
            .block_on(writer.write(buf.to_vec()))
            .map_err(to_io)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BlobSink for OpendalSink {
    fn commit(&mut self) -> io::Result<()> {
        if let Some(mut writer) = self.writer.take() {
            self.rt.block_on(writer.close()).map_err(to_io)?;
        }
        Ok(())
    }
}

impl Drop for OpendalSink {
    fn drop(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = self.rt.block_on(writer.abort()) {
                warn!("aborting upload of {} failed: {e}", self.path);
            }
        }
    }
}
