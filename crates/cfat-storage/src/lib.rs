//! cfat-storage: named-blob backends for cfat
//!
//! A [`Connector`] stores two families of blobs: file content keyed by dirent
//! id and metadata keyed by table name. It knows nothing about encryption;
//! everything it stores has already been sealed by the cipher codec.

pub mod local;
pub mod memory;
pub mod operator;

use std::io;
use std::sync::Arc;

use cfat_core::config::{BackendKind, StorageConfig};
use cfat_core::{Blob, BlobSink, CfatError, CfatResult};

pub use local::LocalConnector;
pub use memory::MemoryConnector;
pub use operator::{OpendalConnector, S3Credentials};

/// The byte-storage contract the engine and codec depend on.
pub trait Connector: Send + Sync {
    /// Stable identifier of this backend instance.
    fn identity(&self) -> String;

    /// Idempotent initialization (create root directories, ...).
    fn prepare(&self) -> io::Result<()>;

    fn open_content_reader(&self, id: &str) -> io::Result<Blob>;

    fn open_content_writer(&self, id: &str) -> io::Result<Box<dyn BlobSink>>;

    /// `None` when the table has never been written.
    fn open_metadata_reader(&self, table: &str) -> io::Result<Option<Blob>>;

    fn open_metadata_writer(&self, table: &str) -> io::Result<Box<dyn BlobSink>>;

    /// Removing a blob that does not exist is not an error.
    fn remove_content(&self, id: &str) -> io::Result<()>;

    fn remove_metadata(&self, table: &str) -> io::Result<()>;

    fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

impl<C: Connector + ?Sized> Connector for Arc<C> {
    fn identity(&self) -> String {
        (**self).identity()
    }
    fn prepare(&self) -> io::Result<()> {
        (**self).prepare()
    }
    fn open_content_reader(&self, id: &str) -> io::Result<Blob> {
        (**self).open_content_reader(id)
    }
    fn open_content_writer(&self, id: &str) -> io::Result<Box<dyn BlobSink>> {
        (**self).open_content_writer(id)
    }
    fn open_metadata_reader(&self, table: &str) -> io::Result<Option<Blob>> {
        (**self).open_metadata_reader(table)
    }
    fn open_metadata_writer(&self, table: &str) -> io::Result<Box<dyn BlobSink>> {
        (**self).open_metadata_writer(table)
    }
    fn remove_content(&self, id: &str) -> io::Result<()> {
        (**self).remove_content(id)
    }
    fn remove_metadata(&self, table: &str) -> io::Result<()> {
        (**self).remove_metadata(table)
    }
    fn close(&self) -> io::Result<()> {
        (**self).close()
    }
}

/// Reject keys that could escape the backend's namespace.
pub(crate) fn check_key(key: &str) -> io::Result<()> {
    let bad = key.is_empty()
        || key.contains('/')
        || key.contains('\\')
        || key.starts_with('.')
        || key.chars().any(char::is_control);
    if bad {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid blob key: {key:?}"),
        ));
    }
    Ok(())
}

/// Build the connector a config asks for.
pub fn connect(
    cfg: &StorageConfig,
    credentials: Option<&S3Credentials>,
) -> CfatResult<Arc<dyn Connector>> {
    let connector: Arc<dyn Connector> = match cfg.backend {
        BackendKind::Local => Arc::new(LocalConnector::new(cfat_core::config::expand_home(
            &cfg.path,
        ))),
        BackendKind::Memory => Arc::new(MemoryConnector::new("config")),
        BackendKind::Fs => Arc::new(OpendalConnector::fs(&cfat_core::config::expand_home(
            &cfg.path,
        ))?),
        BackendKind::S3 => {
            let creds = credentials.ok_or_else(|| {
                CfatError::Config("s3 backend requires access credentials".into())
            })?;
            Arc::new(OpendalConnector::s3(cfg, creds)?)
        }
    };
    Ok(connector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_key() {
        assert!(check_key("fat").is_ok());
        assert!(check_key("3fa9c2d1e0b84a77").is_ok());
        assert!(check_key("").is_err());
        assert!(check_key("../etc").is_err());
        assert!(check_key("a/b").is_err());
        assert!(check_key(".hidden").is_err());
    }

    #[test]
    fn test_connect_memory() {
        let cfg = StorageConfig {
            backend: BackendKind::Memory,
            ..Default::default()
        };
        let conn = connect(&cfg, None).unwrap();
        assert!(conn.identity().starts_with("memory:"));
    }

    #[test]
    fn test_connect_s3_requires_credentials() {
        let cfg = StorageConfig {
            backend: BackendKind::S3,
            ..Default::default()
        };
        assert!(matches!(connect(&cfg, None), Err(CfatError::Config(_))));
    }
}
