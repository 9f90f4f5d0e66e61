use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CfatError, CfatResult};

/// Top-level configuration (loaded from cfat.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CfatConfig {
    pub storage: StorageConfig,
    pub crypto: CryptoConfig,
    pub cache: CacheConfig,
    pub log: LogConfig,
}

impl CfatConfig {
    /// Load a config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> CfatResult<Self> {
        if !path.exists() {
            tracing::warn!("config file not found: {}  (using defaults)", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| CfatError::Config(format!("parsing {}: {e}", path.display())))
    }

    /// Reject values the codec or engine cannot work with.
    pub fn validate(&self) -> CfatResult<()> {
        if self.crypto.content_chunk_size == 0 || self.crypto.metadata_chunk_size == 0 {
            return Err(CfatError::Config("chunk sizes must be non-zero".into()));
        }
        if self.crypto.argon2_parallelism == 0 || self.crypto.argon2_time_cost == 0 {
            return Err(CfatError::Config(
                "argon2 time cost and parallelism must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Which backend connector to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Plain directory on local disk
    Local,
    /// Process-local, lost on exit
    Memory,
    /// S3-compatible object store through OpenDAL
    S3,
    /// Local directory through OpenDAL's fs service
    Fs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: BackendKind,
    /// Root directory for the local and fs backends
    pub path: PathBuf,
    /// S3 endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// Bucket name
    pub bucket: String,
    /// Refuse plaintext HTTP endpoints
    pub enforce_tls: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            path: PathBuf::from("~/.local/share/cfat/volume"),
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "cfat".into(),
            enforce_tls: false,
        }
    }
}

/// Codec and password hashing parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Cleartext bytes per sealed chunk for file content (default: 4 MiB)
    pub content_chunk_size: usize,
    /// Cleartext bytes per sealed chunk for metadata tables (default: 64 KiB)
    pub metadata_chunk_size: usize,
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            content_chunk_size: 4 * 1024 * 1024,
            metadata_chunk_size: 64 * 1024,
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
        }
    }
}

/// Write-back metadata cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding cache snapshots, one per backend identity
    pub dir: PathBuf,
    /// Full metadata sync after this many cached mutations (0 = only on close)
    pub sync_every: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("~/.cache/cfat"),
            sync_every: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

/// Expand a leading `~/` against `$HOME`.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
