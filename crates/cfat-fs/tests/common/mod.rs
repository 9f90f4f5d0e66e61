//! Shared fixtures: an in-memory backend, a throwaway cache directory and
//! cheap Argon2 parameters.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use cfat_core::CfatResult;
use cfat_crypto::{ChunkCipher, Iv, KdfParams, VolumeKey};
use cfat_fs::{prehash, CacheRegistry, Filesystem, FsOptions};
use cfat_storage::MemoryConnector;
use tempfile::TempDir;

pub const CHUNK: usize = 64;

pub struct Harness {
    pub conn: MemoryConnector,
    pub cache_dir: TempDir,
    pub registry: CacheRegistry,
    pub sync_every: u64,
}

impl Harness {
    pub fn new() -> Self {
        Harness {
            conn: MemoryConnector::new("test"),
            cache_dir: tempfile::tempdir().expect("cache dir"),
            registry: CacheRegistry::new(),
            sync_every: 0,
        }
    }

    pub fn with_sync_every(mut self, n: u64) -> Self {
        self.sync_every = n;
        self
    }

    pub fn opts(&self) -> FsOptions {
        FsOptions {
            content_chunk_size: CHUNK,
            metadata_chunk_size: 128,
            kdf: fast_kdf(),
            cache_dir: self.cache_path(),
            sync_every: self.sync_every,
        }
    }

    pub fn cache_path(&self) -> PathBuf {
        self.cache_dir.path().to_path_buf()
    }

    pub fn create(&self) -> Filesystem {
        Filesystem::create(
            Arc::new(self.conn.clone()),
            cipher(1),
            base_iv(),
            self.opts(),
            &self.registry,
            &prehash("root", "rootpw"),
        )
        .expect("create filesystem")
    }

    pub fn open(&self) -> CfatResult<Filesystem> {
        self.open_with(&self.registry, 1)
    }

    /// Open as a fresh process would: its own registry.
    pub fn open_fresh_process(&self) -> CfatResult<Filesystem> {
        self.open_with(&CacheRegistry::new(), 1)
    }

    pub fn open_with(&self, registry: &CacheRegistry, key: u8) -> CfatResult<Filesystem> {
        Filesystem::open(
            Arc::new(self.conn.clone()),
            cipher(key),
            base_iv(),
            self.opts(),
            registry,
        )
    }
}

pub fn fast_kdf() -> KdfParams {
    KdfParams {
        mem_cost_kib: 8,
        time_cost: 1,
        parallelism: 1,
    }
}

pub fn cipher(key: u8) -> ChunkCipher {
    ChunkCipher::new(&VolumeKey::from_bytes([key; 32]))
}

pub fn base_iv() -> Iv {
    Iv::from_bytes([3u8; 12])
}

/// `len` bytes of a recognizable pattern
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
