//! The plaintext volume header.
//!
//! Everything needed to turn a passphrase into the volume key and to read
//! the sealed tables back: the KDF salt and parameters, the base IV of the
//! metadata tables and the chunk sizes the volume was created with. None of
//! it is secret. It lives in the metadata namespace as `volume`, next to the
//! sealed `fat`, `users` and `groups` tables.

use std::io::{Read, Write};

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use cfat_crypto::{Iv, KdfParams};
use cfat_fs::FsOptions;
use cfat_storage::Connector;
use rand::RngCore;
use serde::{Deserialize, Serialize};

pub const VOLUME_TABLE: &str = "volume";

const HEADER_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeHeader {
    pub version: u32,
    /// Argon2id salt, base64
    pub salt: String,
    pub base_iv: Iv,
    pub content_chunk_size: usize,
    pub metadata_chunk_size: usize,
    pub argon2_mem_cost_kib: u32,
    pub argon2_time_cost: u32,
    pub argon2_parallelism: u32,
}

impl VolumeHeader {
    /// A header for a new volume: fresh salt and base IV, sizes from `opts`.
    pub fn generate(opts: &FsOptions) -> Self {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        VolumeHeader {
            version: HEADER_VERSION,
            salt: B64.encode(salt),
            base_iv: Iv::random(),
            content_chunk_size: opts.content_chunk_size,
            metadata_chunk_size: opts.metadata_chunk_size,
            argon2_mem_cost_kib: opts.kdf.mem_cost_kib,
            argon2_time_cost: opts.kdf.time_cost,
            argon2_parallelism: opts.kdf.parallelism,
        }
    }

    pub fn salt(&self) -> Result<[u8; 16]> {
        let bytes = B64.decode(&self.salt).context("volume salt is not base64")?;
        bytes
            .try_into()
            .map_err(|b: Vec<u8>| anyhow::anyhow!("volume salt is {} bytes, expected 16", b.len()))
    }

    pub fn kdf(&self) -> KdfParams {
        KdfParams {
            mem_cost_kib: self.argon2_mem_cost_kib,
            time_cost: self.argon2_time_cost,
            parallelism: self.argon2_parallelism,
        }
    }

    /// Pin the volume's own sizes and KDF over whatever the config says.
    pub fn apply(&self, opts: &mut FsOptions) {
        opts.content_chunk_size = self.content_chunk_size;
        opts.metadata_chunk_size = self.metadata_chunk_size;
        opts.kdf = self.kdf();
    }

    /// `None` when the backend holds no volume.
    pub fn load(conn: &dyn Connector) -> Result<Option<Self>> {
        let Some(mut blob) = conn
            .open_metadata_reader(VOLUME_TABLE)
            .context("opening volume header")?
        else {
            return Ok(None);
        };
        let mut raw = Vec::new();
        blob.source
            .read_to_end(&mut raw)
            .context("reading volume header")?;
        let header: VolumeHeader =
            serde_json::from_slice(&raw).context("parsing volume header")?;
        if header.version != HEADER_VERSION {
            bail!("unsupported volume header version {}", header.version);
        }
        Ok(Some(header))
    }

    pub fn store(&self, conn: &dyn Connector) -> Result<()> {
        let mut sink = conn
            .open_metadata_writer(VOLUME_TABLE)
            .context("opening volume header for writing")?;
        serde_json::to_writer_pretty(&mut sink, self).context("encoding volume header")?;
        sink.flush()?;
        sink.commit().context("publishing volume header")?;
        Ok(())
    }
}
