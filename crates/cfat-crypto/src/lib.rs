//! cfat-crypto: the cipher codec under every cfat blob
//!
//! A cleartext stream is cut into fixed-size chunks of `C` bytes and each
//! chunk is sealed on its own with AES-256-GCM:
//!
//! ```text
//! cleartext:  [   C   ][   C   ][   C   ][ r ]
//! ciphertext: [ C + 16 ][ C + 16 ][ C + 16 ][ r + 16 ]
//! IV:           base    base+1    base+2   base+3
//! ```
//!
//! The IV of chunk `k` is the stream's base IV advanced by `k` increments, so
//! a base IV must never be reused across independent streams under one key.
//! Any chunk can be located and decrypted from the ciphertext length alone,
//! which is what makes [`StreamReader`] seekable.

pub mod buffer;
pub mod cipher;
pub mod error;
pub mod iv;
pub mod kdf;
pub mod password;
pub mod reader;
pub mod writer;

pub use cipher::{ChunkCipher, VolumeKey};
pub use error::CodecError;
pub use iv::Iv;
pub use kdf::{derive_volume_key, KdfParams};
pub use password::{hash_password, verify_password};
pub use reader::StreamReader;
pub use writer::{StreamSummary, StreamWriter};

/// Size of a volume key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM IV (96-bit)
pub const IV_SIZE: usize = 12;

/// Size of a GCM authentication tag
pub const TAG_SIZE: usize = 16;

/// Cleartext length of a stream whose ciphertext is `ciphertext_len` bytes.
///
/// `ciphertext_len = n * (C + TAG) + r` maps to `n * C + max(0, r - TAG)`.
pub fn cleartext_len(ciphertext_len: u64, chunk_size: usize) -> u64 {
    let sealed = (chunk_size + TAG_SIZE) as u64;
    let whole = ciphertext_len / sealed;
    let rest = ciphertext_len % sealed;
    whole * chunk_size as u64 + rest.saturating_sub(TAG_SIZE as u64)
}

/// Ciphertext length produced by sealing `cleartext_len` bytes.
pub fn ciphertext_len(cleartext_len: u64, chunk_size: usize) -> u64 {
    let chunk = chunk_size as u64;
    let whole = cleartext_len / chunk;
    let rest = cleartext_len % chunk;
    let tail = if rest == 0 { 0 } else { rest + TAG_SIZE as u64 };
    whole * (chunk + TAG_SIZE as u64) + tail
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_mapping() {
        assert_eq!(cleartext_len(0, 100), 0);
        assert_eq!(cleartext_len(116, 100), 100);
        assert_eq!(cleartext_len(116 + 16 + 7, 100), 107);
        // A tail shorter than a tag carries no cleartext
        assert_eq!(cleartext_len(116 + 9, 100), 100);

        assert_eq!(ciphertext_len(0, 100), 0);
        assert_eq!(ciphertext_len(100, 100), 116);
        assert_eq!(ciphertext_len(350, 100), 3 * 116 + 66);
    }

    #[test]
    fn test_length_mapping_inverts() {
        for chunk in [1usize, 7, 64, 4096] {
            for len in [0u64, 1, 6, 7, 8, 63, 64, 65, 10_000] {
                assert_eq!(cleartext_len(ciphertext_len(len, chunk), chunk), len);
            }
        }
    }
}
