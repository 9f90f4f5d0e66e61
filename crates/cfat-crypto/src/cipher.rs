//! AES-256-GCM chunk sealing
//!
//! Sealed chunk format (binary):
//! ```text
//! [N bytes: ciphertext][16 bytes: GCM tag]
//! ```
//!
//! The IV is never stored: it is recomputed from the stream's base IV and the
//! chunk index, so a chunk moved to another position fails authentication.

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Nonce,
};
use zeroize::Zeroize;

use crate::error::CodecError;
use crate::iv::Iv;
use crate::{KEY_SIZE, TAG_SIZE};

/// The 256-bit key shared by every stream of one filesystem. Zeroized on drop.
#[derive(Clone)]
pub struct VolumeKey {
    bytes: [u8; KEY_SIZE],
}

impl VolumeKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for VolumeKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for VolumeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// An initialized AES-256-GCM instance. Stateless per call, so one instance
/// is shared by every reader and writer of a filesystem.
#[derive(Clone)]
pub struct ChunkCipher {
    aead: Aes256Gcm,
}

impl ChunkCipher {
    pub fn new(key: &VolumeKey) -> Self {
        Self {
            aead: Aes256Gcm::new(key.as_bytes().into()),
        }
    }

    /// Encrypt `buf` in place and append the tag.
    ///
    /// `buf` should have `TAG_SIZE` bytes of spare capacity so sealing does
    /// not reallocate.
    pub fn seal_in_place(&self, iv: &Iv, chunk: u64, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        self.aead
            .encrypt_in_place(Nonce::from_slice(iv.as_bytes()), b"", buf)
            .map_err(|_| CodecError::Seal { chunk })
    }

    /// Verify and decrypt `buf` in place, truncating the tag.
    pub fn open_in_place(&self, iv: &Iv, chunk: u64, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        if buf.len() < TAG_SIZE {
            return Err(CodecError::Corrupt { chunk });
        }
        self.aead
            .decrypt_in_place(Nonce::from_slice(iv.as_bytes()), b"", buf)
            .map_err(|_| CodecError::Corrupt { chunk })
    }
}

impl std::fmt::Debug for ChunkCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCipher")
            .field("algorithm", &"AES-256-GCM")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher(fill: u8) -> ChunkCipher {
        ChunkCipher::new(&VolumeKey::from_bytes([fill; KEY_SIZE]))
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let c = cipher(42);
        let iv = Iv::from_bytes([1u8; 12]);
        let mut buf = b"hello, encrypted world!".to_vec();

        c.seal_in_place(&iv, 0, &mut buf).unwrap();
        assert_eq!(buf.len(), 23 + TAG_SIZE);
        c.open_in_place(&iv, 0, &mut buf).unwrap();

        assert_eq!(&buf, b"hello, encrypted world!");
    }

    #[test]
    fn test_seal_empty() {
        let c = cipher(42);
        let iv = Iv::from_bytes([0u8; 12]);
        let mut buf = Vec::new();

        c.seal_in_place(&iv, 0, &mut buf).unwrap();
        assert_eq!(buf.len(), TAG_SIZE);
        c.open_in_place(&iv, 0, &mut buf).unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_open_wrong_key() {
        let iv = Iv::from_bytes([0u8; 12]);
        let mut buf = b"secret data".to_vec();
        cipher(1).seal_in_place(&iv, 0, &mut buf).unwrap();

        let result = cipher(2).open_in_place(&iv, 0, &mut buf);
        assert!(matches!(result, Err(CodecError::Corrupt { chunk: 0 })));
    }

    #[test]
    fn test_open_wrong_iv() {
        let c = cipher(9);
        let iv = Iv::from_bytes([0u8; 12]);
        let mut buf = b"secret data".to_vec();
        c.seal_in_place(&iv, 0, &mut buf).unwrap();

        let result = c.open_in_place(&iv.advanced(1), 1, &mut buf);
        assert!(
            matches!(result, Err(CodecError::Corrupt { chunk: 1 })),
            "chunk sealed at position 0 must not open at position 1"
        );
    }

    #[test]
    fn test_tampered_ciphertext() {
        let c = cipher(9);
        let iv = Iv::from_bytes([3u8; 12]);
        let mut buf = b"secret data".to_vec();
        c.seal_in_place(&iv, 0, &mut buf).unwrap();
        buf[2] ^= 0xff;

        assert!(c.open_in_place(&iv, 0, &mut buf).is_err());
    }

    #[test]
    fn test_short_input_is_corrupt() {
        let c = cipher(9);
        let mut buf = vec![0u8; TAG_SIZE - 1];
        let result = c.open_in_place(&Iv::from_bytes([0u8; 12]), 5, &mut buf);
        assert!(matches!(result, Err(CodecError::Corrupt { chunk: 5 })));
    }
}
