//! Per-chunk IV counter.
//!
//! An [`Iv`] is a 96-bit counter whose byte 0 is the least significant digit:
//! incrementing bumps byte 0 and carries into byte 1 on overflow, and so on.
//! Chunk `k` of a stream is sealed under `base.advanced(k)`.

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::IV_SIZE;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Iv([u8; IV_SIZE]);

impl Iv {
    pub fn from_bytes(bytes: [u8; IV_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; IV_SIZE] {
        &self.0
    }

    /// A fresh random base IV.
    pub fn random() -> Self {
        let mut bytes = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Advance by one, carrying from byte 0 upward. Wraps at 2^96.
    pub fn increment(&mut self) {
        for byte in self.0.iter_mut() {
            let (next, overflow) = byte.overflowing_add(1);
            *byte = next;
            if !overflow {
                break;
            }
        }
    }

    /// Advance by `n` in one pass; same result as `n` calls to [`increment`](Self::increment).
    pub fn advance(&mut self, n: u64) {
        let mut carry = u128::from(n);
        for byte in self.0.iter_mut() {
            if carry == 0 {
                break;
            }
            let sum = u128::from(*byte) + (carry & 0xff);
            *byte = sum as u8;
            carry = (carry >> 8) + (sum >> 8);
        }
    }

    pub fn advanced(mut self, n: u64) -> Self {
        self.advance(n);
        self
    }

    /// XOR with a per-write salt, giving a fresh base for one stream.
    pub fn masked(mut self, salt: &[u8; IV_SIZE]) -> Self {
        for (byte, s) in self.0.iter_mut().zip(salt) {
            *byte ^= s;
        }
        self
    }

    fn to_base64(self) -> String {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        STANDARD.encode(self.0)
    }

    fn from_base64(s: &str) -> Option<Self> {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        let bytes = STANDARD.decode(s).ok()?;
        let bytes: [u8; IV_SIZE] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl std::fmt::Debug for Iv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Iv({})", self.to_base64())
    }
}

impl Serialize for Iv {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for Iv {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Iv::from_base64(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid IV encoding: {s:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_increment_carries_upward() {
        let mut iv = Iv::from_bytes([0xff, 0xff, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        iv.increment();
        assert_eq!(iv.as_bytes(), &[0, 0, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_increment_wraps() {
        let mut iv = Iv::from_bytes([0xff; IV_SIZE]);
        iv.increment();
        assert_eq!(iv.as_bytes(), &[0u8; IV_SIZE]);
    }

    #[test]
    fn test_advance_large_count() {
        let iv = Iv::from_bytes([0u8; IV_SIZE]).advanced(0x0102_0304);
        assert_eq!(&iv.as_bytes()[..5], &[0x04, 0x03, 0x02, 0x01, 0x00]);
    }

    #[test]
    fn test_serde_as_base64() {
        let iv = Iv::from_bytes([7u8; IV_SIZE]);
        let json = serde_json::to_string(&iv).unwrap();
        assert!(json.starts_with('"'));
        let back: Iv = serde_json::from_str(&json).unwrap();
        assert_eq!(back, iv);

        assert!(serde_json::from_str::<Iv>("\"AAAA\"").is_err());
    }

    proptest! {
        #[test]
        fn advance_matches_repeated_increment(bytes in any::<[u8; IV_SIZE]>(), n in 0u64..2048) {
            let mut stepped = Iv::from_bytes(bytes);
            for _ in 0..n {
                stepped.increment();
            }
            prop_assert_eq!(Iv::from_bytes(bytes).advanced(n), stepped);
        }

        #[test]
        fn advance_is_additive(bytes in any::<[u8; IV_SIZE]>(), a in any::<u32>(), b in any::<u32>()) {
            let split = Iv::from_bytes(bytes).advanced(u64::from(a)).advanced(u64::from(b));
            let joined = Iv::from_bytes(bytes).advanced(u64::from(a) + u64::from(b));
            prop_assert_eq!(split, joined);
        }
    }
}
