//! Key derivation: Argon2id passphrase → volume key

use argon2::{Algorithm, Argon2, Params, Version};
use cfat_core::config::CryptoConfig;
use cfat_core::{CfatError, CfatResult};
use secrecy::{ExposeSecret, SecretString};

use crate::cipher::VolumeKey;
use crate::KEY_SIZE;

/// Argon2id parameters, shared by the passphrase KDF and password hashing
#[derive(Debug, Clone)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl From<&CryptoConfig> for KdfParams {
    fn from(cfg: &CryptoConfig) -> Self {
        Self {
            mem_cost_kib: cfg.argon2_mem_cost_kib,
            time_cost: cfg.argon2_time_cost,
            parallelism: cfg.argon2_parallelism,
        }
    }
}

impl KdfParams {
    pub(crate) fn argon2(&self, output_len: Option<usize>) -> CfatResult<Argon2<'static>> {
        let params = Params::new(
            self.mem_cost_kib,
            self.time_cost,
            self.parallelism,
            output_len,
        )
        .map_err(|e| CfatError::Config(format!("invalid Argon2id params: {e}")))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

/// Derive the 256-bit volume key from a passphrase and salt using Argon2id.
///
/// The salt is 16 random bytes kept in the plaintext volume header.
pub fn derive_volume_key(
    passphrase: &SecretString,
    salt: &[u8; 16],
    params: &KdfParams,
) -> CfatResult<VolumeKey> {
    let argon2 = params.argon2(Some(KEY_SIZE))?;

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut key)
        .map_err(|e| CfatError::Config(format!("Argon2id KDF failed: {e}")))?;

    Ok(VolumeKey::from_bytes(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap() -> KdfParams {
        KdfParams {
            mem_cost_kib: 64,
            time_cost: 1,
            parallelism: 2,
        }
    }

    #[test]
    fn test_same_inputs_same_key() {
        let pass = SecretString::from("open sesame");
        let a = derive_volume_key(&pass, &[9u8; 16], &cheap()).unwrap();
        let b = derive_volume_key(&pass, &[9u8; 16], &cheap()).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_salt_and_passphrase_both_matter() {
        let base = derive_volume_key(&SecretString::from("a"), &[0u8; 16], &cheap()).unwrap();
        let salted = derive_volume_key(&SecretString::from("a"), &[1u8; 16], &cheap()).unwrap();
        let other = derive_volume_key(&SecretString::from("b"), &[0u8; 16], &cheap()).unwrap();
        assert_ne!(base.as_bytes(), salted.as_bytes());
        assert_ne!(base.as_bytes(), other.as_bytes());
    }

    #[test]
    fn test_params_from_config() {
        let cfg = CryptoConfig {
            argon2_time_cost: 5,
            ..Default::default()
        };
        let params = KdfParams::from(&cfg);
        assert_eq!(params.time_cost, 5);
        assert_eq!(params.mem_cost_kib, cfg.argon2_mem_cost_kib);
    }

    #[test]
    fn test_too_little_memory_is_a_config_error() {
        let params = KdfParams {
            mem_cost_kib: 4,
            time_cost: 1,
            parallelism: 1,
        };
        let err = derive_volume_key(&SecretString::from("x"), &[0u8; 16], &params).unwrap_err();
        assert!(matches!(err, CfatError::Config(_)));
    }
}
