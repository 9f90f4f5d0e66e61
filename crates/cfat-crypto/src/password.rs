//! User password hashes.
//!
//! The engine never sees a raw password: callers hand in a pre-hash (see
//! `cfat_fs::prehash`) and only an Argon2id PHC string of that pre-hash is
//! stored.

use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use cfat_core::{CfatError, CfatResult};

use crate::kdf::KdfParams;

/// Hash a caller-supplied pre-hash into a PHC string.
pub fn hash_password(prehash: &str, params: &KdfParams) -> CfatResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = params.argon2(None)?;
    let phc = argon2
        .hash_password(prehash.as_bytes(), &salt)
        .map_err(|e| CfatError::Config(format!("password hashing failed: {e}")))?;
    Ok(phc.to_string())
}

/// Check a pre-hash against a stored PHC string. Malformed hashes never match.
pub fn verify_password(prehash: &str, phc: &str) -> bool {
    match PasswordHash::new(phc) {
        Ok(parsed) => Argon2::default()
            .verify_password(prehash.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::warn!("stored password hash is malformed: {e}");
            false
        }
    }
}
