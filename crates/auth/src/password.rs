//! Argon2id password hashing and constant-time verification.
//!
//! Production parameters: 64 MiB memory, time cost 3, parallelism 4,
//! 32-byte output.  Verification recomputes the hash with the stored salt
//! and parameters and compares outputs in constant time, so timing reveals
//! nothing about where a mismatch occurs.

use argon2::password_hash::{PasswordHash, PasswordHasher, SaltString, rand_core::OsRng};
use argon2::{Algorithm, Argon2, Params, Version};
use subtle::ConstantTimeEq;

use crate::{AuthError, AuthResult};

const MEMORY_KIB: u32 = 64 * 1024;
const TIME_COST: u32 = 3;
const PARALLELISM: u32 = 4;
const OUTPUT_LEN: usize = 32;

fn hasher(params: Params) -> Argon2<'static> {
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
}

fn production_params() -> AuthResult<Params> {
    Params::new(MEMORY_KIB, TIME_COST, PARALLELISM, Some(OUTPUT_LEN))
        .map_err(|e| AuthError::Hashing(e.to_string()))
}

/// Hash a password into a PHC string (`$argon2id$v=19$m=65536,t=3,p=4$…`).
/// CPU/memory heavy — call from `spawn_blocking` in async contexts.
pub fn hash_password(password: &str) -> AuthResult<String> {
    hash_password_with(password, production_params()?)
}

pub(crate) fn hash_password_with(password: &str, params: Params) -> AuthResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = hasher(params)
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| AuthError::Hashing(e.to_string()))?;
    Ok(hash.to_string())
}

/// Verify `password` against a stored PHC hash.
///
/// The salt, version, and cost parameters come from the stored hash, so
/// records hashed under older parameters keep verifying after a parameter
/// bump.  Output comparison is constant-time.
pub fn verify_password(password: &str, stored: &str) -> AuthResult<bool> {
    let parsed = PasswordHash::new(stored).map_err(|e| AuthError::Hashing(e.to_string()))?;
    let params =
        Params::try_from(&parsed).map_err(|e| AuthError::Hashing(e.to_string()))?;

    let expected = parsed
        .hash
        .ok_or_else(|| AuthError::Hashing("stored hash has no output".to_string()))?;
    let salt = parsed
        .salt
        .ok_or_else(|| AuthError::Hashing("stored hash has no salt".to_string()))?;

    let computed = hasher(params)
        .hash_password_customized(
            password.as_bytes(),
            Some(parsed.algorithm),
            parsed.version,
            Params::try_from(&parsed).map_err(|e| AuthError::Hashing(e.to_string()))?,
            salt,
        )
        .map_err(|e| AuthError::Hashing(e.to_string()))?;
    let computed = computed
        .hash
        .ok_or_else(|| AuthError::Hashing("computed hash has no output".to_string()))?;

    Ok(computed.as_bytes().ct_eq(expected.as_bytes()).into())
}

#[cfg(test)]
pub(crate) fn test_params() -> Params {
    // Small costs keep the test suite fast; production paths never use this.
    Params::new(1024, 1, 1, Some(OUTPUT_LEN)).expect("valid test params")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_accepts_correct_password_only() {
        let hash = hash_password_with("correct horse battery staple", test_params()).unwrap();
        assert!(verify_password("correct horse battery staple", &hash).unwrap());
        assert!(!verify_password("correct horse battery stapl", &hash).unwrap());
        assert!(!verify_password("", &hash).unwrap());
    }

    #[test]
    fn hashes_are_salted() {
        let a = hash_password_with("same password", test_params()).unwrap();
        let b = hash_password_with("same password", test_params()).unwrap();
        assert_ne!(a, b, "fresh salt per hash");
        assert!(verify_password("same password", &a).unwrap());
        assert!(verify_password("same password", &b).unwrap());
    }

    #[test]
    fn phc_string_never_contains_plaintext() {
        let hash = hash_password_with("hunter2hunter2", test_params()).unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(!hash.contains("hunter2"));
    }

    #[test]
    fn production_parameters_meet_the_floor() {
        // One full-cost hash to pin the production parameters.
        let hash = hash_password("a long enough password").unwrap();
        assert!(hash.contains("m=65536"), "memory cost must be 64 MiB");
        assert!(hash.contains("t=3"));
        assert!(hash.contains("p=4"));
        assert!(verify_password("a long enough password", &hash).unwrap());
    }

    #[test]
    fn malformed_hash_is_an_error_not_false() {
        assert!(verify_password("pw", "not-a-phc-string").is_err());
    }
}
