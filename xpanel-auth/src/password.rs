//! Salted credential hashing.
//!
//! PBKDF2-HMAC-SHA256 with the iteration count embedded in the stored string
//! (`pbkdf2-sha256$<iterations>$<base64 dk>`), so hashes written under an
//! older cost parameter stay verifiable after the default is raised.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use sha2::Sha256;
use xpanel_core::{Error, Result};

const SCHEME: &str = "pbkdf2-sha256";
const DEFAULT_ITERATIONS: u32 = 4096;
const SALT_LEN: usize = 16;
const DK_LEN: usize = 32;

/// Fresh random salt, base64-encoded for storage.
pub fn generate_salt() -> String {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    B64.encode(salt)
}

/// Hash `password` under `salt_b64` at the current default cost.
pub fn hash_password(password: &str, salt_b64: &str) -> Result<String> {
    hash_with_iterations(password, salt_b64, DEFAULT_ITERATIONS)
}

fn hash_with_iterations(password: &str, salt_b64: &str, iterations: u32) -> Result<String> {
    let salt = B64
        .decode(salt_b64)
        .map_err(|_| Error::internal("stored salt is not valid base64"))?;
    let mut dk = [0u8; DK_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut dk);
    Ok(format!("{SCHEME}${iterations}${}", B64.encode(dk)))
}

/// Constant-shape verification: recompute under the stored cost parameter
/// and compare. Malformed stored hashes never verify.
pub fn verify_password(password: &str, salt_b64: &str, stored: &str) -> bool {
    let mut parts = stored.splitn(3, '$');
    let (Some(scheme), Some(iters), Some(_dk)) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    if scheme != SCHEME {
        return false;
    }
    let Ok(iterations) = iters.parse::<u32>() else {
        return false;
    };
    match hash_with_iterations(password, salt_b64, iterations) {
        Ok(candidate) => constant_time_eq(candidate.as_bytes(), stored.as_bytes()),
        Err(_) => false,
    }
}

/// 12 characters from `[A-Za-z0-9]`, CSPRNG-sampled, for password resets.
pub fn generate_password() -> String {
    (0..12)
        .map(|_| OsRng.sample(rand::distributions::Alphanumeric) as char)
        .collect()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn hash_is_deterministic_per_salt() {
        let salt = generate_salt();
        let a = hash_password("secret", &salt).unwrap();
        let b = hash_password("secret", &salt).unwrap();
        assert_eq!(a, b);

        let other_salt = generate_salt();
        let c = hash_password("secret", &other_salt).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn stored_format_carries_cost() {
        let salt = generate_salt();
        let hash = hash_password("secret", &salt).unwrap();
        assert!(hash.starts_with("pbkdf2-sha256$4096$"));
    }

    #[test]
    fn old_cost_parameter_remains_verifiable() {
        let salt = generate_salt();
        let legacy = hash_with_iterations("secret", &salt, 1000).unwrap();
        assert!(verify_password("secret", &salt, &legacy));
        assert!(!verify_password("wrong", &salt, &legacy));
    }

    #[test]
    fn malformed_stored_hash_never_verifies() {
        let salt = generate_salt();
        assert!(!verify_password("secret", &salt, "not-a-hash"));
        assert!(!verify_password("secret", &salt, "md5$10$abcd"));
        assert!(!verify_password("secret", &salt, "pbkdf2-sha256$NaN$abcd"));
        assert!(!verify_password("secret", "###", "pbkdf2-sha256$4096$abcd"));
    }

    #[test]
    fn generated_passwords_are_alphanumeric_len_12() {
        for _ in 0..32 {
            let p = generate_password();
            assert_eq!(p.len(), 12);
            assert!(p.chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    proptest! {
        #[test]
        fn verify_accepts_only_the_original(p1 in "[ -~]{1,40}", p2 in "[ -~]{1,40}") {
            let salt = generate_salt();
            let hash = hash_password(&p1, &salt).unwrap();
            prop_assert!(verify_password(&p1, &salt, &hash));
            prop_assert_eq!(verify_password(&p2, &salt, &hash), p1 == p2);
        }
    }
}
