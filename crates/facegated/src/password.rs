//! Password digests and session tokens.
//!
//! Stored digests have the form `sha256$<iterations>$<salt hex>$<digest hex>`.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

const SCHEME: &str = "sha256";
#[cfg(not(test))]
const ITERATIONS: u32 = 100_000;
#[cfg(test)]
const ITERATIONS: u32 = 1_000;
const SALT_LEN: usize = 16;
const TOKEN_LEN: usize = 32;

/// Hash `password` with a fresh random salt.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let digest = stretch(password.as_bytes(), &salt, ITERATIONS);
    format!("{SCHEME}${ITERATIONS}${}${}", to_hex(&salt), to_hex(&digest))
}

/// Check `password` against a stored digest. Malformed digests never match.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some(SCHEME), Some(iterations), Some(salt), Some(expected), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return false;
    };
    let (Ok(iterations), Some(salt), Some(expected)) =
        (iterations.parse::<u32>(), from_hex(salt), from_hex(expected))
    else {
        return false;
    };
    if iterations == 0 {
        return false;
    }

    let digest = stretch(password.as_bytes(), &salt, iterations);
    constant_time_eq(&digest, &expected)
}

/// Random opaque session token, hex encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_LEN];
    OsRng.fill_bytes(&mut bytes);
    to_hex(&bytes)
}

fn stretch(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut digest: [u8; 32] = Sha256::new()
        .chain_update(salt)
        .chain_update(password)
        .finalize()
        .into();
    for _ in 1..iterations {
        digest = Sha256::new()
            .chain_update(digest)
            .chain_update(password)
            .finalize()
            .into();
    }
    digest
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn from_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| s.get(i..i + 2).and_then(|pair| u8::from_str_radix(pair, 16).ok()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correct_password_verifies() {
        let stored = hash_password("hunter2");
        assert!(stored.starts_with(&format!("sha256${ITERATIONS}$")));
        assert!(verify_password("hunter2", &stored));
        assert!(!verify_password("hunter3", &stored));
    }

    #[test]
    fn same_password_gets_different_salts() {
        assert_ne!(hash_password("pw"), hash_password("pw"));
    }

    #[test]
    fn malformed_digest_never_matches() {
        assert!(!verify_password("pw", ""));
        assert!(!verify_password("pw", "md5$1$00$00"));
        assert!(!verify_password("pw", "sha256$0$00$00"));
        assert!(!verify_password("pw", "sha256$10$zz$00"));
        assert!(!verify_password("pw", "sha256$10$00$00$extra"));
    }

    #[test]
    fn tokens_are_64_hex_chars() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_token());
    }

    #[test]
    fn hex_round_trips() {
        assert_eq!(from_hex(&to_hex(&[0, 15, 255])), Some(vec![0, 15, 255]));
        assert_eq!(from_hex("abc"), None);
    }
}
