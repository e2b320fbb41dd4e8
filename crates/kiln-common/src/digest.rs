//! Deterministic codes for natural keys

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of `input`.
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Stable short code derived from `input`.
///
/// The same input always produces the same code, so it can serve as a natural
/// primary key for lookup tables loaded repeatedly (e.g. `app_code` from `app_name`).
/// `len` is clamped to the 64 characters of the hex digest.
pub fn short_code(input: &str, len: usize) -> String {
    let mut code = sha256_hex(input.trim());
    code.truncate(len.min(64));
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_code_is_stable() {
        let a = short_code("Ministry of Labour", 10);
        let b = short_code("  Ministry of Labour ", 10);
        assert_eq!(a, b);
        assert_eq!(a.len(), 10);
        assert_ne!(a, short_code("Ministry of Health", 10));
    }

    #[test]
    fn test_short_code_len_clamped() {
        assert_eq!(short_code("x", 500).len(), 64);
    }
}
