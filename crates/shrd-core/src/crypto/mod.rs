//! Cryptographic primitives for shrd.
//!
//! This module provides:
//! - Ed25519 key pairs for device identity
//! - The encrypted, authenticated [`channel`] wrapping every transfer connection
//! - SHA-256 for file integrity
//! - xxHash for fast chunk verification
//!
//! ## Security Model
//!
//! - Every connection starts with an ephemeral X25519 exchange, so each
//!   connection gets fresh keys
//! - Both sides sign the handshake transcript with their long-term Ed25519 key
//! - Paired devices are checked against the key pinned at pairing time
//! - All traffic after the handshake is sealed with ChaCha20-Poly1305

pub mod channel;
mod identity;

pub use channel::{PeerIdentity, PeerVerifier, SecureChannel, SealedReader, SealedWriter};
pub use identity::DeviceIdentity;

use sha2::{Digest, Sha256};

/// Identifier of the full-file digest carried in transfer headers.
pub const DIGEST_ALGORITHM: &str = "sha256";

/// Compute SHA-256 hash of data.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Lowercase hex encoding.
#[must_use]
pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Compute xxHash64 for fast chunk verification.
pub fn xxhash64(data: &[u8]) -> u64 {
    xxhash_rust::xxh64::xxh64(data, 0)
}

/// Constant-time comparison of two byte slices.
///
/// Returns `true` if the slices are equal, `false` otherwise.
/// This function takes the same amount of time regardless of where
/// the first difference occurs, preventing timing attacks.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Generate cryptographically secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;

    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Short code shown to users so they can confirm they are pairing with
/// the right machine.
///
/// Format is `XXXX-XXXX`: the first eight upper-case hex characters of
/// `sha256("{device_id}:{ip}:{port}")`.
#[must_use]
pub fn pairing_code(device_id: &str, ip: std::net::IpAddr, port: u16) -> String {
    let hash = sha256(format!("{device_id}:{ip}:{port}").as_bytes());
    let hex = to_hex(&hash[..4]).to_uppercase();
    format!("{}-{}", &hex[..4], &hex[4..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_value() {
        assert_eq!(
            to_hex(&sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_xxhash64_detects_flip() {
        let data = b"chunk payload".to_vec();
        let mut flipped = data.clone();
        flipped[3] ^= 0x01;
        assert_ne!(xxhash64(&data), xxhash64(&flipped));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"same", b"same"));
        assert!(!constant_time_eq(b"same", b"diff"));
        assert!(!constant_time_eq(b"short", b"longer"));
    }

    #[test]
    fn test_pairing_code_format() {
        let ip = "192.168.1.20".parse().unwrap();
        let code = pairing_code("device-1", ip, 52637);

        assert_eq!(code.len(), 9);
        assert_eq!(&code[4..5], "-");
        assert!(code
            .chars()
            .filter(|c| *c != '-')
            .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
        assert_eq!(code, pairing_code("device-1", ip, 52637));
        assert_ne!(code, pairing_code("device-1", ip, 52638));
    }

    #[test]
    fn test_random_bytes_unique() {
        assert_ne!(random_bytes::<32>(), random_bytes::<32>());
    }
}
