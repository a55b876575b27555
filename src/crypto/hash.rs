//! Cryptographic hashing utilities for the ledger
//!
//! Provides the SHA-256 digest used for block hashes, transaction IDs,
//! signing payloads and merkle tree calculations, plus the proof-of-work
//! target test.

use sha2::{Digest, Sha256};

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Computes SHA-256 hash and returns it as a hex string
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Number of leading `0` hex digits in a hash string
pub fn leading_zero_digits(hash_hex: &str) -> u32 {
    hash_hex.chars().take_while(|c| *c == '0').count() as u32
}

/// Checks if a hex hash meets the difficulty target.
/// The hash must start with `difficulty` zero hex digits.
pub fn meets_difficulty(hash_hex: &str, difficulty: u32) -> bool {
    hash_hex.len() >= difficulty as usize && leading_zero_digits(hash_hex) >= difficulty
}

/// Whether a string is a lowercase/uppercase hex digest of `bytes` length
pub fn is_hex_digest(value: &str, bytes: usize) -> bool {
    value.len() == bytes * 2 && value.chars().all(|c| c.is_ascii_hexdigit())
}
