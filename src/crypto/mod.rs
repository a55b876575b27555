//! Cryptographic utilities for the ledger
//!
//! This module provides:
//! - SHA-256 hashing and the proof-of-work target test
//! - ECDSA key management (secp256k1) and address derivation
//! - Merkle roots over transaction leaves

pub mod hash;
pub mod keys;
pub mod merkle;

pub use hash::{is_hex_digest, leading_zero_digits, meets_difficulty, sha256, sha256_hex};
pub use keys::{
    address_from_public_key_hex, public_key_from_hex, public_key_to_address, sign_message,
    verify_signature, KeyError, KeyPair,
};
pub use merkle::calculate_merkle_root;
