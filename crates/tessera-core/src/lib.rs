//! Tessera Core - Value objects, cryptography, and serialization
//!
//! This crate provides the commands, pBlocks and blocks exchanged between
//! validators, together with the hashing and signing primitives they rely on.

pub mod crypto;
pub mod error;
pub mod serialize;
pub mod types;

pub use crypto::{hash_blake3, sign, verify, Hash, KeyPair, PublicKey, SecretKey, Sig, ValidatorId};
pub use error::CoreError;
pub use types::*;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
