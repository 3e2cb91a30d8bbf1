pub mod hash;
pub mod identity;

pub use hash::{hash_blake3, Hash};
pub use identity::{sign, verify, KeyPair, PublicKey, SecretKey, Sig, ValidatorId};
