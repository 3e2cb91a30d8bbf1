pub mod memory;
pub mod persistent;

use std::path::Path;

use crate::error::StateError;

/// Raw byte storage behind a contract's key-value store
pub trait Storage: Send + Sync {
    /// Get a value by key
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateError>;

    /// Put a key-value pair
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StateError>;

    /// Delete a key
    fn delete(&mut self, key: &[u8]) -> Result<(), StateError>;

    /// Check if a key exists
    fn exists(&self, key: &[u8]) -> Result<bool, StateError> {
        Ok(self.get(key)?.is_some())
    }

    /// Get all keys with a given prefix
    fn keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, StateError>;

    /// Directory holding per-key lock directories, if the backend is shared
    /// with other processes
    fn lock_dir(&self) -> Option<&Path> {
        None
    }
}

pub use memory::MemoryStorage;
pub use persistent::FileStorage;
