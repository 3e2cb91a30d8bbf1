use serde::{Deserialize, Serialize};
use serde_json::Value;
use tessera_core::Hash;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StateError;
use crate::lock::{KeyLock, LockConfig};
use crate::storage::Storage;

/// Which overlay a write or read goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Tentative execution ahead of consensus
    Optimistic,
    /// Re-execution of a finalized block
    Validated,
}

/// An optimistic write awaiting validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub command_hash: Hash,
    pub value: Value,
}

/// Stored record for one key: the validated value plus optimistic writes
/// that have not been validated yet
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validated: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<PendingWrite>,
}

impl StorageValue {
    /// Latest optimistic value if any, else the validated one
    pub fn latest(&self) -> Option<&Value> {
        self.pending
            .last()
            .map(|write| &write.value)
            .or(self.validated.as_ref())
    }

    pub fn apply_optimistic(&mut self, command_hash: Hash, value: Value) {
        self.pending.push(PendingWrite {
            command_hash,
            value,
        });
    }

    /// Overwrite the validated value and drop the optimistic write it settles
    pub fn apply_validated(&mut self, command_hash: Hash, value: Value) {
        self.validated = Some(value);
        self.pending.retain(|write| write.command_hash != command_hash);
    }

    /// Drop the optimistic writes of one command, returning whether any
    /// were present
    pub fn discard(&mut self, command_hash: &Hash) -> bool {
        let before = self.pending.len();
        self.pending.retain(|write| write.command_hash != *command_hash);
        self.pending.len() != before
    }
}

/// Key-value store of one contract with optimistic/validated overlay
pub struct ContractStorage {
    contract: String,
    backend: Mutex<Box<dyn Storage>>,
    lock_config: LockConfig,
}

impl ContractStorage {
    pub fn new(contract: impl Into<String>, backend: Box<dyn Storage>, lock_config: LockConfig) -> Self {
        ContractStorage {
            contract: contract.into(),
            backend: Mutex::new(backend),
            lock_config,
        }
    }

    pub fn contract(&self) -> &str {
        &self.contract
    }

    /// Write a value through the overlay selected by `mode`.
    ///
    /// The read-modify-write cycle runs under the in-process mutex and, for
    /// shared backends, the key's directory lock.
    pub async fn set(
        &self,
        key: &str,
        value: Value,
        mode: ExecutionMode,
        command_hash: Hash,
    ) -> Result<(), StateError> {
        let mut backend = self.backend.lock().await;

        let _guard = match backend.lock_dir() {
            Some(dir) => Some(
                KeyLock::new(dir, key.as_bytes())
                    .acquire(&self.lock_config)
                    .await?,
            ),
            None => None,
        };

        let mut record = Self::read_record(backend.as_ref(), key)?.unwrap_or_default();
        match mode {
            ExecutionMode::Optimistic => record.apply_optimistic(command_hash, value),
            ExecutionMode::Validated => record.apply_validated(command_hash, value),
        }

        let bytes =
            serde_json::to_vec(&record).map_err(|e| StateError::Serialization(e.to_string()))?;
        backend.put(key.as_bytes(), &bytes)?;

        debug!(
            "{} set {} ({:?}, {} pending)",
            self.contract,
            key,
            mode,
            record.pending.len()
        );
        Ok(())
    }

    /// Remove every optimistic write a command made, for commands that
    /// failed validated execution. Returns the number of keys touched.
    pub async fn discard_pending(&self, command_hash: &Hash) -> Result<usize, StateError> {
        let mut backend = self.backend.lock().await;
        let mut touched = 0;

        for raw_key in backend.keys_with_prefix(b"")? {
            let Ok(key) = String::from_utf8(raw_key) else {
                continue;
            };
            let holds_write = Self::read_record(backend.as_ref(), &key)?
                .map(|record| record.pending.iter().any(|w| w.command_hash == *command_hash))
                .unwrap_or(false);
            if !holds_write {
                continue;
            }

            let _guard = match backend.lock_dir() {
                Some(dir) => Some(
                    KeyLock::new(dir, key.as_bytes())
                        .acquire(&self.lock_config)
                        .await?,
                ),
                None => None,
            };
            // Another process may have changed the record before the lock
            let Some(mut record) = Self::read_record(backend.as_ref(), &key)? else {
                continue;
            };
            if record.discard(command_hash) {
                let bytes = serde_json::to_vec(&record)
                    .map_err(|e| StateError::Serialization(e.to_string()))?;
                backend.put(key.as_bytes(), &bytes)?;
                touched += 1;
            }
        }

        if touched > 0 {
            debug!(
                "{} discarded pending writes of {} on {} keys",
                self.contract, command_hash, touched
            );
        }
        Ok(touched)
    }

    /// Latest value, optimistic writes included
    pub async fn get(&self, key: &str) -> Result<Option<Value>, StateError> {
        Ok(self.record(key).await?.and_then(|r| r.latest().cloned()))
    }

    /// Validated value only
    pub async fn get_validated(&self, key: &str) -> Result<Option<Value>, StateError> {
        Ok(self.record(key).await?.and_then(|r| r.validated))
    }

    /// Read according to the execution mode
    pub async fn get_for(&self, key: &str, mode: ExecutionMode) -> Result<Option<Value>, StateError> {
        match mode {
            ExecutionMode::Optimistic => self.get(key).await,
            ExecutionMode::Validated => self.get_validated(key).await,
        }
    }

    pub async fn record(&self, key: &str) -> Result<Option<StorageValue>, StateError> {
        let backend = self.backend.lock().await;
        Self::read_record(backend.as_ref(), key)
    }

    /// Keys with at least one record, sorted
    pub async fn keys(&self) -> Result<Vec<String>, StateError> {
        let backend = self.backend.lock().await;
        Ok(backend
            .keys_with_prefix(b"")?
            .into_iter()
            .filter_map(|key| String::from_utf8(key).ok())
            .collect())
    }

    fn read_record(backend: &dyn Storage, key: &str) -> Result<Option<StorageValue>, StateError> {
        match backend.get(key.as_bytes())? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StateError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileStorage, MemoryStorage};
    use serde_json::json;
    use std::sync::Arc;
    use tessera_core::hash_blake3;

    fn memory_store() -> ContractStorage {
        ContractStorage::new("kv", Box::new(MemoryStorage::new()), LockConfig::default())
    }

    #[tokio::test]
    async fn test_optimistic_write_visible_only_to_get() {
        let store = memory_store();
        let h = hash_blake3(b"cmd1");

        store
            .set("a", json!(1), ExecutionMode::Optimistic, h)
            .await
            .unwrap();

        assert_eq!(store.get("a").await.unwrap(), Some(json!(1)));
        assert_eq!(store.get_validated("a").await.unwrap(), None);
        assert_eq!(
            store.get_for("a", ExecutionMode::Validated).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_validated_write_settles_matching_pending() {
        let store = memory_store();
        let h1 = hash_blake3(b"cmd1");
        let h2 = hash_blake3(b"cmd2");

        store
            .set("a", json!(1), ExecutionMode::Optimistic, h1)
            .await
            .unwrap();
        store
            .set("a", json!(2), ExecutionMode::Optimistic, h2)
            .await
            .unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(json!(2)));

        store
            .set("a", json!(1), ExecutionMode::Validated, h1)
            .await
            .unwrap();

        let record = store.record("a").await.unwrap().unwrap();
        assert_eq!(record.validated, Some(json!(1)));
        assert_eq!(record.pending.len(), 1);
        assert_eq!(record.pending[0].command_hash, h2);
        // Unvalidated write still shadows the validated value
        assert_eq!(store.get("a").await.unwrap(), Some(json!(2)));
        assert_eq!(store.get_validated("a").await.unwrap(), Some(json!(1)));

        store
            .set("a", json!(2), ExecutionMode::Validated, h2)
            .await
            .unwrap();
        let record = store.record("a").await.unwrap().unwrap();
        assert!(record.pending.is_empty());
        assert_eq!(store.get("a").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_discard_pending_unshadows_validated() {
        let store = memory_store();
        let failed = hash_blake3(b"failed");
        let other = hash_blake3(b"other");

        store
            .set("a", json!(0), ExecutionMode::Validated, hash_blake3(b"seed"))
            .await
            .unwrap();
        store
            .set("a", json!(1), ExecutionMode::Optimistic, failed)
            .await
            .unwrap();
        store
            .set("b", json!(2), ExecutionMode::Optimistic, failed)
            .await
            .unwrap();
        store
            .set("b", json!(3), ExecutionMode::Optimistic, other)
            .await
            .unwrap();

        assert_eq!(store.discard_pending(&failed).await.unwrap(), 2);
        assert_eq!(store.get("a").await.unwrap(), Some(json!(0)));
        assert_eq!(store.get("b").await.unwrap(), Some(json!(3)));
        assert_eq!(store.discard_pending(&failed).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_key() {
        let store = memory_store();
        assert_eq!(store.get("nope").await.unwrap(), None);
        assert_eq!(store.record("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_backend_releases_lock_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContractStorage::new(
            "kv",
            Box::new(FileStorage::new(dir.path()).unwrap()),
            LockConfig::default(),
        );
        let h = hash_blake3(b"cmd");

        store
            .set("k", json!({"x": 1}), ExecutionMode::Validated, h)
            .await
            .unwrap();

        let lock_path = dir.path().join(format!("{}.lock", hex::encode(b"k")));
        assert!(!lock_path.exists());

        let reopened = ContractStorage::new(
            "kv",
            Box::new(FileStorage::new(dir.path()).unwrap()),
            LockConfig::default(),
        );
        assert_eq!(
            reopened.get_validated("k").await.unwrap(),
            Some(json!({"x": 1}))
        );
        assert_eq!(reopened.keys().await.unwrap(), vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_writers_across_handles_keep_every_write() {
        let dir = tempfile::tempdir().unwrap();
        // Two handles on the same directory stand in for two processes
        let first = Arc::new(ContractStorage::new(
            "kv",
            Box::new(FileStorage::new(dir.path()).unwrap()),
            LockConfig::default(),
        ));
        let second = Arc::new(ContractStorage::new(
            "kv",
            Box::new(FileStorage::new(dir.path()).unwrap()),
            LockConfig::default(),
        ));

        let mut tasks = Vec::new();
        for i in 0..10u32 {
            let store = if i % 2 == 0 { first.clone() } else { second.clone() };
            tasks.push(tokio::spawn(async move {
                let h = hash_blake3(&i.to_le_bytes());
                store
                    .set("shared", json!(i), ExecutionMode::Optimistic, h)
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let record = first.record("shared").await.unwrap().unwrap();
        assert_eq!(record.pending.len(), 10);
    }
}
