use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tessera_core::{hash_blake3, Hash};
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::StateError;

/// Content-addressed byte store; the handle is the blake3 hash of the bytes
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bytes: Vec<u8>) -> Result<Hash, StateError>;

    async fn get(&self, handle: &Hash) -> Result<Option<Vec<u8>>, StateError>;

    async fn contains(&self, handle: &Hash) -> Result<bool, StateError> {
        Ok(self.get(handle).await?.is_some())
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<Hash, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<Hash, StateError> {
        let handle = hash_blake3(&bytes);
        self.blobs.write().await.entry(handle).or_insert(bytes);
        Ok(handle)
    }

    async fn get(&self, handle: &Hash) -> Result<Option<Vec<u8>>, StateError> {
        Ok(self.blobs.read().await.get(handle).cloned())
    }
}

/// Blobs stored as `<dir>/<hex handle>`
pub struct FsBlobStore {
    dir: PathBuf,
}

impl FsBlobStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StateError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(FsBlobStore { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, handle: &Hash) -> PathBuf {
        self.dir.join(handle.to_hex())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<Hash, StateError> {
        let handle = hash_blake3(&bytes);
        let path = self.blob_path(&handle);
        if fs::try_exists(&path).await? {
            return Ok(handle);
        }

        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, &bytes).await?;
        fs::rename(&tmp_path, &path).await?;
        Ok(handle)
    }

    async fn get(&self, handle: &Hash) -> Result<Option<Vec<u8>>, StateError> {
        let bytes = match fs::read(self.blob_path(handle)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if hash_blake3(&bytes) != *handle {
            return Err(StateError::CorruptBlob(handle.to_hex()));
        }
        Ok(Some(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_content_addressed() {
        let store = MemoryBlobStore::new();
        let handle = store.put(b"hello".to_vec()).await.unwrap();

        assert_eq!(handle, hash_blake3(b"hello"));
        assert_eq!(store.get(&handle).await.unwrap(), Some(b"hello".to_vec()));
        assert!(!store.contains(&hash_blake3(b"other")).await.unwrap());
    }

    #[tokio::test]
    async fn test_fs_store_persists_and_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).await.unwrap();

        let handle = store.put(b"block bytes".to_vec()).await.unwrap();
        // Storing again is a no-op
        assert_eq!(store.put(b"block bytes".to_vec()).await.unwrap(), handle);

        let reopened = FsBlobStore::open(dir.path()).await.unwrap();
        assert_eq!(
            reopened.get(&handle).await.unwrap(),
            Some(b"block bytes".to_vec())
        );

        std::fs::write(dir.path().join(handle.to_hex()), b"tampered").unwrap();
        assert!(matches!(
            reopened.get(&handle).await,
            Err(StateError::CorruptBlob(_))
        ));
    }
}
