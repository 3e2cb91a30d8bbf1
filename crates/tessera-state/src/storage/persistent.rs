use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::Storage;
use crate::error::StateError;

/// Directory-backed storage with one file per key.
///
/// File names are the hex encoding of the key. Writes go through a temporary
/// file and a rename so readers never observe a torn value.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Result<Self, StateError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StateError::Storage(e.to_string()))?;
        Ok(FileStorage { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, key: &[u8]) -> PathBuf {
        self.dir.join(hex::encode(key))
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        match fs::read(self.key_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StateError::Storage(e.to_string())),
        }
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StateError> {
        let path = self.key_path(key);
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, value).map_err(|e| StateError::Storage(e.to_string()))?;
        fs::rename(&tmp_path, &path).map_err(|e| StateError::Storage(e.to_string()))?;
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StateError> {
        match fs::remove_file(self.key_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::Storage(e.to_string())),
        }
    }

    fn keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, StateError> {
        let mut keys = Vec::new();

        for entry in fs::read_dir(&self.dir).map_err(|e| StateError::Storage(e.to_string()))? {
            let entry = entry.map_err(|e| StateError::Storage(e.to_string()))?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            // Skips temp files and lock directories
            let Ok(key) = hex::decode(name) else {
                continue;
            };
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn lock_dir(&self) -> Option<&Path> {
        Some(&self.dir)
    }
}
