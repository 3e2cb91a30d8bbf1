use std::path::{Path, PathBuf};

use tessera_core::{BlockInfo, Hash};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StateError;

/// Newline separated hex handles of finalized blocks, oldest first.
///
/// The block number of an entry is its 1-based line number.
pub struct BlockIndex {
    path: Option<PathBuf>,
    handles: Mutex<Vec<Hash>>,
}

impl BlockIndex {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StateError> {
        let path = path.as_ref().to_path_buf();
        let handles = match fs::read_to_string(&path).await {
            Ok(contents) => parse_index(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        debug!("Block index {:?} holds {} blocks", path, handles.len());

        Ok(BlockIndex {
            path: Some(path),
            handles: Mutex::new(handles),
        })
    }

    pub fn in_memory() -> Self {
        BlockIndex {
            path: None,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub async fn latest(&self) -> BlockInfo {
        let handles = self.handles.lock().await;
        BlockInfo {
            number: handles.len() as u64,
            hash: handles.last().copied(),
        }
    }

    /// Handle of the block with the given number
    pub async fn handle_at(&self, block_number: u64) -> Option<Hash> {
        if block_number == 0 {
            return None;
        }
        let handles = self.handles.lock().await;
        handles.get(block_number as usize - 1).copied()
    }

    /// Append the next finalized block and return the new latest info
    pub async fn append(&self, handle: Hash) -> Result<BlockInfo, StateError> {
        let mut handles = self.handles.lock().await;

        if let Some(path) = &self.path {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(format!("{}\n", handle.to_hex()).as_bytes())
                .await?;
            file.flush().await?;
        }

        handles.push(handle);
        Ok(BlockInfo {
            number: handles.len() as u64,
            hash: Some(handle),
        })
    }
}

fn parse_index(contents: &str) -> Result<Vec<Hash>, StateError> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            Hash::from_hex(line.trim()).map_err(|e| StateError::CorruptIndex {
                line: i + 1,
                reason: e.to_string(),
            })
        })
        .collect()
}
