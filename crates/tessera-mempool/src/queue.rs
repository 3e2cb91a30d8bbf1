use std::collections::{HashMap, HashSet, VecDeque};

use tessera_core::{Command, Hash, PublicKey};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::MempoolError;

/// Configuration for the command queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of queued commands
    pub max_size: usize,
    /// Maximum queued nonced commands per signer
    pub max_per_signer: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_size: 10_000,
            max_per_signer: 100,
        }
    }
}

#[derive(Default)]
struct QueueInner {
    order: VecDeque<(Hash, Command)>,
    hashes: HashSet<Hash>,
    by_signer: HashMap<PublicKey, usize>,
}

impl QueueInner {
    fn insert(&mut self, hash: Hash, cmd: Command, front: bool) {
        if let Some(signer) = cmd.signer {
            *self.by_signer.entry(signer).or_default() += 1;
        }
        self.hashes.insert(hash);
        if front {
            self.order.push_front((hash, cmd));
        } else {
            self.order.push_back((hash, cmd));
        }
    }

    fn forget(&mut self, hash: &Hash, cmd: &Command) {
        self.hashes.remove(hash);
        if let Some(signer) = cmd.signer {
            if let Some(count) = self.by_signer.get_mut(&signer) {
                *count -= 1;
                if *count == 0 {
                    self.by_signer.remove(&signer);
                }
            }
        }
    }
}

/// FIFO queue of commands waiting for a pBlock, deduplicated by hash
pub struct CommandQueue {
    config: QueueConfig,
    inner: Mutex<QueueInner>,
}

impl CommandQueue {
    pub fn new(config: QueueConfig) -> Self {
        CommandQueue {
            config,
            inner: Mutex::new(QueueInner::default()),
        }
    }

    /// Append a command, returning the queue length afterwards
    pub async fn push(&self, cmd: Command) -> Result<usize, MempoolError> {
        let hash = cmd
            .hash()
            .map_err(|e| MempoolError::InvalidCommand(e.to_string()))?;
        let mut inner = self.inner.lock().await;

        if inner.hashes.contains(&hash) {
            return Err(MempoolError::AlreadyQueued);
        }
        if inner.order.len() >= self.config.max_size {
            return Err(MempoolError::QueueFull);
        }
        if let Some(signer) = cmd.signer {
            if inner.by_signer.get(&signer).copied().unwrap_or(0) >= self.config.max_per_signer {
                return Err(MempoolError::SignerLimitReached);
            }
        }

        inner.insert(hash, cmd, false);
        debug!("Queued command {} ({} pending)", hash, inner.order.len());
        Ok(inner.order.len())
    }

    /// Take up to `max` commands from the front
    pub async fn drain(&self, max: usize) -> Vec<Command> {
        let mut inner = self.inner.lock().await;
        let count = max.min(inner.order.len());
        let drained: Vec<(Hash, Command)> = inner.order.drain(..count).collect();

        drained
            .into_iter()
            .map(|(hash, cmd)| {
                inner.forget(&hash, &cmd);
                cmd
            })
            .collect()
    }

    /// Put commands back at the front, keeping their relative order.
    ///
    /// Used when a pBlock could not be included; commands already queued
    /// again in the meantime are skipped.
    pub async fn requeue_front(&self, commands: Vec<Command>) {
        let mut inner = self.inner.lock().await;
        let mut restored = 0;

        for cmd in commands.into_iter().rev() {
            let hash = match cmd.hash() {
                Ok(hash) => hash,
                Err(e) => {
                    warn!("Dropping unhashable command on requeue: {}", e);
                    continue;
                }
            };
            if inner.hashes.contains(&hash) {
                continue;
            }
            inner.insert(hash, cmd, true);
            restored += 1;
        }

        debug!("Requeued {} commands", restored);
    }

    pub async fn contains(&self, hash: &Hash) -> bool {
        self.inner.lock().await.hashes.contains(hash)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.order.is_empty()
    }
}
