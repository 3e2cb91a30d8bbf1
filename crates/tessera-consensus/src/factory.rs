use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tessera_core::{Block, Command, PBlock};
use tessera_mempool::{CommandQueue, MempoolError};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::core::ConsensusCore;
use crate::error::ConsensusError;

/// When the factory cuts a pBlock
#[derive(Debug, Clone)]
pub struct FactoryConfig {
    /// Queued commands that trigger a pBlock right away
    pub max_pblock_size: usize,
    /// Longest a queued command waits before a pBlock is built
    pub pblock_timeout: Duration,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        FactoryConfig {
            max_pblock_size: 100,
            pblock_timeout: Duration::from_millis(500),
        }
    }
}

/// Batches queued commands into signed pBlocks and submits them
pub struct PBlocksFactory {
    config: FactoryConfig,
    core: Arc<ConsensusCore>,
    queue: Arc<CommandQueue>,
    size_trigger: Notify,
    last_proposed: AtomicU64,
}

impl PBlocksFactory {
    pub fn new(config: FactoryConfig, core: Arc<ConsensusCore>, queue: Arc<CommandQueue>) -> Self {
        PBlocksFactory {
            config,
            core,
            queue,
            size_trigger: Notify::new(),
            last_proposed: AtomicU64::new(0),
        }
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    /// Queue a command for the next pBlock. Queuing a command twice is a no-op.
    pub async fn add_command_for_consensus(&self, cmd: Command) -> Result<(), ConsensusError> {
        match self.queue.push(cmd).await {
            Ok(len) => {
                if len >= self.config.max_pblock_size {
                    self.size_trigger.notify_one();
                }
                Ok(())
            }
            Err(MempoolError::AlreadyQueued) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Build pBlocks on timeout, when the queue fills up, and whenever
    /// another validator opens a round
    pub async fn run(self: Arc<Self>) {
        let mut rounds = self.core.subscribe_rounds();
        let timer = sleep(self.config.pblock_timeout);
        tokio::pin!(timer);

        info!(
            "Starting pBlock factory (size {}, timeout {}ms)",
            self.config.max_pblock_size,
            self.config.pblock_timeout.as_millis()
        );

        loop {
            tokio::select! {
                _ = &mut timer => {
                    if !self.queue.is_empty().await {
                        self.drain_queue().await;
                    }
                }
                _ = self.size_trigger.notified() => {
                    self.drain_queue().await;
                }
                opened = rounds.recv() => match opened {
                    Ok(block_number) => self.join_round(block_number).await,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Factory skipped {} round notifications", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => return,
                },
            }
            timer
                .as_mut()
                .reset(Instant::now() + self.config.pblock_timeout);
        }
    }

    /// Contribute a pBlock, possibly empty, to a round another validator opened
    async fn join_round(&self, block_number: u64) {
        let mut latest_rx = self.core.subscribe();
        let latest = match latest_rx
            .wait_for(|info| info.number + 1 >= block_number)
            .await
        {
            Ok(info) => *info,
            Err(_) => return,
        };
        if latest.number >= block_number
            || self.last_proposed.load(Ordering::SeqCst) >= block_number
        {
            return;
        }

        if let Err(e) = self.build().await {
            warn!("Failed to join round {}: {}", block_number, e);
            return;
        }
        self.drain_queue().await;
    }

    async fn drain_queue(&self) {
        while self.core.is_active() && !self.queue.is_empty().await {
            match self.build().await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => {
                    warn!("pBlock not finalized: {}", e);
                    break;
                }
            }
        }
    }

    /// Cut one pBlock for the next block number and wait for its block.
    /// Commands of a pBlock that does not make it go back to the front of
    /// the queue.
    pub async fn build(&self) -> Result<Option<Block>, ConsensusError> {
        if !self.core.is_active() {
            return Ok(None);
        }
        let latest = self.core.latest_block_info();
        let block_number = latest.next_number();
        if self.last_proposed.load(Ordering::SeqCst) >= block_number {
            return Ok(None);
        }

        let commands = self.queue.drain(self.config.max_pblock_size).await;
        let pblock = match PBlock::new_signed(self.core.keypair(), commands.clone(), &latest) {
            Ok(pblock) => pblock,
            Err(e) => {
                self.queue.requeue_front(commands).await;
                return Err(e.into());
            }
        };
        self.last_proposed.store(block_number, Ordering::SeqCst);
        debug!(
            "Proposing pBlock {} with {} commands for block {}",
            pblock.hash,
            pblock.commands.len(),
            block_number
        );

        let outcome = match self.core.broadcast_pblock(&pblock).await {
            Ok(()) => self.core.add_in_consensus(pblock).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(block) => Ok(Some(block)),
            Err(e) => {
                if !commands.is_empty() {
                    info!(
                        "Requeuing {} commands after block {} failed",
                        commands.len(),
                        block_number
                    );
                    self.queue.requeue_front(commands).await;
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_mempool::QueueConfig;

    use crate::testing::{put_command, single_validator};

    async fn factory(config: FactoryConfig) -> Arc<PBlocksFactory> {
        let (core, _) = single_validator().await;
        core.boot().await.unwrap();
        Arc::new(PBlocksFactory::new(
            config,
            core,
            Arc::new(CommandQueue::new(QueueConfig::default())),
        ))
    }

    #[tokio::test]
    async fn test_build_drains_queue_into_block() {
        let factory = factory(FactoryConfig::default()).await;
        factory.add_command_for_consensus(put_command("a")).await.unwrap();
        factory.add_command_for_consensus(put_command("b")).await.unwrap();

        let block = factory.build().await.unwrap().unwrap();
        assert_eq!(block.block_number, 1);
        assert_eq!(block.pblock_handles.len(), 1);
        assert!(factory.queue().is_empty().await);

        let pblock = factory.core.get_pblock(&block.pblock_handles[0]).await.unwrap();
        assert_eq!(pblock.commands.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_command_is_ignored() {
        let factory = factory(FactoryConfig::default()).await;
        factory.add_command_for_consensus(put_command("a")).await.unwrap();
        factory.add_command_for_consensus(put_command("a")).await.unwrap();
        assert_eq!(factory.queue().len().await, 1);
    }

    #[tokio::test]
    async fn test_build_skipped_when_inactive() {
        let (core, _) = single_validator().await;
        let factory = PBlocksFactory::new(
            FactoryConfig::default(),
            core,
            Arc::new(CommandQueue::new(QueueConfig::default())),
        );
        factory.add_command_for_consensus(put_command("a")).await.unwrap();

        assert!(factory.build().await.unwrap().is_none());
        assert_eq!(factory.queue().len().await, 1);
    }

    #[tokio::test]
    async fn test_size_trigger_builds_before_timeout() {
        let factory = factory(FactoryConfig {
            max_pblock_size: 2,
            pblock_timeout: Duration::from_secs(60),
        })
        .await;
        let mut latest = factory.core.subscribe();
        tokio::spawn(factory.clone().run());

        factory.add_command_for_consensus(put_command("a")).await.unwrap();
        factory.add_command_for_consensus(put_command("b")).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), latest.wait_for(|i| i.number >= 1))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_timeout_builds_partial_pblock() {
        let factory = factory(FactoryConfig {
            max_pblock_size: 100,
            pblock_timeout: Duration::from_millis(50),
        })
        .await;
        let mut latest = factory.core.subscribe();
        tokio::spawn(factory.clone().run());

        factory.add_command_for_consensus(put_command("a")).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), latest.wait_for(|i| i.number >= 1))
            .await
            .unwrap()
            .unwrap();
        assert!(factory.queue().is_empty().await);
    }

    #[tokio::test]
    async fn test_idle_factory_builds_nothing() {
        let factory = factory(FactoryConfig {
            max_pblock_size: 100,
            pblock_timeout: Duration::from_millis(20),
        })
        .await;
        tokio::spawn(factory.clone().run());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(factory.core.latest_block_info().number, 0);
    }
}
