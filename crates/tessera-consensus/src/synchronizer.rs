use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tessera_core::{now_millis, Block, BlockInfo, Command, Hash, PBlock};
use tessera_vm::CONSENSUS_CONTRACT;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::core::ConsensusCore;
use crate::error::ConsensusError;
use crate::peer::PeerClient;

/// Brings a booting validator level with a peer and gets it admitted to the
/// validator directory
pub struct ValidatorSynchronizer {
    core: Arc<ConsensusCore>,
    peer_url: String,
    peer: Arc<dyn PeerClient>,
    interval: Duration,
    /// Remote block number the last admission request was made at
    last_proposal_block: Option<u64>,
}

impl ValidatorSynchronizer {
    pub fn new(core: Arc<ConsensusCore>, peer_url: &str, interval: Duration) -> Self {
        let peer = core.connector().connect(peer_url);
        ValidatorSynchronizer {
            core,
            peer_url: peer_url.to_string(),
            peer,
            interval,
            last_proposal_block: None,
        }
    }

    /// Repeat sync cycles until this validator is caught up and known to
    /// both the peer and its own directory
    pub async fn run(mut self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Synchronizing with {}", self.peer_url);
        loop {
            ticker.tick().await;
            match self.cycle().await {
                Ok(true) => {
                    info!(
                        "Synchronized with {} at block {}",
                        self.peer_url,
                        self.core.latest_block_info().number
                    );
                    return;
                }
                Ok(false) => {}
                Err(e) => warn!("Sync with {} failed: {}", self.peer_url, e),
            }
        }
    }

    /// One sync pass; true once nothing is left to do
    pub async fn cycle(&mut self) -> Result<bool, ConsensusError> {
        let remote = self.peer.get_latest_block_info().await?;
        let local = self.core.latest_block_info();
        if remote.number > local.number {
            self.catch_up(remote).await?;
        }

        let id = self.core.id();
        let known_at_peer = self.peer.get_validators().await?.iter().any(|v| v.id == id);
        let known_locally = self.core.validators().await.iter().any(|v| v.id == id);
        let caught_up = self.core.latest_block_info().number >= remote.number;

        if known_at_peer && known_locally && caught_up {
            return Ok(true);
        }

        if !known_at_peer && self.last_proposal_block != Some(remote.number) {
            self.request_admission(remote.number).await?;
            self.last_proposal_block = Some(remote.number);
        }
        Ok(false)
    }

    /// Fetch the blocks between the local and remote latest and apply them
    /// in order
    async fn catch_up(&self, remote: BlockInfo) -> Result<(), ConsensusError> {
        let local = self.core.latest_block_info();

        let mut missing = Vec::new();
        let mut cursor = remote.hash;
        while cursor != local.hash {
            let handle = cursor.ok_or_else(|| {
                ConsensusError::BlockMismatch(format!(
                    "chain of {} does not contain local block {}",
                    self.peer_url, local.number
                ))
            })?;
            let block = self.fetch_block(&handle).await?;
            if block.block_number <= local.number {
                return Err(ConsensusError::BlockMismatch(format!(
                    "{} diverges from local chain at block {}",
                    self.peer_url, block.block_number
                )));
            }
            cursor = block.previous_block_hash;
            missing.push(block);
        }

        debug!(
            "Catching up {} blocks from {}",
            missing.len(),
            self.peer_url
        );
        for block in missing.into_iter().rev() {
            let mut pblocks = HashMap::with_capacity(block.pblock_handles.len());
            for handle in &block.pblock_handles {
                pblocks.insert(*handle, self.fetch_pblock(handle).await?);
            }
            self.core.apply_block(&block, &pblocks).await?;
        }
        Ok(())
    }

    async fn fetch_block(&self, handle: &Hash) -> Result<Block, ConsensusError> {
        match self.core.get_block(handle).await {
            Err(ConsensusError::NotFound(_)) => {}
            found => return found,
        }

        let block = self.peer.get_block(handle).await?;
        if block.handle()? != *handle {
            return Err(ConsensusError::BlockMismatch(format!(
                "{} served wrong content for block {}",
                self.peer_url, handle
            )));
        }
        Ok(block)
    }

    async fn fetch_pblock(&self, handle: &Hash) -> Result<PBlock, ConsensusError> {
        match self.core.get_pblock(handle).await {
            Err(ConsensusError::NotFound(_)) => {}
            found => return found,
        }

        let pblock = self.peer.get_pblock(handle).await?;
        if pblock.handle()? != *handle {
            return Err(ConsensusError::InvalidPBlock(format!(
                "{} served wrong content for pBlock {}",
                self.peer_url, handle
            )));
        }
        pblock
            .verify()
            .map_err(|e| ConsensusError::InvalidPBlock(e.to_string()))?;
        self.core.store_pblock(&pblock).await?;
        Ok(pblock)
    }

    async fn request_admission(&self, block_number: u64) -> Result<(), ConsensusError> {
        let id = self.core.id();
        let mut cmd = Command::nonced(
            self.core.engine().domain(),
            CONSENSUS_CONTRACT,
            "addValidator",
            json!({ "id": id.to_hex(), "url": self.core.public_url() }),
            now_millis(),
            block_number,
        );
        cmd.sign(self.core.keypair())?;

        info!(
            "Requesting admission of {} through {}",
            id.short(),
            self.peer_url
        );
        self.peer.add_domain_validator(&cmd).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{KeyPair, ValidatorRecord};

    use crate::peer::InProcessNetwork;
    use crate::testing::{fast_config, put_command, validator_on};

    #[tokio::test]
    async fn test_admission_requested_once_per_block() {
        let network = InProcessNetwork::new();
        let peer_key = KeyPair::generate();
        let directory = vec![ValidatorRecord::new(peer_key.public, "mem://peer")];
        let peer = validator_on(
            &network,
            fast_config(),
            &peer_key,
            "mem://peer",
            &directory,
        )
        .await;
        peer.core().boot().await.unwrap();

        let joiner = validator_on(
            &network,
            fast_config(),
            &KeyPair::generate(),
            "mem://joiner",
            &directory,
        )
        .await;
        let mut sync = ValidatorSynchronizer::new(
            joiner.core().clone(),
            "mem://peer",
            Duration::from_millis(20),
        );

        assert!(!sync.cycle().await.unwrap());
        assert_eq!(sync.last_proposal_block, Some(0));
        assert_eq!(peer.factory().queue().len().await, 1);

        // Peer is still at the same block, so no second request
        assert!(!sync.cycle().await.unwrap());
        assert_eq!(peer.factory().queue().len().await, 1);
    }

    #[tokio::test]
    async fn test_catch_up_rejects_diverging_chain() {
        let network = InProcessNetwork::new();
        let a_key = KeyPair::generate();
        let b_key = KeyPair::generate();
        let a = validator_on(
            &network,
            fast_config(),
            &a_key,
            "mem://a",
            &[ValidatorRecord::new(a_key.public, "mem://a")],
        )
        .await;
        let b = validator_on(
            &network,
            fast_config(),
            &b_key,
            "mem://b",
            &[ValidatorRecord::new(b_key.public, "mem://b")],
        )
        .await;
        a.core().boot().await.unwrap();
        b.core().boot().await.unwrap();

        // Both finalize a different block 1; a goes on to block 2
        for key in ["x", "y"] {
            let pblock =
                PBlock::new_signed(&a_key, vec![put_command(key)], &a.latest_block_info()).unwrap();
            a.core().add_in_consensus(pblock).await.unwrap();
        }
        let pblock =
            PBlock::new_signed(&b_key, vec![put_command("z")], &b.latest_block_info()).unwrap();
        b.core().add_in_consensus(pblock).await.unwrap();
        let local = b.latest_block_info();
        assert_eq!(local.number, 1);

        let mut sync =
            ValidatorSynchronizer::new(b.core().clone(), "mem://a", Duration::from_millis(20));
        assert!(matches!(
            sync.cycle().await,
            Err(ConsensusError::BlockMismatch(_))
        ));
        assert_eq!(b.latest_block_info(), local);
    }
}
