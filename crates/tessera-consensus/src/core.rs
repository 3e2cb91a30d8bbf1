use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tessera_core::{
    Block, BlockInfo, Hash, KeyPair, NonInclusionVote, PBlock, PBlockNotification, ValidatorId,
    ValidatorRecord,
};
use tessera_state::{BlobStore, BlockIndex};
use tessera_vm::ExecutionEngine;
use tokio::sync::{broadcast, oneshot, watch, Mutex, RwLock};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::error::ConsensusError;
use crate::events::BlockEventSink;
use crate::peer::PeerConnector;
use crate::pending_block::{MissingPBlock, PendingBlock, PendingTimeout, Phase, Reconciliation};
use crate::synchronizer::ValidatorSynchronizer;

/// Timing and retention settings for consensus rounds
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    pub pending_blocks_timeout: Duration,
    pub non_inclusion_timeout: Duration,
    /// Non-inclusion timeouts before a round finalizes with what it has
    pub max_reconciliation_attempts: u32,
    pub sync_interval: Duration,
    /// Peer to synchronize with at boot instead of the first other validator
    pub sync_peer: Option<String>,
    /// How many blocks back proposals stay available to peers
    pub proposal_retention_blocks: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            pending_blocks_timeout: Duration::from_millis(2000),
            non_inclusion_timeout: Duration::from_millis(2000),
            max_reconciliation_attempts: 5,
            sync_interval: Duration::from_millis(1000),
            sync_peer: None,
            proposal_retention_blocks: 64,
        }
    }
}

struct Round {
    state: Mutex<PendingBlock>,
}

struct Completion {
    block_number: u64,
    sender: oneshot::Sender<Result<Block, ConsensusError>>,
}

/// Drives consensus rounds for one domain
pub struct ConsensusCore {
    config: ConsensusConfig,
    keypair: KeyPair,
    public_url: String,
    engine: Arc<ExecutionEngine>,
    blobs: Arc<dyn BlobStore>,
    index: Arc<BlockIndex>,
    connector: Arc<dyn PeerConnector>,
    validators: RwLock<Vec<ValidatorRecord>>,
    rounds: Mutex<BTreeMap<u64, Arc<Round>>>,
    /// Every verified pBlock seen, by block number and proposer
    proposals: RwLock<HashMap<(u64, ValidatorId), PBlock>>,
    completions: Mutex<HashMap<Hash, Completion>>,
    latest: watch::Sender<BlockInfo>,
    round_opened: broadcast::Sender<u64>,
    apply_lock: Mutex<()>,
    active: AtomicBool,
    event_sink: RwLock<Option<Arc<dyn BlockEventSink>>>,
}

impl ConsensusCore {
    pub fn new(
        config: ConsensusConfig,
        keypair: KeyPair,
        public_url: impl Into<String>,
        engine: Arc<ExecutionEngine>,
        blobs: Arc<dyn BlobStore>,
        index: Arc<BlockIndex>,
        connector: Arc<dyn PeerConnector>,
    ) -> Self {
        let (latest, _) = watch::channel(BlockInfo::genesis());
        let (round_opened, _) = broadcast::channel(64);

        ConsensusCore {
            config,
            keypair,
            public_url: public_url.into(),
            engine,
            blobs,
            index,
            connector,
            validators: RwLock::new(Vec::new()),
            rounds: Mutex::new(BTreeMap::new()),
            proposals: RwLock::new(HashMap::new()),
            completions: Mutex::new(HashMap::new()),
            latest,
            round_opened,
            apply_lock: Mutex::new(()),
            active: AtomicBool::new(false),
            event_sink: RwLock::new(None),
        }
    }

    pub fn id(&self) -> ValidatorId {
        self.keypair.public
    }

    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    pub(crate) fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    pub(crate) fn connector(&self) -> &Arc<dyn PeerConnector> {
        &self.connector
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn latest_block_info(&self) -> BlockInfo {
        *self.latest.borrow()
    }

    /// Watch the latest finalized block
    pub fn subscribe(&self) -> watch::Receiver<BlockInfo> {
        self.latest.subscribe()
    }

    /// Block numbers of rounds opened by another validator's pBlock
    pub fn subscribe_rounds(&self) -> broadcast::Receiver<u64> {
        self.round_opened.subscribe()
    }

    pub async fn set_event_sink(&self, sink: Arc<dyn BlockEventSink>) {
        *self.event_sink.write().await = Some(sink);
    }

    pub async fn validators(&self) -> Vec<ValidatorRecord> {
        self.validators.read().await.clone()
    }

    pub async fn get_block(&self, handle: &Hash) -> Result<Block, ConsensusError> {
        let bytes = self
            .blobs
            .get(handle)
            .await?
            .ok_or_else(|| ConsensusError::NotFound(format!("block {}", handle)))?;
        Ok(Block::from_blob(&bytes)?)
    }

    /// Finalized block by number, genesis excluded
    pub async fn get_block_at(&self, block_number: u64) -> Result<Block, ConsensusError> {
        let handle = self
            .index
            .handle_at(block_number)
            .await
            .ok_or_else(|| ConsensusError::NotFound(format!("block number {}", block_number)))?;
        self.get_block(&handle).await
    }

    pub async fn get_pblock(&self, handle: &Hash) -> Result<PBlock, ConsensusError> {
        let bytes = self
            .blobs
            .get(handle)
            .await?
            .ok_or_else(|| ConsensusError::NotFound(format!("pBlock {}", handle)))?;
        Ok(PBlock::from_blob(&bytes)?)
    }

    pub(crate) async fn store_pblock(&self, pblock: &PBlock) -> Result<Hash, ConsensusError> {
        Ok(self.blobs.put(pblock.to_blob()?).await?)
    }

    /// pBlock a validator proposed for a block number, for peers filling gaps
    pub async fn get_pblock_proposed_for_consensus(
        &self,
        block_number: u64,
        validator: &ValidatorId,
    ) -> Option<PBlock> {
        self.proposals
            .read()
            .await
            .get(&(block_number, *validator))
            .cloned()
    }

    /// Load the validator directory and the latest block, then synchronize
    /// with a peer until this validator is caught up and recognized.
    pub async fn boot(self: &Arc<Self>) -> Result<(), ConsensusError> {
        let validators = self.engine.validators().await?;
        if validators.is_empty() {
            return Err(ConsensusError::EmptyValidatorDirectory);
        }
        *self.validators.write().await = validators.clone();

        let latest = self.index.latest().await;
        self.latest.send_replace(latest);
        info!(
            "Booting validator {} at block {} with {} validators",
            self.id().short(),
            latest.number,
            validators.len()
        );

        let peers: Vec<&ValidatorRecord> =
            validators.iter().filter(|v| v.id != self.id()).collect();
        if let Some(first_peer) = peers.first() {
            let peer_url = self
                .config
                .sync_peer
                .clone()
                .unwrap_or_else(|| first_peer.url.clone());
            ValidatorSynchronizer::new(self.clone(), &peer_url, self.config.sync_interval)
                .run()
                .await;
        }

        self.active.store(true, Ordering::SeqCst);
        info!(
            "Consensus active at block {}",
            self.latest_block_info().number
        );
        Ok(())
    }

    /// Submit this validator's own pBlock and wait for the block it ends up in
    pub async fn add_in_consensus(self: &Arc<Self>, pblock: PBlock) -> Result<Block, ConsensusError> {
        if !self.is_active() {
            return Err(ConsensusError::NotActive);
        }
        let latest = self.latest_block_info();
        if pblock.block_number <= latest.number {
            return Err(ConsensusError::StaleBlockNumber {
                block_number: pblock.block_number,
                latest: latest.number,
            });
        }
        if pblock.proposing_validator != self.id() {
            return Err(ConsensusError::InvalidPBlock(
                "not proposed by this validator".to_string(),
            ));
        }
        pblock
            .verify()
            .map_err(|e| ConsensusError::InvalidPBlock(e.to_string()))?;

        self.store_pblock(&pblock).await?;

        let (sender, receiver) = oneshot::channel();
        self.completions.lock().await.insert(
            pblock.hash,
            Completion {
                block_number: pblock.block_number,
                sender,
            },
        );

        let hash = pblock.hash;
        if let Err(e) = self.feed_pblock(pblock).await {
            self.completions.lock().await.remove(&hash);
            return Err(e);
        }

        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(ConsensusError::RoundAborted),
        }
    }

    /// Accept a peer's pBlock announcement. The pBlock is fetched if needed
    /// and fed to its round in the background.
    pub async fn add_external_pblock(
        self: &Arc<Self>,
        notification: PBlockNotification,
    ) -> Result<(), ConsensusError> {
        if !self.is_active() {
            return Err(ConsensusError::NotActive);
        }
        let latest = self.latest_block_info();
        if notification.block_number <= latest.number {
            return Err(ConsensusError::StaleBlockNumber {
                block_number: notification.block_number,
                latest: latest.number,
            });
        }
        if !self
            .validators
            .read()
            .await
            .iter()
            .any(|v| v.id == notification.proposing_validator)
        {
            return Err(ConsensusError::UnknownValidator(
                notification.proposing_validator.to_hex(),
            ));
        }

        let core = self.clone();
        tokio::spawn(async move {
            let proposer = notification.proposing_validator;
            let pblock = match core.obtain_pblock(notification).await {
                Ok(pblock) => pblock,
                Err(e) => {
                    warn!("Dropping pBlock from {}: {}", proposer.short(), e);
                    return;
                }
            };
            if let Err(e) = core.feed_pblock(pblock).await {
                debug!("pBlock from {} not accepted: {}", proposer.short(), e);
            }
        });
        Ok(())
    }

    async fn obtain_pblock(
        &self,
        notification: PBlockNotification,
    ) -> Result<PBlock, ConsensusError> {
        let handle = notification.pblock_handle;
        let pblock = match notification.pblock {
            Some(pblock) => pblock,
            None => match self.get_pblock(&handle).await {
                Ok(pblock) => pblock,
                Err(ConsensusError::NotFound(_)) => {
                    self.connector
                        .connect(&notification.url)
                        .get_pblock(&handle)
                        .await?
                }
                Err(e) => return Err(e),
            },
        };

        if pblock.handle()? != handle {
            return Err(ConsensusError::InvalidPBlock(format!(
                "content does not match handle {}",
                handle
            )));
        }
        self.check_pblock(
            &pblock,
            notification.block_number,
            &notification.proposing_validator,
        )?;
        self.store_pblock(&pblock).await?;
        Ok(pblock)
    }

    fn check_pblock(
        &self,
        pblock: &PBlock,
        block_number: u64,
        proposer: &ValidatorId,
    ) -> Result<(), ConsensusError> {
        if pblock.block_number != block_number || pblock.proposing_validator != *proposer {
            return Err(ConsensusError::InvalidPBlock(format!(
                "expected block {} from {}",
                block_number,
                proposer.short()
            )));
        }
        pblock
            .verify()
            .map_err(|e| ConsensusError::InvalidPBlock(e.to_string()))
    }

    /// Record a peer's non-inclusion vote for a round in its check phase
    pub async fn set_validator_non_inclusion(
        self: &Arc<Self>,
        vote: NonInclusionVote,
    ) -> Result<(), ConsensusError> {
        if !self.is_active() {
            return Err(ConsensusError::NotActive);
        }
        let block_number = vote.block_number;
        let round = self
            .find_round(block_number)
            .await
            .ok_or(ConsensusError::UnknownRound(block_number))?;

        round.state.lock().await.add_vote(&vote)?;
        debug!(
            "Round {} vote from {} marks {} unreachable",
            block_number,
            vote.validator.short(),
            vote.unreachable_validators.len()
        );

        let core = self.clone();
        tokio::spawn(async move {
            let mut state = round.state.lock().await;
            if state.phase() == Phase::NonInclusionCheck {
                core.evaluate(&mut state).await;
            }
        });
        Ok(())
    }

    /// Announce a local pBlock to every other validator
    pub async fn broadcast_pblock(&self, pblock: &PBlock) -> Result<(), ConsensusError> {
        let notification = PBlockNotification {
            proposing_validator: pblock.proposing_validator,
            url: self.public_url.clone(),
            block_number: pblock.block_number,
            pblock_handle: pblock.handle()?,
            signature: pblock.signature,
            pblock: Some(pblock.clone()),
        };

        for peer in self.peers().await {
            let client = self.connector.connect(&peer.url);
            let notification = notification.clone();
            tokio::spawn(async move {
                if let Err(e) = client.notify_pblock_added(&notification).await {
                    warn!(
                        "Failed to notify {} of pBlock for block {}: {}",
                        peer.id.short(),
                        notification.block_number,
                        e
                    );
                }
            });
        }
        Ok(())
    }

    async fn broadcast_vote(&self, vote: NonInclusionVote) {
        for peer in self.peers().await {
            let client = self.connector.connect(&peer.url);
            let vote = vote.clone();
            tokio::spawn(async move {
                if let Err(e) = client.notify_non_inclusion(&vote).await {
                    warn!(
                        "Failed to send non-inclusion vote for block {} to {}: {}",
                        vote.block_number,
                        peer.id.short(),
                        e
                    );
                }
            });
        }
    }

    async fn peers(&self) -> Vec<ValidatorRecord> {
        self.validators
            .read()
            .await
            .iter()
            .filter(|v| v.id != self.id())
            .cloned()
            .collect()
    }

    async fn find_round(&self, block_number: u64) -> Option<Arc<Round>> {
        self.rounds.lock().await.get(&block_number).cloned()
    }

    async fn open_round(&self, block_number: u64) -> (Arc<Round>, bool) {
        let mut rounds = self.rounds.lock().await;
        if let Some(round) = rounds.get(&block_number) {
            return (round.clone(), false);
        }

        let validator_set: Vec<ValidatorId> =
            self.validators.read().await.iter().map(|v| v.id).collect();
        let round = Arc::new(Round {
            state: Mutex::new(PendingBlock::new(block_number, self.id(), validator_set)),
        });
        rounds.insert(block_number, round.clone());
        (round, true)
    }

    /// Route a verified pBlock into the round for its block number
    async fn feed_pblock(self: &Arc<Self>, pblock: PBlock) -> Result<(), ConsensusError> {
        let block_number = pblock.block_number;
        let proposer = pblock.proposing_validator;
        let latest = self.latest_block_info();
        if block_number <= latest.number {
            return Err(ConsensusError::StaleBlockNumber {
                block_number,
                latest: latest.number,
            });
        }

        self.proposals
            .write()
            .await
            .entry((block_number, proposer))
            .or_insert_with(|| pblock.clone());

        let (round, created) = self.open_round(block_number).await;
        if created {
            debug!("Round {} opened by {}", block_number, proposer.short());
            self.arm_pending_timer(block_number, 0);
            if proposer != self.id() {
                // No subscriber simply means nobody proposes on demand
                let _ = self.round_opened.send(block_number);
            }
        }

        let mut state = round.state.lock().await;
        let complete = state.add_pblock(pblock)?;
        debug!(
            "Round {} has {}/{} pBlocks",
            block_number,
            state.received_count(),
            state.validator_set().len()
        );

        if complete {
            self.finalize(&mut state).await;
        }
        Ok(())
    }

    fn arm_pending_timer(self: &Arc<Self>, block_number: u64, generation: u64) {
        let core = self.clone();
        let timeout = self.config.pending_blocks_timeout;
        tokio::spawn(async move {
            sleep(timeout).await;
            core.on_pending_timeout(block_number, generation).await;
        });
    }

    fn arm_non_inclusion_timer(self: &Arc<Self>, block_number: u64, generation: u64) {
        let core = self.clone();
        let timeout = self.config.non_inclusion_timeout;
        tokio::spawn(async move {
            sleep(timeout).await;
            core.on_non_inclusion_timeout(block_number, generation).await;
        });
    }

    async fn on_pending_timeout(self: &Arc<Self>, block_number: u64, generation: u64) {
        let Some(round) = self.find_round(block_number).await else {
            return;
        };
        let mut state = round.state.lock().await;

        match state.on_pending_timeout(generation) {
            PendingTimeout::Stale => {}
            PendingTimeout::Finalize => self.finalize(&mut state).await,
            PendingTimeout::Rearm => {
                debug!(
                    "Round {} below quorum ({}/{}), waiting",
                    block_number,
                    state.received_count(),
                    state.validator_set().len()
                );
                self.arm_pending_timer(block_number, generation);
            }
            PendingTimeout::StartNonInclusion(missing) => {
                info!(
                    "Round {} missing {} pBlocks, starting non-inclusion check",
                    block_number,
                    missing.len()
                );
                // Evaluated when peer votes arrive or the check times out
                self.broadcast_vote(state.own_vote()).await;
                self.arm_non_inclusion_timer(block_number, state.generation());
            }
        }
    }

    async fn on_non_inclusion_timeout(self: &Arc<Self>, block_number: u64, generation: u64) {
        let Some(round) = self.find_round(block_number).await else {
            return;
        };
        let mut state = round.state.lock().await;
        if !state.is_current_check(generation) {
            return;
        }

        self.evaluate(&mut state).await;
        if state.phase() != Phase::NonInclusionCheck {
            return;
        }

        let attempts = state.record_check_timeout();
        if attempts >= self.config.max_reconciliation_attempts {
            let excluded = state.force_finalize();
            warn!(
                "Round {} unresolved after {} attempts, finalizing without {} validators",
                block_number,
                attempts,
                excluded.len()
            );
            self.finalize(&mut state).await;
            return;
        }

        self.broadcast_vote(state.own_vote()).await;
        self.arm_non_inclusion_timer(block_number, generation);
    }

    /// Act on the majority non-inclusion view, if one has formed
    async fn evaluate(self: &Arc<Self>, state: &mut PendingBlock) {
        let Some(majority) = state.majority() else {
            debug!("Round {} has no majority view yet", state.block_number());
            return;
        };

        let missing = match state.reconcile(&majority) {
            Ok(Reconciliation::Finalize) => {
                self.finalize(state).await;
                return;
            }
            Ok(Reconciliation::Missing(missing)) => missing,
            Err(e) => {
                debug!("Round {} not reconciled: {}", state.block_number(), e);
                return;
            }
        };

        for gap in &missing {
            if let Some(pblock) = self.find_missing_pblock(state.block_number(), gap).await {
                if let Err(e) = state.fill_gap(pblock) {
                    warn!("Could not use pBlock from {}: {}", gap.validator.short(), e);
                }
            }
        }

        if let Ok(Reconciliation::Finalize) = state.reconcile(&majority) {
            self.finalize(state).await;
        }
    }

    async fn find_missing_pblock(&self, block_number: u64, gap: &MissingPBlock) -> Option<PBlock> {
        if let Some(pblock) = self
            .get_pblock_proposed_for_consensus(block_number, &gap.validator)
            .await
        {
            return Some(pblock);
        }

        let validators = self.validators().await;
        for candidate in &gap.candidates {
            let Some(record) = validators.iter().find(|v| v.id == *candidate) else {
                continue;
            };
            let client = self.connector.connect(&record.url);
            match client
                .get_pblock_proposed_by_validator(block_number, &gap.validator)
                .await
            {
                Ok(Some(pblock)) => {
                    if let Err(e) = self.check_pblock(&pblock, block_number, &gap.validator) {
                        warn!("{} served a bad pBlock: {}", candidate.short(), e);
                        continue;
                    }
                    if let Err(e) = self.store_pblock(&pblock).await {
                        warn!("Failed to store fetched pBlock: {}", e);
                    }
                    self.proposals
                        .write()
                        .await
                        .insert((block_number, gap.validator), pblock.clone());
                    return Some(pblock);
                }
                Ok(None) => debug!(
                    "{} has no pBlock from {} for block {}",
                    candidate.short(),
                    gap.validator.short(),
                    block_number
                ),
                Err(e) => warn!(
                    "Failed to fetch pBlock of {} from {}: {}",
                    gap.validator.short(),
                    candidate.short(),
                    e
                ),
            }
        }
        None
    }

    /// Turn a finalizing round into a block, apply it and resolve waiters
    async fn finalize(&self, state: &mut PendingBlock) {
        let block_number = state.block_number();

        let mut latest_rx = self.latest.subscribe();
        let latest = match latest_rx.wait_for(|info| info.number + 1 >= block_number).await {
            Ok(info) => *info,
            Err(_) => return,
        };

        let outcome = if latest.number >= block_number {
            warn!("Block {} was applied before its round finalized", block_number);
            Err(ConsensusError::RoundAborted)
        } else {
            self.build_and_apply(state, latest).await
        };

        match outcome {
            Ok((block, included)) => self.resolve(block_number, Some((&block, &included))).await,
            Err(e) => {
                error!("Failed to finalize block {}: {}", block_number, e);
                self.resolve(block_number, None).await;
            }
        }

        self.rounds
            .lock()
            .await
            .retain(|&number, _| number > block_number);
        let retention = self.config.proposal_retention_blocks;
        self.proposals
            .write()
            .await
            .retain(|(number, _), _| number + retention > block_number);
    }

    async fn build_and_apply(
        &self,
        state: &PendingBlock,
        latest: BlockInfo,
    ) -> Result<(Block, HashSet<Hash>), ConsensusError> {
        let included = state.included_pblocks();
        let mut pblocks = HashMap::new();
        for pblock in included.iter().filter(|p| !p.is_empty()) {
            let handle = self.store_pblock(pblock).await?;
            pblocks.insert(handle, pblock.clone());
        }

        let block = Block::new(state.block_number(), latest.hash, pblocks.keys().copied());
        self.apply_block(&block, &pblocks).await?;

        let excluded = state.excluded_validators();
        if !excluded.is_empty() {
            info!(
                "Block {} excludes {} validators",
                block.block_number,
                excluded.len()
            );
        }
        Ok((block, included.iter().map(|p| p.hash).collect()))
    }

    async fn resolve(&self, block_number: u64, outcome: Option<(&Block, &HashSet<Hash>)>) {
        let mut completions = self.completions.lock().await;
        let hashes: Vec<Hash> = completions
            .iter()
            .filter(|(_, c)| c.block_number == block_number)
            .map(|(hash, _)| *hash)
            .collect();

        for hash in hashes {
            let Some(completion) = completions.remove(&hash) else {
                continue;
            };
            let result = match outcome {
                Some((block, included)) if included.contains(&hash) => Ok(block.clone()),
                Some(_) => Err(ConsensusError::Excluded(block_number)),
                None => Err(ConsensusError::RoundAborted),
            };
            // The proposer may have stopped waiting
            let _ = completion.sender.send(result);
        }
    }

    /// Persist a block, execute its pBlocks and advance the latest block.
    ///
    /// `pblocks` must hold every pBlock the block references, by handle.
    /// They are executed in handle order, so every validator applies the
    /// same commands in the same order.
    pub async fn apply_block(
        &self,
        block: &Block,
        pblocks: &HashMap<Hash, PBlock>,
    ) -> Result<BlockInfo, ConsensusError> {
        let _guard = self.apply_lock.lock().await;

        let latest = self.latest_block_info();
        if block.block_number != latest.number + 1 || block.previous_block_hash != latest.hash {
            return Err(ConsensusError::BlockMismatch(format!(
                "block {} does not extend latest block {}",
                block.block_number, latest.number
            )));
        }
        let mut ordered = Vec::with_capacity(block.pblock_handles.len());
        for handle in &block.pblock_handles {
            let pblock = pblocks
                .get(handle)
                .ok_or_else(|| ConsensusError::NotFound(format!("pBlock {}", handle)))?;
            ordered.push(pblock);
        }

        let handle = self.blobs.put(block.to_blob()?).await?;

        let mut results = Vec::new();
        for pblock in ordered {
            results.extend(self.engine.execute_pblock(pblock).await);
        }

        let info = self.index.append(handle).await?;
        self.latest.send_replace(info);

        match self.engine.validators().await {
            Ok(validators) => *self.validators.write().await = validators,
            Err(e) => warn!("Failed to reload validators: {}", e),
        }

        info!(
            "Block {} finalized: {} with {} pBlocks",
            info.number,
            handle,
            block.pblock_handles.len()
        );

        if let Some(sink) = self.event_sink.read().await.as_ref() {
            sink.on_block_finalized(block, &results);
        }
        Ok(info)
    }
}
