use std::sync::Arc;

use tessera_core::{
    Block, BlockInfo, Command, Hash, NonInclusionVote, PBlock, PBlockNotification, ValidatorId,
    ValidatorRecord,
};
use tessera_vm::{ExecutionEngine, OptimisticExecution, CONSENSUS_CONTRACT};
use tracing::{debug, warn};

use crate::core::ConsensusCore;
use crate::error::ConsensusError;
use crate::factory::PBlocksFactory;

/// Entry point for clients and peers of one domain
pub struct DomainService {
    engine: Arc<ExecutionEngine>,
    core: Arc<ConsensusCore>,
    factory: Arc<PBlocksFactory>,
}

impl DomainService {
    pub fn new(
        engine: Arc<ExecutionEngine>,
        core: Arc<ConsensusCore>,
        factory: Arc<PBlocksFactory>,
    ) -> Self {
        DomainService {
            engine,
            core,
            factory,
        }
    }

    pub fn domain(&self) -> &str {
        self.engine.domain()
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    pub fn core(&self) -> &Arc<ConsensusCore> {
        &self.core
    }

    pub fn factory(&self) -> &Arc<PBlocksFactory> {
        &self.factory
    }

    /// Execute a client command optimistically and queue it for consensus
    /// when it wrote state or is nonced
    pub async fn submit_command(&self, cmd: Command) -> Result<OptimisticExecution, ConsensusError> {
        let latest = self.core.latest_block_info();
        let execution = self.engine.execute_optimistically(&cmd, latest.number).await?;

        if execution.requires_consensus {
            self.factory.add_command_for_consensus(cmd).await?;
        } else {
            debug!("Command {} answered without consensus", execution.command_hash);
        }
        Ok(execution)
    }

    /// Submit a validator admission request on behalf of a joining validator
    pub async fn add_domain_validator(
        &self,
        cmd: Command,
    ) -> Result<OptimisticExecution, ConsensusError> {
        if cmd.contract_name != CONSENSUS_CONTRACT || cmd.method_name != "addValidator" {
            return Err(ConsensusError::Vm(tessera_vm::VmError::InvalidCommand(format!(
                "expected {}.addValidator, got {}.{}",
                CONSENSUS_CONTRACT, cmd.contract_name, cmd.method_name
            ))));
        }
        self.submit_command(cmd).await
    }

    pub fn latest_block_info(&self) -> BlockInfo {
        self.core.latest_block_info()
    }

    pub async fn get_block(&self, handle: &Hash) -> Result<Block, ConsensusError> {
        self.core.get_block(handle).await
    }

    pub async fn get_block_at(&self, block_number: u64) -> Result<Block, ConsensusError> {
        self.core.get_block_at(block_number).await
    }

    pub async fn get_pblock(&self, handle: &Hash) -> Result<PBlock, ConsensusError> {
        self.core.get_pblock(handle).await
    }

    pub async fn get_pblock_proposed_by_validator(
        &self,
        block_number: u64,
        validator: &ValidatorId,
    ) -> Option<PBlock> {
        self.core
            .get_pblock_proposed_for_consensus(block_number, validator)
            .await
    }

    /// Validated directory, readable before the core has booted
    pub async fn validators(&self) -> Vec<ValidatorRecord> {
        match self.engine.validators().await {
            Ok(validators) => validators,
            Err(e) => {
                warn!("Failed to read validator directory: {}", e);
                self.core.validators().await
            }
        }
    }

    pub async fn on_pblock_added(
        &self,
        notification: PBlockNotification,
    ) -> Result<(), ConsensusError> {
        self.core.add_external_pblock(notification).await
    }

    pub async fn on_non_inclusion(&self, vote: NonInclusionVote) -> Result<(), ConsensusError> {
        self.core.set_validator_non_inclusion(vote).await
    }
}
