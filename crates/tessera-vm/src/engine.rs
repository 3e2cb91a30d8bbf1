use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tessera_core::{now_millis, Command, Hash, PBlock, ValidatorRecord};
use tessera_state::{
    CommandHistory, ContractStorage, ExecutionMode, LockConfig, StateError, Storage,
};
use tracing::{debug, info, warn};

use crate::context::{CallContext, Registered, Registry};
use crate::contract::Contract;
use crate::contracts::{ConsensusContract, KvContract, CONSENSUS_CONTRACT, VALIDATORS_KEY};
use crate::error::VmError;
use crate::validation::{check_acl, check_freshness, check_shape, check_signature};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Accepted distance between a nonced command's timestamp and now
    pub history_window_ms: u64,
    /// How many blocks a nonced command's block number may trail the latest
    pub nonce_block_tolerance: u64,
    pub max_call_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            history_window_ms: 10 * 60 * 1000,
            nonce_block_tolerance: 1,
            max_call_depth: 8,
        }
    }
}

/// Tentative outcome of running a command ahead of consensus
#[derive(Debug, Clone, Serialize)]
pub struct OptimisticExecution {
    pub command_hash: Hash,
    pub result: Value,
    /// The command wrote state (or is nonced) and must go through consensus
    pub requires_consensus: bool,
}

/// Outcome of one command during validated execution
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub command_hash: Hash,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// Runs commands against the contracts of one domain
pub struct ExecutionEngine {
    domain: String,
    registry: Arc<Registry>,
    history: Arc<CommandHistory>,
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn new(
        domain: impl Into<String>,
        contracts: Vec<(Arc<dyn Contract>, ContractStorage)>,
        history: Arc<CommandHistory>,
        config: EngineConfig,
    ) -> Self {
        let registry: HashMap<String, Registered> = contracts
            .into_iter()
            .map(|(contract, storage)| {
                (
                    contract.name().to_string(),
                    Registered {
                        contract,
                        storage: Arc::new(storage),
                    },
                )
            })
            .collect();

        ExecutionEngine {
            domain: domain.into(),
            registry: Arc::new(registry),
            history,
            config,
        }
    }

    /// Engine with the built-in `consensus` and `kv` contracts, each backed by
    /// the storage `backend` opens for its name
    pub fn with_builtin_contracts<F>(
        domain: impl Into<String>,
        mut backend: F,
        lock_config: LockConfig,
        history: Arc<CommandHistory>,
        config: EngineConfig,
    ) -> Result<Self, VmError>
    where
        F: FnMut(&str) -> Result<Box<dyn Storage>, StateError>,
    {
        let builtins: Vec<Arc<dyn Contract>> =
            vec![Arc::new(ConsensusContract), Arc::new(KvContract)];

        let mut contracts = Vec::with_capacity(builtins.len());
        for contract in builtins {
            let storage =
                ContractStorage::new(contract.name(), backend(contract.name())?, lock_config.clone());
            contracts.push((contract, storage));
        }
        Ok(Self::new(domain, contracts, history, config))
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn history(&self) -> &Arc<CommandHistory> {
        &self.history
    }

    pub fn storage(&self, contract: &str) -> Option<Arc<ContractStorage>> {
        self.registry.get(contract).map(|entry| entry.storage.clone())
    }

    fn registered(&self, contract: &str) -> Result<&Registered, VmError> {
        self.registry
            .get(contract)
            .ok_or_else(|| VmError::UnknownContract(contract.to_string()))
    }

    /// Validated validator directory of the domain
    pub async fn validators(&self) -> Result<Vec<ValidatorRecord>, VmError> {
        let storage = &self.registered(CONSENSUS_CONTRACT)?.storage;
        match storage.get_validated(VALIDATORS_KEY).await? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| VmError::InvalidOperation(format!("corrupt validator list: {}", e))),
            None => Ok(Vec::new()),
        }
    }

    /// Install the genesis validator set if the directory is still empty
    pub async fn seed_validators(&self, validators: &[ValidatorRecord]) -> Result<bool, VmError> {
        if validators.is_empty() || !self.validators().await?.is_empty() {
            return Ok(false);
        }

        let value = serde_json::to_value(validators)
            .map_err(|e| VmError::InvalidOperation(e.to_string()))?;
        self.registered(CONSENSUS_CONTRACT)?
            .storage
            .set(VALIDATORS_KEY, value, ExecutionMode::Validated, Hash::ZERO)
            .await?;
        info!("Seeded {} genesis validators", validators.len());
        Ok(true)
    }

    /// Check a client command before optimistic execution, returning its hash
    pub async fn validate_command(&self, cmd: &Command, latest_block: u64) -> Result<Hash, VmError> {
        check_shape(cmd, &self.domain)?;
        check_acl(cmd, &self.registered(&cmd.contract_name)?.contract.manifest())?;
        let hash = cmd.hash()?;

        if cmd.is_nonced() {
            check_signature(cmd)?;
            check_freshness(
                cmd,
                now_millis(),
                self.config.history_window_ms,
                latest_block,
                self.config.nonce_block_tolerance,
            )?;
            if self.history.has(ExecutionMode::Optimistic, &hash).await {
                return Err(VmError::Replay(hash.to_hex()));
            }
        }
        Ok(hash)
    }

    /// Run a command immediately against the optimistic overlay
    pub async fn execute_optimistically(
        &self,
        cmd: &Command,
        latest_block: u64,
    ) -> Result<OptimisticExecution, VmError> {
        let command_hash = self.validate_command(cmd, latest_block).await?;
        let ctx = self.context(cmd, ExecutionMode::Optimistic, command_hash);

        let result = self
            .registered(&cmd.contract_name)?
            .contract
            .call(&ctx, &cmd.method_name, &cmd.params)
            .await?;

        if cmd.is_nonced() {
            self.record(ExecutionMode::Optimistic, command_hash).await?;
        }

        let requires_consensus = cmd.is_nonced() || ctx.wrote();
        debug!(
            "Optimistic {}.{} ({}) requires consensus: {}",
            cmd.contract_name, cmd.method_name, command_hash, requires_consensus
        );

        Ok(OptimisticExecution {
            command_hash,
            result,
            requires_consensus,
        })
    }

    /// Re-execute every command of a finalized pBlock in validated mode.
    ///
    /// Failing commands are skipped; the outcome only depends on the pBlock
    /// and the validated state.
    pub async fn execute_pblock(&self, pblock: &PBlock) -> Vec<ExecutionResult> {
        let mut results = Vec::with_capacity(pblock.commands.len());

        for cmd in &pblock.commands {
            let command_hash = match cmd.hash() {
                Ok(hash) => hash,
                Err(e) => {
                    warn!(
                        "Skipping unhashable command {}.{} of pBlock {}: {}",
                        cmd.contract_name, cmd.method_name, pblock.hash, e
                    );
                    results.push(ExecutionResult {
                        command_hash: Hash::ZERO,
                        success: false,
                        result: None,
                        error: Some(e.to_string()),
                    });
                    continue;
                }
            };
            match self.execute_validated(cmd, command_hash).await {
                Ok(value) => results.push(ExecutionResult {
                    command_hash,
                    success: true,
                    result: Some(value),
                    error: None,
                }),
                Err(e) => {
                    warn!(
                        "Skipping command {} of pBlock {} from {}: {}",
                        command_hash,
                        pblock.hash,
                        pblock.proposing_validator.short(),
                        e
                    );
                    self.discard_pending(command_hash).await;
                    results.push(ExecutionResult {
                        command_hash,
                        success: false,
                        result: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        info!(
            "Executed pBlock {} for block {} ({}/{} commands succeeded)",
            pblock.hash,
            pblock.block_number,
            results.iter().filter(|r| r.success).count(),
            results.len()
        );
        results
    }

    async fn execute_validated(&self, cmd: &Command, command_hash: Hash) -> Result<Value, VmError> {
        check_shape(cmd, &self.domain)?;
        let entry = self.registered(&cmd.contract_name)?;
        check_acl(cmd, &entry.contract.manifest())?;

        if cmd.is_nonced() {
            check_signature(cmd)?;
            if self.history.has(ExecutionMode::Validated, &command_hash).await {
                return Err(VmError::Replay(command_hash.to_hex()));
            }
        }

        let ctx = self.context(cmd, ExecutionMode::Validated, command_hash);
        let value = entry.contract.call(&ctx, &cmd.method_name, &cmd.params).await?;

        if cmd.is_nonced() {
            self.record(ExecutionMode::Validated, command_hash).await?;
        }
        Ok(value)
    }

    /// Drop the optimistic writes of a command that failed validation from
    /// every contract, since inter-contract calls may have written anywhere
    async fn discard_pending(&self, command_hash: Hash) {
        for entry in self.registry.values() {
            if let Err(e) = entry.storage.discard_pending(&command_hash).await {
                warn!(
                    "Failed to discard pending writes of {} in {}: {}",
                    command_hash,
                    entry.storage.contract(),
                    e
                );
            }
        }
    }

    async fn record(&self, mode: ExecutionMode, hash: Hash) -> Result<(), VmError> {
        match self.history.add(mode, hash).await {
            Ok(()) => Ok(()),
            Err(StateError::AlreadyRecorded(h)) => Err(VmError::Replay(h)),
            Err(e) => Err(e.into()),
        }
    }

    fn context(&self, cmd: &Command, mode: ExecutionMode, command_hash: Hash) -> CallContext {
        CallContext::new(
            self.registry.clone(),
            &cmd.contract_name,
            mode,
            command_hash,
            cmd.signer,
            self.config.max_call_depth,
        )
    }
}
