use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tessera_core::{Command, KeyPair, ValidatorRecord};
use tessera_mempool::{CommandQueue, QueueConfig};
use tessera_state::{
    BlockIndex, CommandHistory, LockConfig, MemoryBlobStore, MemoryStorage, Storage,
};
use tessera_vm::{EngineConfig, ExecutionEngine};

use crate::core::{ConsensusConfig, ConsensusCore};
use crate::domain::DomainService;
use crate::factory::{FactoryConfig, PBlocksFactory};
use crate::peer::{InProcessConnector, InProcessNetwork};

pub fn memory_engine() -> Arc<ExecutionEngine> {
    Arc::new(
        ExecutionEngine::with_builtin_contracts(
            "main",
            |_| Ok(Box::new(MemoryStorage::new()) as Box<dyn Storage>),
            LockConfig::default(),
            Arc::new(CommandHistory::in_memory(Duration::from_secs(600))),
            EngineConfig::default(),
        )
        .unwrap(),
    )
}

pub fn fast_config() -> ConsensusConfig {
    ConsensusConfig {
        pending_blocks_timeout: Duration::from_millis(100),
        non_inclusion_timeout: Duration::from_millis(100),
        sync_interval: Duration::from_millis(20),
        ..Default::default()
    }
}

/// Unbooted core whose directory holds only its own validator
pub async fn single_validator() -> (Arc<ConsensusCore>, KeyPair) {
    let keypair = KeyPair::generate();
    let engine = memory_engine();
    engine
        .seed_validators(&[ValidatorRecord::new(keypair.public, "mem://solo")])
        .await
        .unwrap();

    let core = Arc::new(ConsensusCore::new(
        fast_config(),
        keypair.clone(),
        "mem://solo",
        engine,
        Arc::new(MemoryBlobStore::new()),
        Arc::new(BlockIndex::in_memory()),
        Arc::new(InProcessConnector::new(InProcessNetwork::new())),
    ));
    (core, keypair)
}

/// Unbooted validator reachable at `url` on `network`, its directory
/// seeded with `directory`
pub async fn validator_on(
    network: &Arc<InProcessNetwork>,
    config: ConsensusConfig,
    keypair: &KeyPair,
    url: &str,
    directory: &[ValidatorRecord],
) -> Arc<DomainService> {
    let engine = memory_engine();
    engine.seed_validators(directory).await.unwrap();

    let core = Arc::new(ConsensusCore::new(
        config,
        keypair.clone(),
        url,
        engine.clone(),
        Arc::new(MemoryBlobStore::new()),
        Arc::new(BlockIndex::in_memory()),
        Arc::new(InProcessConnector::new(network.clone())),
    ));
    let factory = Arc::new(PBlocksFactory::new(
        FactoryConfig::default(),
        core.clone(),
        Arc::new(CommandQueue::new(QueueConfig::default())),
    ));
    let service = Arc::new(DomainService::new(engine, core, factory));
    network.register(url, &service).await;
    service
}

pub fn put_command(key: &str) -> Command {
    Command::safe("main", "kv", "put", json!({ "key": key, "value": key }))
}
