//! Multi-validator consensus tests over the in-process peer transport

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tessera_consensus::{
    ConsensusConfig, ConsensusCore, DomainService, FactoryConfig, InProcessConnector,
    InProcessNetwork, PBlocksFactory,
};
use tessera_core::{BlockInfo, Command, KeyPair, ValidatorRecord};
use tessera_mempool::{CommandQueue, QueueConfig};
use tessera_state::{
    BlockIndex, CommandHistory, FileStorage, FsBlobStore, LockConfig, Storage,
};
use tessera_vm::{EngineConfig, ExecutionEngine};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

struct TestNode {
    url: String,
    service: Arc<DomainService>,
    factory: Arc<PBlocksFactory>,
    dir: TempDir,
}

impl TestNode {
    fn core(&self) -> &Arc<ConsensusCore> {
        self.service.core()
    }

    fn start_factory(&self) {
        tokio::spawn(self.factory.clone().run());
    }

    async fn wait_for_block(&self, number: u64) -> BlockInfo {
        let mut latest = self.core().subscribe();
        let info = timeout(WAIT, latest.wait_for(|info| info.number >= number))
            .await
            .expect("timed out waiting for block")
            .unwrap();
        *info
    }

    fn index_lines(&self) -> usize {
        let contents =
            std::fs::read_to_string(self.dir.path().join("blocks.index")).unwrap_or_default();
        contents.lines().filter(|l| !l.is_empty()).count()
    }

    async fn validated(&self, key: &str) -> Option<serde_json::Value> {
        let kv = self.core().engine().storage("kv").unwrap();
        kv.get_validated(key).await.unwrap()
    }
}

fn consensus_config() -> ConsensusConfig {
    ConsensusConfig {
        pending_blocks_timeout: Duration::from_millis(150),
        non_inclusion_timeout: Duration::from_millis(150),
        sync_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

async fn build_node(
    network: &Arc<InProcessNetwork>,
    keypair: KeyPair,
    url: &str,
    genesis: &[ValidatorRecord],
) -> TestNode {
    let dir = TempDir::new().unwrap();
    let root: &Path = dir.path();

    let history = Arc::new(
        CommandHistory::open(&root.join("history"), Duration::from_secs(600))
            .await
            .unwrap(),
    );
    let storage_root = root.join("storage");
    let engine = Arc::new(
        ExecutionEngine::with_builtin_contracts(
            "main",
            |contract| {
                Ok(Box::new(FileStorage::new(storage_root.join(contract))?) as Box<dyn Storage>)
            },
            LockConfig::default(),
            history,
            EngineConfig::default(),
        )
        .unwrap(),
    );
    engine.seed_validators(genesis).await.unwrap();

    let core = Arc::new(ConsensusCore::new(
        consensus_config(),
        keypair,
        url,
        engine.clone(),
        Arc::new(FsBlobStore::open(root.join("blobs")).await.unwrap()),
        Arc::new(BlockIndex::open(root.join("blocks.index")).await.unwrap()),
        Arc::new(InProcessConnector::new(network.clone())),
    ));
    let factory = Arc::new(PBlocksFactory::new(
        FactoryConfig {
            max_pblock_size: 100,
            pblock_timeout: Duration::from_millis(50),
        },
        core.clone(),
        Arc::new(CommandQueue::new(QueueConfig::default())),
    ));
    let service = Arc::new(DomainService::new(engine, core, factory.clone()));
    network.register(url, &service).await;

    TestNode {
        url: url.to_string(),
        service,
        factory,
        dir,
    }
}

/// Build and boot `n` genesis validators
async fn cluster(n: usize) -> (Arc<InProcessNetwork>, Vec<TestNode>) {
    let network = InProcessNetwork::new();
    let keys: Vec<KeyPair> = (0..n).map(|_| KeyPair::generate()).collect();
    let genesis: Vec<ValidatorRecord> = keys
        .iter()
        .enumerate()
        .map(|(i, k)| ValidatorRecord::new(k.public, format!("mem://validator-{}", i)))
        .collect();

    let mut nodes = Vec::with_capacity(n);
    for (key, record) in keys.into_iter().zip(&genesis) {
        nodes.push(build_node(&network, key, &record.url, &genesis).await);
    }

    let boots: Vec<_> = nodes
        .iter()
        .map(|node| {
            let core = node.core().clone();
            tokio::spawn(async move { core.boot().await })
        })
        .collect();
    for boot in boots {
        timeout(WAIT, boot).await.unwrap().unwrap().unwrap();
    }

    (network, nodes)
}

fn put(key: &str, value: i64) -> Command {
    Command::safe("main", "kv", "put", json!({ "key": key, "value": value }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_validator_read_makes_no_block() {
    let (_network, nodes) = cluster(1).await;
    let node = &nodes[0];
    node.start_factory();

    let read = Command::safe("main", "kv", "get", json!({ "key": "missing" }));
    let execution = node.service.submit_command(read).await.unwrap();
    assert!(!execution.requires_consensus);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(node.core().latest_block_info().number, 0);
    assert_eq!(node.index_lines(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_validator_write_appends_one_block() {
    let (_network, nodes) = cluster(1).await;
    let node = &nodes[0];
    node.start_factory();

    let execution = node.service.submit_command(put("a", 1)).await.unwrap();
    assert!(execution.requires_consensus);

    let info = node.wait_for_block(1).await;
    assert_eq!(info.number, 1);
    assert_eq!(node.index_lines(), 1);
    assert_eq!(node.validated("a").await, Some(json!(1)));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(node.index_lines(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_validators_agree_on_block() {
    let (_network, nodes) = cluster(3).await;

    for (i, node) in nodes.iter().enumerate() {
        node.service
            .submit_command(put(&format!("key-{}", i), i as i64))
            .await
            .unwrap();
    }
    for node in &nodes {
        node.start_factory();
    }

    let mut infos = Vec::new();
    for node in &nodes {
        infos.push(node.wait_for_block(1).await);
    }
    assert!(infos.iter().all(|info| info.number == 1));
    assert!(infos.iter().all(|info| info.hash == infos[0].hash));

    let block = nodes[0]
        .core()
        .get_block(&infos[0].hash.unwrap())
        .await
        .unwrap();
    assert_eq!(block.block_number, 1);
    assert_eq!(block.previous_block_hash, None);
    assert_eq!(block.pblock_handles.len(), 3);

    for node in &nodes {
        for i in 0..3 {
            assert_eq!(
                node.validated(&format!("key-{}", i)).await,
                Some(json!(i))
            );
        }
    }

    nodes[1].service.submit_command(put("next", 7)).await.unwrap();
    let second = nodes[2].wait_for_block(2).await;
    let next = nodes[2].core().get_block(&second.hash.unwrap()).await.unwrap();
    assert_eq!(next.block_number, block.block_number + 1);
    assert_eq!(next.previous_block_hash, Some(block.handle().unwrap()));
    assert_eq!(next.pblock_handles.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_conflicting_writes_validate_identically() {
    let (_network, nodes) = cluster(2).await;
    nodes[0].service.submit_command(put("k", 1)).await.unwrap();
    nodes[1].service.submit_command(put("k", 2)).await.unwrap();
    for node in &nodes {
        node.start_factory();
    }

    let first = nodes[0].wait_for_block(1).await;
    let second = nodes[1].wait_for_block(1).await;
    assert_eq!(first.hash, second.hash);

    let block = nodes[0].core().get_block(&first.hash.unwrap()).await.unwrap();
    assert_eq!(block.pblock_handles.len(), 2);

    // Handle order decides which write lands last, on every validator
    let value = nodes[0].validated("k").await;
    assert!(value == Some(json!(1)) || value == Some(json!(2)));
    assert_eq!(nodes[1].validated("k").await, value);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreachable_validator_is_excluded() {
    let (network, nodes) = cluster(3).await;
    network.disconnect(&nodes[2].url).await;

    nodes[0].start_factory();
    nodes[1].start_factory();
    nodes[0].service.submit_command(put("a", 1)).await.unwrap();

    let first = nodes[0].wait_for_block(1).await;
    let second = nodes[1].wait_for_block(1).await;
    assert_eq!(first.hash, second.hash);
    assert_eq!(nodes[2].core().latest_block_info().number, 0);

    let block = nodes[1].core().get_block(&first.hash.unwrap()).await.unwrap();
    assert_eq!(block.pblock_handles.len(), 1);
    assert_eq!(nodes[1].validated("a").await, Some(json!(1)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_new_validator_syncs_and_joins() {
    let (network, nodes) = cluster(2).await;
    for node in &nodes {
        node.start_factory();
    }
    nodes[0].service.submit_command(put("a", 1)).await.unwrap();
    nodes[0].wait_for_block(1).await;

    let genesis = nodes[0].service.validators().await;
    let joining = build_node(&network, KeyPair::generate(), "mem://joining", &genesis).await;
    let core = joining.core().clone();
    timeout(WAIT, core.boot()).await.unwrap().unwrap();

    assert!(core.is_active());
    assert!(core.latest_block_info().number >= 2);
    assert_eq!(joining.validated("a").await, Some(json!(1)));
    assert_eq!(core.validators().await.len(), 3);
    nodes[1].wait_for_block(2).await;
    assert_eq!(nodes[1].service.validators().await.len(), 3);
}
