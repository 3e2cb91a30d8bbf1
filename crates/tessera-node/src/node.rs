use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tessera_consensus::{
    ConsensusCore, DomainService, HttpConnector, PBlocksFactory, PeerConnector,
};
use tessera_core::KeyPair;
use tessera_mempool::{CommandQueue, QueueConfig};
use tessera_rpc::ws::EventBroadcaster;
use tessera_rpc::{RpcConfig, RpcServer};
use tessera_state::{
    BlobStore, BlockIndex, CommandHistory, FileStorage, FsBlobStore, LockConfig, Storage,
};
use tessera_vm::ExecutionEngine;
use tokio::net::TcpListener;
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::config::NodeConfig;

/// A validator serving one domain
pub struct Node {
    config: NodeConfig,
    keypair: KeyPair,
    service: Arc<DomainService>,
    broadcaster: Arc<EventBroadcaster>,
}

impl Node {
    /// Open the data directory and wire the validator together.
    ///
    /// Layout under `data_dir`: `blocks.index`, `blobs/`, `history/` and
    /// one `storage/<contract>/` directory per contract.
    pub async fn new(config: NodeConfig) -> Result<Self> {
        let keypair = config.keypair()?;
        let data_dir = config.data_dir.clone();

        let history = Arc::new(
            CommandHistory::open(
                &data_dir.join("history"),
                Duration::from_millis(config.history_window_ms),
            )
            .await?,
        );

        let storage_root = data_dir.join("storage");
        let engine = Arc::new(ExecutionEngine::with_builtin_contracts(
            config.domain.as_str(),
            |contract| Ok(Box::new(FileStorage::new(storage_root.join(contract))?) as Box<dyn Storage>),
            LockConfig::default(),
            history,
            config.engine_config(),
        )?);
        if engine.seed_validators(&config.genesis_validators).await? {
            info!("Installed {} genesis validators", config.genesis_validators.len());
        }

        let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::open(data_dir.join("blobs")).await?);
        let index = Arc::new(BlockIndex::open(data_dir.join("blocks.index")).await?);
        let connector: Arc<dyn PeerConnector> =
            Arc::new(HttpConnector::new(config.peer_request_timeout())?);

        let core = Arc::new(ConsensusCore::new(
            config.consensus_config(),
            keypair.clone(),
            config.public_url.as_str(),
            engine.clone(),
            blobs,
            index,
            connector,
        ));
        let factory = Arc::new(PBlocksFactory::new(
            config.factory_config(),
            core.clone(),
            Arc::new(CommandQueue::new(QueueConfig::default())),
        ));
        let service = Arc::new(DomainService::new(engine, core, factory));

        Ok(Node {
            config,
            keypair,
            service,
            broadcaster: Arc::new(EventBroadcaster::default()),
        })
    }

    pub fn service(&self) -> &Arc<DomainService> {
        &self.service
    }

    /// Serve RPC, boot consensus and produce pBlocks until interrupted
    pub async fn run(self) -> Result<()> {
        info!(
            "Starting Tessera validator {} for domain {}",
            self.keypair.public, self.config.domain
        );

        let core = self.service.core().clone();
        core.set_event_sink(self.broadcaster.clone()).await;

        // Peers sync against each other during boot, so serve first
        let listener = TcpListener::bind(self.config.rpc_addr).await?;
        let rpc_server = RpcServer::new(
            RpcConfig {
                http_addr: self.config.rpc_addr,
                enable_ws: self.config.enable_ws,
            },
            self.service.clone(),
            self.broadcaster.clone(),
        );
        let rpc_handle = tokio::spawn(rpc_server.serve(listener));

        core.boot().await?;

        let factory = self.service.factory().clone();
        let factory_handle = tokio::spawn(factory.run());

        let engine = self.service.engine().clone();
        let prune_every = Duration::from_millis(self.config.history_window_ms.max(1000));
        let prune_handle = tokio::spawn(async move {
            let mut ticker = interval(prune_every);
            loop {
                ticker.tick().await;
                let pruned = engine.history().prune().await;
                if pruned > 0 {
                    debug!("Pruned {} command history records", pruned);
                }
            }
        });

        tokio::select! {
            result = rpc_handle => match result {
                Ok(Err(e)) => error!("RPC server error: {}", e),
                Err(e) => error!("RPC server task failed: {}", e),
                Ok(Ok(())) => {}
            },
            _ = factory_handle => error!("pBlock factory stopped"),
            _ = tokio::signal::ctrl_c() => info!("Shutting down"),
        }
        prune_handle.abort();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::generate_sample_config;

    #[tokio::test]
    async fn test_node_creation_seeds_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            data_dir: dir.path().to_path_buf(),
            ..generate_sample_config()
        };
        let expected = config.genesis_validators.clone();

        let node = Node::new(config).await.unwrap();
        assert_eq!(node.service().validators().await, expected);
        assert!(dir.path().join("history").is_dir());
        assert!(dir.path().join("blobs").is_dir());
        assert!(dir.path().join("storage").join("kv").is_dir());
    }

    #[tokio::test]
    async fn test_restart_keeps_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            data_dir: dir.path().to_path_buf(),
            ..generate_sample_config()
        };
        let original = config.genesis_validators.clone();
        drop(Node::new(config.clone()).await.unwrap());

        let restarted = NodeConfig {
            genesis_validators: generate_sample_config().genesis_validators,
            ..config
        };
        let node = Node::new(restarted).await.unwrap();
        assert_eq!(node.service().validators().await, original);
    }
}
