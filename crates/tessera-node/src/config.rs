use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tessera_consensus::{ConsensusConfig, FactoryConfig};
use tessera_core::{KeyPair, SecretKey, ValidatorRecord};
use tessera_vm::EngineConfig;

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Domain this validator serves
    pub domain: String,

    /// Node data directory
    pub data_dir: PathBuf,

    /// RPC bind address
    pub rpc_addr: SocketAddr,

    /// URL other validators use to reach this node
    pub public_url: String,

    /// Enable WebSocket
    pub enable_ws: bool,

    /// Validator secret key (hex)
    pub validator_key: String,

    /// Validator directory installed on first start
    pub genesis_validators: Vec<ValidatorRecord>,

    /// Peer to synchronize with at boot instead of the first genesis validator
    pub sync_peer: Option<String>,

    pub max_pblock_size: usize,
    pub pblock_timeout_ms: u64,
    pub pending_blocks_timeout_ms: u64,
    pub non_inclusion_timeout_ms: u64,
    pub max_reconciliation_attempts: u32,
    pub sync_interval_ms: u64,
    pub history_window_ms: u64,
    pub nonce_block_tolerance: u64,
    pub peer_request_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let consensus = ConsensusConfig::default();
        let factory = FactoryConfig::default();
        let engine = EngineConfig::default();

        NodeConfig {
            domain: "main".to_string(),
            data_dir: PathBuf::from("./tessera-data"),
            rpc_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            public_url: "http://127.0.0.1:8080".to_string(),
            enable_ws: true,
            validator_key: String::new(),
            genesis_validators: Vec::new(),
            sync_peer: None,
            max_pblock_size: factory.max_pblock_size,
            pblock_timeout_ms: factory.pblock_timeout.as_millis() as u64,
            pending_blocks_timeout_ms: consensus.pending_blocks_timeout.as_millis() as u64,
            non_inclusion_timeout_ms: consensus.non_inclusion_timeout.as_millis() as u64,
            max_reconciliation_attempts: consensus.max_reconciliation_attempts,
            sync_interval_ms: consensus.sync_interval.as_millis() as u64,
            history_window_ms: engine.history_window_ms,
            nonce_block_tolerance: engine.nonce_block_tolerance,
            peer_request_timeout_ms: 5000,
        }
    }
}

impl NodeConfig {
    /// Load config from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: NodeConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn keypair(&self) -> Result<KeyPair> {
        let secret = SecretKey::from_hex(&self.validator_key)
            .context("validator_key is not a valid secret key")?;
        Ok(KeyPair::from_secret(secret))
    }

    pub fn consensus_config(&self) -> ConsensusConfig {
        ConsensusConfig {
            pending_blocks_timeout: Duration::from_millis(self.pending_blocks_timeout_ms),
            non_inclusion_timeout: Duration::from_millis(self.non_inclusion_timeout_ms),
            max_reconciliation_attempts: self.max_reconciliation_attempts,
            sync_interval: Duration::from_millis(self.sync_interval_ms),
            sync_peer: self.sync_peer.clone(),
            ..Default::default()
        }
    }

    pub fn factory_config(&self) -> FactoryConfig {
        FactoryConfig {
            max_pblock_size: self.max_pblock_size,
            pblock_timeout: Duration::from_millis(self.pblock_timeout_ms),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            history_window_ms: self.history_window_ms,
            nonce_block_tolerance: self.nonce_block_tolerance,
            ..Default::default()
        }
    }

    pub fn peer_request_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_request_timeout_ms)
    }
}

/// Sample single-validator configuration with a fresh key
pub fn generate_sample_config() -> NodeConfig {
    let validator = KeyPair::generate();
    let config = NodeConfig::default();

    NodeConfig {
        validator_key: validator.secret.to_hex(),
        genesis_validators: vec![ValidatorRecord::new(
            validator.public,
            config.public_url.clone(),
        )],
        ..config
    }
}
