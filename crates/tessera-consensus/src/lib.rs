//! Tessera Consensus - Block agreement between validators
//!
//! This crate provides the per-round pending block state machine, the
//! consensus core that collects pBlocks and finalizes blocks, the pBlock
//! factory, the validator synchronizer and the peer RPC clients.

pub mod core;
pub mod domain;
pub mod error;
pub mod events;
pub mod factory;
pub mod net;
pub mod peer;
pub mod pending_block;
pub mod synchronizer;

#[cfg(test)]
mod testing;

pub use crate::core::{ConsensusConfig, ConsensusCore};
pub use domain::DomainService;
pub use error::ConsensusError;
pub use events::BlockEventSink;
pub use factory::{FactoryConfig, PBlocksFactory};
pub use net::{AckResponse, ErrorResponse};
pub use peer::{
    HttpConnector, HttpPeerClient, InProcessConnector, InProcessNetwork, PeerClient, PeerConnector,
};
pub use pending_block::{quorum, PendingBlock, Phase};
pub use synchronizer::ValidatorSynchronizer;
