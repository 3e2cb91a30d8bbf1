use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use tessera_consensus::{AckResponse, DomainService};
use tessera_core::{
    Block, BlockInfo, Command, Hash, NonInclusionVote, PBlock, PBlockNotification, ValidatorId,
    ValidatorRecord,
};
use tessera_vm::OptimisticExecution;
use tracing::debug;

use crate::error::RpcError;
use crate::ws::events::EventBroadcaster;

/// Application state shared with handlers
pub struct AppState {
    pub service: Arc<DomainService>,
    pub broadcaster: Arc<EventBroadcaster>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub domain: String,
    pub validator: String,
    pub active: bool,
    pub block_number: u64,
    pub block_hash: Option<String>,
    pub queued_commands: usize,
    pub validators: usize,
}

fn parse_hash(hex: &str) -> Result<Hash, RpcError> {
    Hash::from_hex(hex).map_err(|_| RpcError::BadRequest(format!("invalid handle {}", hex)))
}

/// GET /status - Node and consensus status
pub async fn get_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatusResponse>, RpcError> {
    let core = state.service.core();
    let latest = core.latest_block_info();

    Ok(Json(StatusResponse {
        domain: state.service.domain().to_string(),
        validator: core.id().to_hex(),
        active: core.is_active(),
        block_number: latest.number,
        block_hash: latest.hash.map(|h| h.to_hex()),
        queued_commands: state.service.factory().queue().len().await,
        validators: state.service.validators().await.len(),
    }))
}

/// POST /commands - Execute a command optimistically
pub async fn submit_command(
    State(state): State<Arc<AppState>>,
    Json(cmd): Json<Command>,
) -> Result<Json<OptimisticExecution>, RpcError> {
    let execution = state.service.submit_command(cmd).await?;
    debug!(
        "Command {} executed (consensus: {})",
        execution.command_hash, execution.requires_consensus
    );
    Ok(Json(execution))
}

/// GET /blocks/latest - Latest finalized block number and handle
pub async fn get_latest_block(State(state): State<Arc<AppState>>) -> Json<BlockInfo> {
    Json(state.service.latest_block_info())
}

/// GET /blocks/{handle}
pub async fn get_block(
    State(state): State<Arc<AppState>>,
    Path(handle): Path<String>,
) -> Result<Json<Block>, RpcError> {
    let handle = parse_hash(&handle)?;
    Ok(Json(state.service.get_block(&handle).await?))
}

/// GET /blocks/number/{block_number}
pub async fn get_block_by_number(
    State(state): State<Arc<AppState>>,
    Path(block_number): Path<u64>,
) -> Result<Json<Block>, RpcError> {
    Ok(Json(state.service.get_block_at(block_number).await?))
}

/// GET /pblocks/{handle}
pub async fn get_pblock(
    State(state): State<Arc<AppState>>,
    Path(handle): Path<String>,
) -> Result<Json<PBlock>, RpcError> {
    let handle = parse_hash(&handle)?;
    Ok(Json(state.service.get_pblock(&handle).await?))
}

/// GET /pblocks/{block_number}/{validator} - pBlock a validator proposed
/// for a round
pub async fn get_proposed_pblock(
    State(state): State<Arc<AppState>>,
    Path((block_number, validator)): Path<(u64, String)>,
) -> Result<Json<PBlock>, RpcError> {
    let validator = ValidatorId::from_hex(&validator)
        .map_err(|_| RpcError::BadRequest(format!("invalid validator {}", validator)))?;

    state
        .service
        .get_pblock_proposed_by_validator(block_number, &validator)
        .await
        .map(Json)
        .ok_or_else(|| {
            RpcError::NotFound(format!(
                "no pBlock from {} for block {}",
                validator.short(),
                block_number
            ))
        })
}

/// GET /validators - Validated validator directory
pub async fn get_validators(State(state): State<Arc<AppState>>) -> Json<Vec<ValidatorRecord>> {
    Json(state.service.validators().await)
}

/// POST /validators - Request admission of a new validator
pub async fn add_validator(
    State(state): State<Arc<AppState>>,
    Json(cmd): Json<Command>,
) -> Result<Json<OptimisticExecution>, RpcError> {
    Ok(Json(state.service.add_domain_validator(cmd).await?))
}

/// POST /notifications/pblock - A peer proposed a pBlock
pub async fn notify_pblock(
    State(state): State<Arc<AppState>>,
    Json(notification): Json<PBlockNotification>,
) -> Result<Json<AckResponse>, RpcError> {
    state.service.on_pblock_added(notification).await?;
    Ok(Json(AckResponse::accepted()))
}

/// POST /notifications/non-inclusion - A peer's non-inclusion vote
pub async fn notify_non_inclusion(
    State(state): State<Arc<AppState>>,
    Json(vote): Json<NonInclusionVote>,
) -> Result<Json<AckResponse>, RpcError> {
    state.service.on_non_inclusion(vote).await?;
    Ok(Json(AckResponse::accepted()))
}
