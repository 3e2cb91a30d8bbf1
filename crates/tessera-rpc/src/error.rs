use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tessera_consensus::{ConsensusError, ErrorResponse};
use tessera_mempool::MempoolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Consensus(#[from] ConsensusError),

    #[error("Core error: {0}")]
    Core(#[from] tessera_core::CoreError),
}

impl RpcError {
    fn status(&self) -> StatusCode {
        match self {
            RpcError::NotFound(_) => StatusCode::NOT_FOUND,
            RpcError::BadRequest(_) | RpcError::Core(_) => StatusCode::BAD_REQUEST,
            RpcError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RpcError::Consensus(e) => consensus_status(e),
        }
    }
}

fn consensus_status(error: &ConsensusError) -> StatusCode {
    match error {
        ConsensusError::NotFound(_) | ConsensusError::UnknownRound(_) => StatusCode::NOT_FOUND,
        ConsensusError::NotActive => StatusCode::SERVICE_UNAVAILABLE,
        ConsensusError::Mempool(MempoolError::QueueFull | MempoolError::SignerLimitReached) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ConsensusError::StaleBlockNumber { .. }
        | ConsensusError::DuplicatePBlock(_)
        | ConsensusError::DuplicateVote(_)
        | ConsensusError::WrongPhase { .. } => StatusCode::CONFLICT,
        ConsensusError::InvalidPBlock(_)
        | ConsensusError::UnknownValidator(_)
        | ConsensusError::Vm(_)
        | ConsensusError::Mempool(_)
        | ConsensusError::Core(_) => StatusCode::BAD_REQUEST,
        ConsensusError::Peer(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.to_string(),
        };
        (self.status(), axum::Json(body)).into_response()
    }
}
