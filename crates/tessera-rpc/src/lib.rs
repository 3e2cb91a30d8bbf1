//! Tessera RPC - HTTP and WebSocket API
//!
//! This crate serves the client command endpoint, the peer endpoints other
//! validators call during consensus, and a WebSocket feed of finalized blocks.

pub mod error;
pub mod http;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tessera_consensus::DomainService;
use tracing::info;

use http::{create_router, AppState};
use ws::{create_ws_router, EventBroadcaster};

pub use error::RpcError;
pub use http::handlers::StatusResponse;
pub use ws::WsEvent;

/// RPC server configuration
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// HTTP bind address
    pub http_addr: SocketAddr,
    /// Enable WebSocket
    pub enable_ws: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig {
            http_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            enable_ws: true,
        }
    }
}

/// RPC server
pub struct RpcServer {
    config: RpcConfig,
    app_state: Arc<AppState>,
}

impl RpcServer {
    pub fn new(
        config: RpcConfig,
        service: Arc<DomainService>,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Self {
        RpcServer {
            config,
            app_state: Arc::new(AppState {
                service,
                broadcaster,
            }),
        }
    }

    pub fn broadcaster(&self) -> Arc<EventBroadcaster> {
        Arc::clone(&self.app_state.broadcaster)
    }

    /// Create the combined router
    pub fn router(&self) -> Router {
        let http_router = create_router(Arc::clone(&self.app_state));

        if self.config.enable_ws {
            http_router.merge(create_ws_router(self.broadcaster()))
        } else {
            http_router
        }
    }

    /// Bind the configured address and serve until the process stops
    pub async fn run(self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.config.http_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<(), std::io::Error> {
        info!("RPC server listening on {}", listener.local_addr()?);
        axum::serve(listener, self.router()).await
    }
}
