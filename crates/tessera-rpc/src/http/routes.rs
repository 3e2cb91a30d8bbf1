use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{
    add_validator, get_block, get_block_by_number, get_latest_block, get_pblock,
    get_proposed_pblock, get_status, get_validators, notify_non_inclusion, notify_pblock,
    submit_command, AppState,
};

/// Create the HTTP router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/status", get(get_status))
        .route("/commands", post(submit_command))
        .route("/blocks/latest", get(get_latest_block))
        .route("/blocks/{handle}", get(get_block))
        .route("/blocks/number/{block_number}", get(get_block_by_number))
        .route("/pblocks/{handle}", get(get_pblock))
        .route("/pblocks/{block_number}/{validator}", get(get_proposed_pblock))
        .route("/validators", get(get_validators).post(add_validator))
        .route("/notifications/pblock", post(notify_pblock))
        .route("/notifications/non-inclusion", post(notify_non_inclusion))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tessera_consensus::{
        ConsensusConfig, ConsensusCore, DomainService, FactoryConfig, InProcessConnector,
        InProcessNetwork, PBlocksFactory,
    };
    use tessera_core::{BlockInfo, Hash, KeyPair, PBlock, ValidatorRecord};
    use tessera_mempool::{CommandQueue, QueueConfig};
    use tessera_state::{
        BlockIndex, CommandHistory, LockConfig, MemoryBlobStore, MemoryStorage, Storage,
    };
    use tessera_vm::{EngineConfig, ExecutionEngine};
    use tower::ServiceExt;

    use crate::ws::EventBroadcaster;

    async fn app() -> (Router, KeyPair) {
        let (router, keypair, _) = app_with_service().await;
        (router, keypair)
    }

    async fn app_with_service() -> (Router, KeyPair, Arc<DomainService>) {
        let keypair = KeyPair::generate();
        let engine = Arc::new(
            ExecutionEngine::with_builtin_contracts(
                "main",
                |_| Ok(Box::new(MemoryStorage::new()) as Box<dyn Storage>),
                LockConfig::default(),
                Arc::new(CommandHistory::in_memory(Duration::from_secs(600))),
                EngineConfig::default(),
            )
            .unwrap(),
        );
        engine
            .seed_validators(&[ValidatorRecord::new(keypair.public, "http://127.0.0.1:1")])
            .await
            .unwrap();

        let core = Arc::new(ConsensusCore::new(
            ConsensusConfig::default(),
            keypair.clone(),
            "http://127.0.0.1:1",
            engine.clone(),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(BlockIndex::in_memory()),
            Arc::new(InProcessConnector::new(InProcessNetwork::new())),
        ));
        core.boot().await.unwrap();
        let factory = Arc::new(PBlocksFactory::new(
            FactoryConfig::default(),
            core.clone(),
            Arc::new(CommandQueue::new(QueueConfig::default())),
        ));

        let service = Arc::new(DomainService::new(engine, core, factory));
        let state = Arc::new(AppState {
            service: service.clone(),
            broadcaster: Arc::new(EventBroadcaster::default()),
        });
        (create_router(state), keypair, service)
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_status_and_latest_block() {
        let (router, keypair) = app().await;

        let (status, body) = send(&router, get("/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["domain"], "main");
        assert_eq!(body["validator"], keypair.public.to_hex());
        assert_eq!(body["active"], true);
        assert_eq!(body["block_number"], 0);

        let (status, body) = send(&router, get("/blocks/latest")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["number"], 0);
        assert_eq!(body["hash"], Value::Null);
    }

    #[tokio::test]
    async fn test_submit_command() {
        let (router, _) = app().await;
        let cmd = json!({
            "domain": "main",
            "contract_name": "kv",
            "method_name": "put",
            "params": { "key": "a", "value": 1 },
            "type": "safe"
        });

        let (status, body) = send(&router, post("/commands", cmd)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["requires_consensus"], true);

        let (_, body) = send(&router, get("/status")).await;
        assert_eq!(body["queued_commands"], 1);
    }

    #[tokio::test]
    async fn test_unknown_contract_is_bad_request() {
        let (router, _) = app().await;
        let cmd = json!({
            "domain": "main",
            "contract_name": "nope",
            "method_name": "put",
            "params": {},
            "type": "safe"
        });

        let (status, body) = send(&router, post("/commands", cmd)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_missing_blobs_are_not_found() {
        let (router, keypair) = app().await;
        let handle = Hash::ZERO.to_hex();

        let (status, _) = send(&router, get(&format!("/blocks/{}", handle))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&router, get(&format!("/pblocks/{}", handle))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let uri = format!("/pblocks/1/{}", keypair.public.to_hex());
        let (status, _) = send(&router, get(&uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&router, get("/blocks/not-hex")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_validators_listing() {
        let (router, keypair) = app().await;
        let (status, body) = send(&router, get("/validators")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["id"], keypair.public.to_hex());
    }

    #[tokio::test]
    async fn test_block_by_number() {
        let (router, keypair, service) = app_with_service().await;

        let (status, _) = send(&router, get("/blocks/number/1")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let pblock = PBlock::new_signed(&keypair, vec![], &BlockInfo::genesis()).unwrap();
        let block = service.core().add_in_consensus(pblock).await.unwrap();

        let (status, body) = send(&router, get("/blocks/number/1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["block_number"], 1);
        assert_eq!(body, serde_json::to_value(&block).unwrap());

        let (status, _) = send(&router, get("/blocks/number/one")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
