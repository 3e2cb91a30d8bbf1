use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use tessera_core::{
    Block, BlockInfo, Command, Hash, NonInclusionVote, PBlock, PBlockNotification, ValidatorId,
    ValidatorRecord,
};
use tokio::sync::RwLock;

use crate::domain::DomainService;
use crate::error::ConsensusError;
use crate::net::ErrorResponse;

/// Calls one validator makes on another
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn get_latest_block_info(&self) -> Result<BlockInfo, ConsensusError>;

    async fn get_block(&self, handle: &Hash) -> Result<Block, ConsensusError>;

    async fn get_pblock(&self, handle: &Hash) -> Result<PBlock, ConsensusError>;

    async fn get_pblock_proposed_by_validator(
        &self,
        block_number: u64,
        validator: &ValidatorId,
    ) -> Result<Option<PBlock>, ConsensusError>;

    async fn get_validators(&self) -> Result<Vec<ValidatorRecord>, ConsensusError>;

    /// Submit a signed `addValidator` command
    async fn add_domain_validator(&self, proposal: &Command) -> Result<(), ConsensusError>;

    async fn notify_pblock_added(
        &self,
        notification: &PBlockNotification,
    ) -> Result<(), ConsensusError>;

    async fn notify_non_inclusion(&self, vote: &NonInclusionVote) -> Result<(), ConsensusError>;
}

/// Resolves a validator URL to a client
pub trait PeerConnector: Send + Sync {
    fn connect(&self, url: &str) -> Arc<dyn PeerClient>;
}

/// Peer RPC over HTTP
#[derive(Clone)]
pub struct HttpPeerClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpPeerClient {
    pub fn new(base_url: &str, client: reqwest::Client) -> Self {
        HttpPeerClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(&self, response: Response) -> Result<Response, ConsensusError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(ConsensusError::NotFound(response.url().path().to_string()));
        }
        let message = match response.json::<ErrorResponse>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        Err(ConsensusError::Peer(format!(
            "{} answered {}: {}",
            self.base_url, status, message
        )))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ConsensusError> {
        let response = self.client.get(self.url(path)).send().await?;
        Ok(self.check(response).await?.json().await?)
    }

    async fn post_json<B: serde::Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(), ConsensusError> {
        let response = self.client.post(self.url(path)).json(body).send().await?;
        self.check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn get_latest_block_info(&self) -> Result<BlockInfo, ConsensusError> {
        self.get_json("/blocks/latest").await
    }

    async fn get_block(&self, handle: &Hash) -> Result<Block, ConsensusError> {
        self.get_json(&format!("/blocks/{}", handle.to_hex())).await
    }

    async fn get_pblock(&self, handle: &Hash) -> Result<PBlock, ConsensusError> {
        self.get_json(&format!("/pblocks/{}", handle.to_hex())).await
    }

    async fn get_pblock_proposed_by_validator(
        &self,
        block_number: u64,
        validator: &ValidatorId,
    ) -> Result<Option<PBlock>, ConsensusError> {
        let path = format!("/pblocks/{}/{}", block_number, validator.to_hex());
        match self.get_json(&path).await {
            Ok(pblock) => Ok(Some(pblock)),
            Err(ConsensusError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_validators(&self) -> Result<Vec<ValidatorRecord>, ConsensusError> {
        self.get_json("/validators").await
    }

    async fn add_domain_validator(&self, proposal: &Command) -> Result<(), ConsensusError> {
        self.post_json("/validators", proposal).await
    }

    async fn notify_pblock_added(
        &self,
        notification: &PBlockNotification,
    ) -> Result<(), ConsensusError> {
        self.post_json("/notifications/pblock", notification).await
    }

    async fn notify_non_inclusion(&self, vote: &NonInclusionVote) -> Result<(), ConsensusError> {
        self.post_json("/notifications/non-inclusion", vote).await
    }
}

/// Creates HTTP clients sharing one connection pool
pub struct HttpConnector {
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new(request_timeout: Duration) -> Result<Self, ConsensusError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(HttpConnector { client })
    }
}

impl PeerConnector for HttpConnector {
    fn connect(&self, url: &str) -> Arc<dyn PeerClient> {
        Arc::new(HttpPeerClient::new(url, self.client.clone()))
    }
}

/// Routes peer calls to services running in the same process.
///
/// Nodes are registered by URL; calls to unknown or disconnected URLs fail
/// like an unreachable host would.
#[derive(Default)]
pub struct InProcessNetwork {
    nodes: RwLock<HashMap<String, Weak<DomainService>>>,
    disconnected: RwLock<HashSet<String>>,
}

impl InProcessNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register(&self, url: &str, service: &Arc<DomainService>) {
        self.nodes
            .write()
            .await
            .insert(url.to_string(), Arc::downgrade(service));
    }

    pub async fn disconnect(&self, url: &str) {
        self.disconnected.write().await.insert(url.to_string());
    }

    pub async fn reconnect(&self, url: &str) {
        self.disconnected.write().await.remove(url);
    }

    async fn service(&self, url: &str) -> Result<Arc<DomainService>, ConsensusError> {
        if self.disconnected.read().await.contains(url) {
            return Err(ConsensusError::Peer(format!("{} is unreachable", url)));
        }
        self.nodes
            .read()
            .await
            .get(url)
            .and_then(Weak::upgrade)
            .ok_or_else(|| ConsensusError::Peer(format!("{} is unreachable", url)))
    }
}

/// Connector handing out clients bound to an [`InProcessNetwork`]
pub struct InProcessConnector {
    network: Arc<InProcessNetwork>,
}

impl InProcessConnector {
    pub fn new(network: Arc<InProcessNetwork>) -> Self {
        InProcessConnector { network }
    }
}

impl PeerConnector for InProcessConnector {
    fn connect(&self, url: &str) -> Arc<dyn PeerClient> {
        Arc::new(InProcessPeer {
            network: self.network.clone(),
            url: url.to_string(),
        })
    }
}

struct InProcessPeer {
    network: Arc<InProcessNetwork>,
    url: String,
}

#[async_trait]
impl PeerClient for InProcessPeer {
    async fn get_latest_block_info(&self) -> Result<BlockInfo, ConsensusError> {
        Ok(self.network.service(&self.url).await?.latest_block_info())
    }

    async fn get_block(&self, handle: &Hash) -> Result<Block, ConsensusError> {
        self.network.service(&self.url).await?.get_block(handle).await
    }

    async fn get_pblock(&self, handle: &Hash) -> Result<PBlock, ConsensusError> {
        self.network.service(&self.url).await?.get_pblock(handle).await
    }

    async fn get_pblock_proposed_by_validator(
        &self,
        block_number: u64,
        validator: &ValidatorId,
    ) -> Result<Option<PBlock>, ConsensusError> {
        Ok(self
            .network
            .service(&self.url)
            .await?
            .get_pblock_proposed_by_validator(block_number, validator)
            .await)
    }

    async fn get_validators(&self) -> Result<Vec<ValidatorRecord>, ConsensusError> {
        Ok(self.network.service(&self.url).await?.validators().await)
    }

    async fn add_domain_validator(&self, proposal: &Command) -> Result<(), ConsensusError> {
        self.network
            .service(&self.url)
            .await?
            .add_domain_validator(proposal.clone())
            .await
            .map(|_| ())
    }

    async fn notify_pblock_added(
        &self,
        notification: &PBlockNotification,
    ) -> Result<(), ConsensusError> {
        self.network
            .service(&self.url)
            .await?
            .on_pblock_added(notification.clone())
            .await
    }

    async fn notify_non_inclusion(&self, vote: &NonInclusionVote) -> Result<(), ConsensusError> {
        self.network
            .service(&self.url)
            .await?
            .on_non_inclusion(vote.clone())
            .await
    }
}
