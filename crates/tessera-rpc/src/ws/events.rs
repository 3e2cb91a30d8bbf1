use serde::Serialize;
use tessera_consensus::BlockEventSink;
use tessera_core::Block;
use tessera_vm::ExecutionResult;
use tokio::sync::broadcast;
use tracing::debug;

/// Events pushed to WebSocket subscribers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum WsEvent {
    BlockFinalized {
        block_number: u64,
        handle: String,
        pblock_count: usize,
    },
    CommandExecuted {
        block_number: u64,
        command_hash: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl WsEvent {
    pub fn block_finalized(block: &Block) -> Self {
        WsEvent::BlockFinalized {
            block_number: block.block_number,
            handle: block
                .handle()
                .map(|h| h.to_hex())
                .unwrap_or_default(),
            pblock_count: block.pblock_handles.len(),
        }
    }

    pub fn command_executed(block_number: u64, result: &ExecutionResult) -> Self {
        WsEvent::CommandExecuted {
            block_number,
            command_hash: result.command_hash.to_hex(),
            success: result.success,
            error: result.error.clone(),
        }
    }
}

/// Fans finalized blocks out to WebSocket clients
pub struct EventBroadcaster {
    sender: broadcast::Sender<WsEvent>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        EventBroadcaster { sender }
    }

    pub fn broadcast(&self, event: WsEvent) {
        // Without subscribers the event is simply dropped
        if let Ok(count) = self.sender.send(event) {
            debug!("Event delivered to {} subscribers", count);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WsEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl BlockEventSink for EventBroadcaster {
    fn on_block_finalized(&self, block: &Block, results: &[ExecutionResult]) {
        self.broadcast(WsEvent::block_finalized(block));
        for result in results {
            self.broadcast(WsEvent::command_executed(block.block_number, result));
        }
    }
}
