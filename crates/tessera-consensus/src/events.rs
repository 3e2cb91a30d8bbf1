use tessera_core::Block;
use tessera_vm::ExecutionResult;

pub trait BlockEventSink: Send + Sync {
    fn on_block_finalized(&self, block: &Block, results: &[ExecutionResult]);
}
