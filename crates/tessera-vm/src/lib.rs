pub mod context;
pub mod contract;
pub mod contracts;
pub mod engine;
pub mod error;
pub mod validation;

pub use context::CallContext;
pub use contract::{Contract, MethodKind, MethodManifest};
pub use contracts::{ConsensusContract, KvContract, CONSENSUS_CONTRACT, KV_CONTRACT};
pub use engine::{EngineConfig, ExecutionEngine, ExecutionResult, OptimisticExecution};
pub use error::VmError;
