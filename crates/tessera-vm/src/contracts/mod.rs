mod consensus;
mod kv;

use serde_json::Value;

use crate::error::VmError;

pub use consensus::{ConsensusContract, CONSENSUS_CONTRACT, VALIDATORS_KEY};
pub use kv::{KvContract, KV_CONTRACT};

pub(crate) fn str_param<'a>(params: &'a Value, name: &str) -> Result<&'a str, VmError> {
    params
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| VmError::InvalidParams(format!("missing string param '{}'", name)))
}

pub(crate) fn value_param(params: &Value, name: &str) -> Result<Value, VmError> {
    params
        .get(name)
        .cloned()
        .ok_or_else(|| VmError::InvalidParams(format!("missing param '{}'", name)))
}
