use async_trait::async_trait;
use serde_json::Value;
use tessera_core::CommandType;

use crate::context::CallContext;
use crate::error::VmError;

/// How a contract method may be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Safe,
    Nonced,
    /// Only reachable through an inter-contract call
    Protected,
}

/// Methods a contract exposes, grouped by how they may be called
#[derive(Debug, Clone, Default)]
pub struct MethodManifest {
    pub safe: Vec<&'static str>,
    pub nonced: Vec<&'static str>,
    pub protected: Vec<&'static str>,
}

impl MethodManifest {
    pub fn kind_of(&self, method: &str) -> Option<MethodKind> {
        if self.safe.contains(&method) {
            Some(MethodKind::Safe)
        } else if self.nonced.contains(&method) {
            Some(MethodKind::Nonced)
        } else if self.protected.contains(&method) {
            Some(MethodKind::Protected)
        } else {
            None
        }
    }

    /// Whether a client command of the given type may invoke `method`
    pub fn allows(&self, command_type: CommandType, method: &str) -> bool {
        matches!(
            (command_type, self.kind_of(method)),
            (CommandType::Safe, Some(MethodKind::Safe))
                | (CommandType::Nonced, Some(MethodKind::Nonced))
        )
    }
}

/// A statically registered contract
#[async_trait]
pub trait Contract: Send + Sync {
    fn name(&self) -> &str;

    fn manifest(&self) -> MethodManifest;

    async fn call(&self, ctx: &CallContext, method: &str, params: &Value)
        -> Result<Value, VmError>;
}
