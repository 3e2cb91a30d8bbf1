use async_trait::async_trait;
use serde_json::{json, Value};
use tessera_core::{PublicKey, ValidatorRecord};
use tracing::info;

use super::str_param;
use crate::context::CallContext;
use crate::contract::{Contract, MethodManifest};
use crate::error::VmError;

pub const CONSENSUS_CONTRACT: &str = "consensus";

/// Storage key holding the validator directory
pub const VALIDATORS_KEY: &str = "validators";

/// Validator directory of the domain
#[derive(Debug, Default)]
pub struct ConsensusContract;

impl ConsensusContract {
    async fn validators(ctx: &CallContext) -> Result<Vec<ValidatorRecord>, VmError> {
        match ctx.get(VALIDATORS_KEY).await? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| VmError::InvalidOperation(format!("corrupt validator list: {}", e))),
            None => Ok(Vec::new()),
        }
    }

    /// Admit the command signer as a validator reachable at `url`
    async fn add_validator(ctx: &CallContext, params: &Value) -> Result<Value, VmError> {
        let id: PublicKey = str_param(params, "id")?
            .parse()
            .map_err(|_| VmError::InvalidParams("id is not a public key".to_string()))?;
        let url = str_param(params, "url")?;

        if ctx.signer() != Some(id) {
            return Err(VmError::InvalidOperation(
                "validators must sign their own admission".to_string(),
            ));
        }

        let mut validators = Self::validators(ctx).await?;
        if validators.iter().any(|v| v.id == id) {
            return Err(VmError::InvalidOperation(format!(
                "{} is already a validator",
                id.short()
            )));
        }

        validators.push(ValidatorRecord::new(id, url));
        let value = serde_json::to_value(&validators)
            .map_err(|e| VmError::InvalidOperation(e.to_string()))?;
        ctx.set(VALIDATORS_KEY, value.clone()).await?;

        info!("Validator {} added at {} ({:?})", id.short(), url, ctx.mode());
        Ok(value)
    }
}

#[async_trait]
impl Contract for ConsensusContract {
    fn name(&self) -> &str {
        CONSENSUS_CONTRACT
    }

    fn manifest(&self) -> MethodManifest {
        MethodManifest {
            safe: vec!["getValidators"],
            nonced: vec!["addValidator"],
            protected: vec![],
        }
    }

    async fn call(&self, ctx: &CallContext, method: &str, params: &Value) -> Result<Value, VmError> {
        match method {
            "getValidators" => Ok(json!(Self::validators(ctx).await?)),
            "addValidator" => Self::add_validator(ctx, params).await,
            _ => Err(VmError::UnknownMethod {
                contract: CONSENSUS_CONTRACT.to_string(),
                method: method.to_string(),
            }),
        }
    }
}
