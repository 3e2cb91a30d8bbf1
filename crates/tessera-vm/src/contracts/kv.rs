use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::{str_param, value_param};
use crate::context::CallContext;
use crate::contract::{Contract, MethodManifest};
use crate::error::VmError;

pub const KV_CONTRACT: &str = "kv";

/// General purpose key-value contract
#[derive(Debug, Default)]
pub struct KvContract;

impl KvContract {
    async fn put(ctx: &CallContext, params: &Value) -> Result<Value, VmError> {
        let key = str_param(params, "key")?;
        let value = value_param(params, "value")?;
        ctx.set(key, value.clone()).await?;
        debug!("Put key '{}' ({:?})", key, ctx.mode());
        Ok(value)
    }

    /// Copy `from` into `to` through the contract mediator
    async fn copy_from(ctx: &CallContext, params: &Value) -> Result<Value, VmError> {
        let from = str_param(params, "from")?;
        let to = str_param(params, "to")?;

        let value = ctx.call(KV_CONTRACT, "get", json!({ "key": from })).await?;
        if value.is_null() {
            return Err(VmError::InvalidOperation(format!("key '{}' not found", from)));
        }
        ctx.call(KV_CONTRACT, "internalPut", json!({ "key": to, "value": value }))
            .await
    }
}

#[async_trait]
impl Contract for KvContract {
    fn name(&self) -> &str {
        KV_CONTRACT
    }

    fn manifest(&self) -> MethodManifest {
        MethodManifest {
            safe: vec!["get", "getValidated", "put", "copyFrom"],
            nonced: vec!["putNonced"],
            protected: vec!["internalPut"],
        }
    }

    async fn call(&self, ctx: &CallContext, method: &str, params: &Value) -> Result<Value, VmError> {
        match method {
            "get" => Ok(ctx
                .get(str_param(params, "key")?)
                .await?
                .unwrap_or(Value::Null)),
            "getValidated" => Ok(ctx
                .get_validated(str_param(params, "key")?)
                .await?
                .unwrap_or(Value::Null)),
            "put" | "putNonced" | "internalPut" => Self::put(ctx, params).await,
            "copyFrom" => Self::copy_from(ctx, params).await,
            _ => Err(VmError::UnknownMethod {
                contract: KV_CONTRACT.to_string(),
                method: method.to_string(),
            }),
        }
    }
}
