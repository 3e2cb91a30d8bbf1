use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tessera_core::{Hash, PublicKey};
use tessera_state::{ContractStorage, ExecutionMode};
use tracing::debug;

use crate::contract::Contract;
use crate::error::VmError;

/// A contract with its storage
pub(crate) struct Registered {
    pub contract: Arc<dyn Contract>,
    pub storage: Arc<ContractStorage>,
}

pub(crate) type Registry = HashMap<String, Registered>;

/// Everything a contract method can reach while it runs
pub struct CallContext {
    registry: Arc<Registry>,
    contract: String,
    mode: ExecutionMode,
    command_hash: Hash,
    signer: Option<PublicKey>,
    wrote: Arc<AtomicBool>,
    depth: usize,
    max_depth: usize,
}

impl CallContext {
    pub(crate) fn new(
        registry: Arc<Registry>,
        contract: &str,
        mode: ExecutionMode,
        command_hash: Hash,
        signer: Option<PublicKey>,
        max_depth: usize,
    ) -> Self {
        CallContext {
            registry,
            contract: contract.to_string(),
            mode,
            command_hash,
            signer,
            wrote: Arc::new(AtomicBool::new(false)),
            depth: 0,
            max_depth,
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn command_hash(&self) -> Hash {
        self.command_hash
    }

    /// Signer of the originating command, if it was signed
    pub fn signer(&self) -> Option<PublicKey> {
        self.signer
    }

    /// Contract whose storage this context reads and writes
    pub fn contract(&self) -> &str {
        &self.contract
    }

    /// Whether any write happened in this call tree
    pub fn wrote(&self) -> bool {
        self.wrote.load(Ordering::SeqCst)
    }

    fn storage(&self) -> Result<&ContractStorage, VmError> {
        self.registry
            .get(&self.contract)
            .map(|entry| entry.storage.as_ref())
            .ok_or_else(|| VmError::UnknownContract(self.contract.clone()))
    }

    /// Read a key. Validated execution only sees validated values.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, VmError> {
        Ok(self.storage()?.get_for(key, self.mode).await?)
    }

    /// Read a key ignoring optimistic writes
    pub async fn get_validated(&self, key: &str) -> Result<Option<Value>, VmError> {
        Ok(self.storage()?.get_validated(key).await?)
    }

    pub async fn set(&self, key: &str, value: Value) -> Result<(), VmError> {
        self.storage()?
            .set(key, value, self.mode, self.command_hash)
            .await?;
        self.wrote.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Invoke a method of another contract (or this one) on behalf of the
    /// current command.
    ///
    /// Any declared method is reachable this way, protected ones included.
    pub fn call<'a>(
        &'a self,
        contract: &'a str,
        method: &'a str,
        params: Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, VmError>> + Send + 'a>> {
        Box::pin(async move {
            if self.depth >= self.max_depth {
                return Err(VmError::CallDepthExceeded);
            }

            let entry = self
                .registry
                .get(contract)
                .ok_or_else(|| VmError::UnknownContract(contract.to_string()))?;
            if entry.contract.manifest().kind_of(method).is_none() {
                return Err(VmError::UnknownMethod {
                    contract: contract.to_string(),
                    method: method.to_string(),
                });
            }

            debug!(
                "{} -> {}.{} (depth {})",
                self.contract,
                contract,
                method,
                self.depth + 1
            );

            let child = CallContext {
                registry: self.registry.clone(),
                contract: contract.to_string(),
                mode: self.mode,
                command_hash: self.command_hash,
                signer: self.signer,
                wrote: self.wrote.clone(),
                depth: self.depth + 1,
                max_depth: self.max_depth,
            };
            entry.contract.call(&child, method, &params).await
        })
    }
}
