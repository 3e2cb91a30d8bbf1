use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::{hash_blake3, verify, Hash, KeyPair, PublicKey, Sig};
use crate::error::CoreError;
use crate::serialize;

/// How a command is admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandType {
    /// Runs immediately; only goes through consensus if it writes
    Safe,
    /// Signed, replay protected, always goes through consensus
    Nonced,
}

/// A client request to invoke a contract method within a domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub domain: String,
    pub contract_name: String,
    pub method_name: String,
    #[serde(default)]
    pub params: Value,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    /// Milliseconds since the epoch, required for nonced commands
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    /// Latest block number the signer observed; not part of the hash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer: Option<PublicKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Sig>,
}

/// Fields covered by the command hash
#[derive(Serialize)]
struct CommandDigest<'a> {
    domain: &'a str,
    contract_name: &'a str,
    method_name: &'a str,
    params: String,
    timestamp: Option<u64>,
}

impl Command {
    /// Create a safe command
    pub fn safe(domain: &str, contract_name: &str, method_name: &str, params: Value) -> Self {
        Command {
            domain: domain.to_string(),
            contract_name: contract_name.to_string(),
            method_name: method_name.to_string(),
            params,
            command_type: CommandType::Safe,
            timestamp: None,
            block_number: None,
            signer: None,
            signature: None,
        }
    }

    /// Create an unsigned nonced command
    pub fn nonced(
        domain: &str,
        contract_name: &str,
        method_name: &str,
        params: Value,
        timestamp: u64,
        block_number: u64,
    ) -> Self {
        Command {
            command_type: CommandType::Nonced,
            timestamp: Some(timestamp),
            block_number: Some(block_number),
            ..Self::safe(domain, contract_name, method_name, params)
        }
    }

    pub fn is_nonced(&self) -> bool {
        self.command_type == CommandType::Nonced
    }

    /// Compute the command hash.
    ///
    /// Covers domain, contract, method and params; the timestamp is folded in
    /// only for nonced commands, so equal safe calls collapse to one hash.
    pub fn hash(&self) -> Result<Hash, CoreError> {
        let digest = CommandDigest {
            domain: &self.domain,
            contract_name: &self.contract_name,
            method_name: &self.method_name,
            params: serialize::canonical_json(&self.params)?,
            timestamp: if self.is_nonced() { self.timestamp } else { None },
        };
        Ok(hash_blake3(&serialize::to_bytes(&digest)?))
    }

    /// Sign the command hash, setting signer and signature
    pub fn sign(&mut self, keypair: &KeyPair) -> Result<(), CoreError> {
        let hash = self.hash()?;
        self.signer = Some(keypair.public);
        self.signature = Some(keypair.sign_hash(&hash));
        Ok(())
    }

    /// Verify the signature against the declared signer
    pub fn verify_signature(&self) -> Result<(), CoreError> {
        let signer = self.signer.ok_or(CoreError::MissingSignature)?;
        let signature = self.signature.ok_or(CoreError::MissingSignature)?;
        verify(&signer, self.hash()?.as_bytes(), &signature)
    }
}
