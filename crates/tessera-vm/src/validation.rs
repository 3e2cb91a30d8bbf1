use tessera_core::{Command, CoreError};

use crate::contract::MethodManifest;
use crate::error::VmError;

/// Domain, contract and method must be present and the domain must match
pub fn check_shape(cmd: &Command, domain: &str) -> Result<(), VmError> {
    if cmd.domain.is_empty() || cmd.contract_name.is_empty() || cmd.method_name.is_empty() {
        return Err(VmError::InvalidCommand(
            "domain, contract_name and method_name are required".to_string(),
        ));
    }
    if cmd.domain != domain {
        return Err(VmError::UnknownDomain(cmd.domain.clone()));
    }
    Ok(())
}

/// The method must be listed for the command's type
pub fn check_acl(cmd: &Command, manifest: &MethodManifest) -> Result<(), VmError> {
    if manifest.kind_of(&cmd.method_name).is_none() {
        return Err(VmError::UnknownMethod {
            contract: cmd.contract_name.clone(),
            method: cmd.method_name.clone(),
        });
    }
    if !manifest.allows(cmd.command_type, &cmd.method_name) {
        return Err(VmError::MethodNotAllowed {
            contract: cmd.contract_name.clone(),
            method: cmd.method_name.clone(),
            kind: format!("{:?}", cmd.command_type).to_lowercase(),
        });
    }
    Ok(())
}

pub fn check_signature(cmd: &Command) -> Result<(), VmError> {
    match cmd.verify_signature() {
        Ok(()) => Ok(()),
        Err(CoreError::MissingSignature) => Err(VmError::MissingSignature),
        Err(_) => Err(VmError::InvalidSignature),
    }
}

/// The timestamp must be within `window_ms` of `now` and the observed block
/// number within `tolerance` blocks of `latest`
pub fn check_freshness(
    cmd: &Command,
    now: u64,
    window_ms: u64,
    latest: u64,
    tolerance: u64,
) -> Result<(), VmError> {
    let timestamp = cmd
        .timestamp
        .ok_or_else(|| VmError::InvalidCommand("nonced command without timestamp".to_string()))?;
    if timestamp.abs_diff(now) > window_ms {
        return Err(VmError::StaleTimestamp { timestamp, now });
    }

    let block_number = cmd.block_number.ok_or_else(|| {
        VmError::InvalidCommand("nonced command without block number".to_string())
    })?;
    if block_number.saturating_add(tolerance) < latest {
        return Err(VmError::StaleBlockNumber {
            block_number,
            latest,
        });
    }
    Ok(())
}
