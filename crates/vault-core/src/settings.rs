use crate::error::{VaultError, VaultResult};
use crate::types::SignerId;
use serde::{Deserialize, Serialize};

/// Host-level settings of the wallet actor, changed only through `UpdateSettings`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CanisterSettings {
    pub controllers: Vec<SignerId>,
    /// Percentage of a compute core reserved for the wallet (0..=100).
    pub compute_allocation: Option<u8>,
    pub memory_allocation: Option<u64>,
    /// Seconds of idle cycles the host keeps before freezing the wallet.
    pub freezing_threshold: Option<u64>,
}

impl CanisterSettings {
    pub fn validate(&self) -> VaultResult<()> {
        if let Some(compute) = self.compute_allocation {
            if compute > 100 {
                return Err(VaultError::validation(format!(
                    "compute_allocation must be within 0..=100, got {compute}"
                )));
            }
        }
        let mut seen = std::collections::BTreeSet::new();
        for controller in &self.controllers {
            if controller.as_str().trim().is_empty() {
                return Err(VaultError::validation("controller id cannot be empty"));
            }
            if !seen.insert(controller) {
                return Err(VaultError::validation(format!(
                    "duplicate controller '{controller}'"
                )));
            }
        }
        Ok(())
    }
}
