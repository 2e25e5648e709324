use crate::error::{VaultError, VaultResult};
use crate::operation::{OperationResult, OperationStatus, PendingOperation};
use crate::types::OperationId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable record of a resolved operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedOperation {
    pub index: u64,
    pub operation: PendingOperation,
    pub status: OperationStatus,
    pub result: Option<OperationResult>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

impl ProcessedOperation {
    pub fn id(&self) -> OperationId {
        self.operation.id
    }
}

/// Outcome handed to the log when an operation leaves the pending set.
#[derive(Debug, Clone)]
pub enum Resolution {
    Executed(OperationResult),
    ExecutionFailed(String),
    /// Rejected by vote or expired; nothing was executed.
    NotExecuted,
}

/// Append-only audit log with hash-chain proofs.
///
/// There is no mutation or deletion API; every resolved operation becomes one entry.
#[derive(Debug, Default, Clone)]
pub struct ProcessedLog {
    entries: Vec<ProcessedOperation>,
}

impl ProcessedLog {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Rebuild from persisted entries and verify hash-chain integrity.
    pub fn from_entries(entries: Vec<ProcessedOperation>) -> VaultResult<Self> {
        let log = Self { entries };

        for (expected_index, entry) in log.entries.iter().enumerate() {
            if entry.index != expected_index as u64 {
                return Err(VaultError::Storage(format!(
                    "processed log index gap at position {} (found {})",
                    expected_index, entry.index
                )));
            }
        }

        if !log.verify_chain() {
            return Err(VaultError::Storage(
                "processed log hash-chain verification failed".to_string(),
            ));
        }

        Ok(log)
    }

    pub fn entries(&self) -> &[ProcessedOperation] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, id: OperationId) -> Option<&ProcessedOperation> {
        self.entries.iter().find(|entry| entry.operation.id == id)
    }

    pub fn append(
        &mut self,
        operation: PendingOperation,
        resolution: Resolution,
        timestamp: DateTime<Utc>,
    ) -> VaultResult<ProcessedOperation> {
        if !operation.status.is_terminal() {
            return Err(VaultError::validation(format!(
                "operation {} is still pending",
                operation.id
            )));
        }
        if self.find(operation.id).is_some() {
            return Err(VaultError::AlreadyResolved {
                id: operation.id,
                status: operation.status.to_string(),
            });
        }

        let (status, result, error) = match resolution {
            Resolution::Executed(result) => (operation.status, Some(result), None),
            // the vote succeeded but the effect did not
            Resolution::ExecutionFailed(error) => (OperationStatus::Fail, None, Some(error)),
            Resolution::NotExecuted => (operation.status, None, None),
        };

        let index = self.entries.len() as u64;
        let previous_hash = self.entries.last().map(|entry| entry.entry_hash.clone());
        let mut entry = ProcessedOperation {
            index,
            operation,
            status,
            result,
            error,
            timestamp,
            previous_hash,
            entry_hash: String::new(),
        };
        entry.entry_hash = compute_entry_hash(&entry)?;
        self.entries.push(entry.clone());
        Ok(entry)
    }

    pub fn verify_chain(&self) -> bool {
        let mut previous_hash: Option<String> = None;
        for entry in &self.entries {
            if entry.previous_hash != previous_hash {
                return false;
            }
            match compute_entry_hash(entry) {
                Ok(expected) if expected == entry.entry_hash => {}
                _ => return false,
            }
            previous_hash = Some(entry.entry_hash.clone());
        }
        true
    }
}

/// Fields covered by the entry hash; `entry_hash` itself is excluded.
#[derive(Serialize)]
struct HashMaterial<'a> {
    index: u64,
    operation: &'a PendingOperation,
    status: OperationStatus,
    result: &'a Option<OperationResult>,
    error: &'a Option<String>,
    timestamp: &'a DateTime<Utc>,
    previous_hash: &'a Option<String>,
}

fn compute_entry_hash(entry: &ProcessedOperation) -> VaultResult<String> {
    // streamed straight to bytes: amounts are u128 and do not fit a JSON value
    let bytes = serde_json::to_vec(&HashMaterial {
        index: entry.index,
        operation: &entry.operation,
        status: entry.status,
        result: &entry.result,
        error: &entry.error,
        timestamp: &entry.timestamp,
        previous_hash: &entry.previous_hash,
    })?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}
