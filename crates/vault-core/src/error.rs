use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Caller-facing classification of a [`VaultError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed identifiers, unknown chains or operation kinds.
    Validation,
    /// Caller may not initiate or vote on the operation kind.
    Authorization,
    /// Operation already terminal, ineligible voter, duplicate vote, deadline passed.
    Consensus,
    /// The effect itself failed (funds, external actor, hash mismatch).
    Execution,
    /// Persistence or encoding failure of the hosting actor.
    Infrastructure,
}

/// Vault runtime errors.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Signer '{signer}' is not authorized: {reason}")]
    Unauthorized { signer: String, reason: String },

    #[error("Operation {0} not found")]
    OperationNotFound(u64),

    #[error("Operation {id} is already {status}")]
    AlreadyResolved { id: u64, status: String },

    #[error("Signer '{signer}' is not an eligible voter for operation {id}")]
    NotEligibleVoter { id: u64, signer: String },

    #[error("Signer '{signer}' already voted on operation {id}")]
    DuplicateVote { id: u64, signer: String },

    #[error("Operation {0} passed its deadline")]
    DeadlineExpired(u64),

    #[error("Insufficient funds on {chain}: required {required}, available {available}")]
    InsufficientFunds {
        chain: String,
        required: u128,
        available: u128,
    },

    #[error("Connector '{connector}' failed: {message}")]
    Connector { connector: String, message: String },

    #[error("Module hash mismatch: expected {expected}, loaded {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Code loader error: {0}")]
    Loader(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl VaultError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unauthorized(signer: impl ToString, reason: impl Into<String>) -> Self {
        Self::Unauthorized {
            signer: signer.to_string(),
            reason: reason.into(),
        }
    }

    pub fn connector(connector: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connector {
            connector: connector.into(),
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Unauthorized { .. } => ErrorCategory::Authorization,
            Self::OperationNotFound(_)
            | Self::AlreadyResolved { .. }
            | Self::NotEligibleVoter { .. }
            | Self::DuplicateVote { .. }
            | Self::DeadlineExpired(_) => ErrorCategory::Consensus,
            Self::InsufficientFunds { .. }
            | Self::Connector { .. }
            | Self::HashMismatch { .. }
            | Self::Loader(_) => ErrorCategory::Execution,
            Self::Storage(_) | Self::Serialization(_) => ErrorCategory::Infrastructure,
        }
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type VaultResult<T> = Result<T, VaultError>;
