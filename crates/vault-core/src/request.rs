//! Operation request manager.
//!
//! Creates pending operations, records votes and computes status transitions. Deadlines
//! are enforced lazily: callers sweep with [`OperationRequestManager::expire_stale`]
//! before any read or vote, there is no background timer.

use crate::config::WalletConfig;
use crate::error::{VaultError, VaultResult};
use crate::operation::{Operation, OperationStatus, PendingOperation, Vote, OPERATION_VERSION};
use crate::signer::SignerRegistry;
use crate::types::{OperationId, SignerId};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct OperationRequestManager {
    pending: BTreeMap<OperationId, PendingOperation>,
    next_id: OperationId,
    default_deadline: Duration,
    creator_auto_confirm: bool,
}

impl OperationRequestManager {
    pub fn new(config: &WalletConfig) -> Self {
        Self {
            pending: BTreeMap::new(),
            next_id: 1,
            default_deadline: i64::try_from(config.default_deadline_secs)
                .ok()
                .and_then(Duration::try_seconds)
                .unwrap_or_else(|| Duration::days(7)),
            creator_auto_confirm: config.creator_auto_confirm,
        }
    }

    /// Rebuild from persisted state.
    pub fn restore(
        config: &WalletConfig,
        pending: Vec<PendingOperation>,
        next_id: OperationId,
    ) -> VaultResult<Self> {
        let mut manager = Self::new(config);
        for operation in pending {
            if operation.status != OperationStatus::Pending {
                return Err(VaultError::Storage(format!(
                    "persisted pending operation {} has status {}",
                    operation.id, operation.status
                )));
            }
            if operation.id >= next_id {
                return Err(VaultError::Storage(format!(
                    "persisted operation {} is not below next id {}",
                    operation.id, next_id
                )));
            }
            manager.pending.insert(operation.id, operation);
        }
        manager.next_id = next_id.max(1);
        Ok(manager)
    }

    pub fn next_id(&self) -> OperationId {
        self.next_id
    }

    pub fn get(&self, id: OperationId) -> Option<&PendingOperation> {
        self.pending.get(&id)
    }

    pub fn list(&self) -> Vec<PendingOperation> {
        self.pending.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Open a new operation on behalf of `creator`.
    ///
    /// Voters and threshold are frozen here. The returned record is already terminal when
    /// the creator's automatic confirm satisfies the threshold; such records are not kept.
    pub fn request(
        &mut self,
        registry: &SignerRegistry,
        creator: &SignerId,
        operation: Operation,
        consent_message: impl Into<String>,
        deadline: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> VaultResult<PendingOperation> {
        let kind = operation.kind();
        if !registry.validate_signer(creator, now) {
            return Err(VaultError::unauthorized(creator, "not an active signer"));
        }
        if !registry.can_authorize(creator, kind, now) {
            return Err(VaultError::unauthorized(
                creator,
                format!("role does not permit {kind}"),
            ));
        }
        let deadline = match deadline {
            Some(deadline) if deadline <= now => {
                return Err(VaultError::validation(format!(
                    "deadline {deadline} is not in the future"
                )));
            }
            Some(deadline) => deadline,
            None => now
                .checked_add_signed(self.default_deadline)
                .ok_or_else(|| VaultError::validation("default deadline overflows the clock"))?,
        };

        let allowed_signers = registry.eligible_voters(kind, now);
        let threshold = registry
            .effective_threshold(creator)
            .unwrap_or(1)
            .clamp(1, allowed_signers.len().max(1));

        let id = self.next_id;
        self.next_id += 1;

        let mut pending = PendingOperation {
            id,
            operation,
            allowed_signers,
            threshold,
            responses: BTreeMap::new(),
            status: OperationStatus::Pending,
            deadline,
            created_by: creator.clone(),
            created_at: now,
            consent_message: consent_message.into(),
            version: OPERATION_VERSION,
        };

        info!(
            operation_id = id,
            kind = %kind,
            signer = %creator,
            threshold,
            voters = pending.allowed_signers.len(),
            "Operation requested"
        );

        if self.creator_auto_confirm {
            pending.responses.insert(creator.clone(), Vote::Confirm);
            pending.status = pending.tally();
            if pending.status.is_terminal() {
                info!(operation_id = id, status = %pending.status, "Operation resolved on request");
                return Ok(pending);
            }
        }

        self.pending.insert(id, pending.clone());
        Ok(pending)
    }

    /// Record a vote. A terminal result is removed from the pending set and returned.
    pub fn respond(
        &mut self,
        registry: &SignerRegistry,
        id: OperationId,
        signer: &SignerId,
        vote: Vote,
        now: DateTime<Utc>,
    ) -> VaultResult<PendingOperation> {
        let operation = self
            .pending
            .get_mut(&id)
            .ok_or(VaultError::OperationNotFound(id))?;

        if operation.is_expired(now) {
            return Err(VaultError::DeadlineExpired(id));
        }
        if !operation.allowed_signers.contains(signer) {
            return Err(VaultError::NotEligibleVoter {
                id,
                signer: signer.to_string(),
            });
        }
        if !registry.validate_signer(signer, now) {
            return Err(VaultError::unauthorized(signer, "no longer an active signer"));
        }
        let kind = operation.kind();
        if !registry.can_authorize(signer, kind, now) {
            return Err(VaultError::unauthorized(
                signer,
                format!("role no longer permits {kind}"),
            ));
        }
        if operation.responses.contains_key(signer) {
            return Err(VaultError::DuplicateVote {
                id,
                signer: signer.to_string(),
            });
        }

        operation.responses.insert(signer.clone(), vote);
        operation.status = operation.tally();

        debug!(
            operation_id = id,
            signer = %signer,
            vote = ?vote,
            confirms = operation.confirms(),
            rejects = operation.rejects(),
            "Vote recorded"
        );

        let status = operation.status;
        match status {
            OperationStatus::Pending => Ok(operation.clone()),
            status => {
                let resolved = self
                    .pending
                    .remove(&id)
                    .ok_or(VaultError::OperationNotFound(id))?;
                if status == OperationStatus::Success {
                    info!(operation_id = id, status = %status, "Operation approved");
                } else {
                    warn!(operation_id = id, status = %status, "Operation rejected");
                }
                Ok(resolved)
            }
        }
    }

    /// Move every operation past its deadline to Expired and hand them back.
    pub fn expire_stale(&mut self, now: DateTime<Utc>) -> Vec<PendingOperation> {
        let stale: Vec<OperationId> = self
            .pending
            .values()
            .filter(|operation| operation.is_expired(now))
            .map(|operation| operation.id)
            .collect();

        stale
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .map(|mut operation| {
                operation.status = OperationStatus::Expired;
                warn!(operation_id = operation.id, deadline = %operation.deadline, "Operation expired");
                operation
            })
            .collect()
    }
}
