//! Signer registry.
//!
//! Stores signers and the roles that scope them, and answers whether a signer may
//! initiate or approve a given operation kind at a given instant. Expiry of signers and
//! of `Limited` grants is evaluated against the instant passed in, never cached.

use crate::error::{VaultError, VaultResult};
use crate::operation::OperationKind;
use crate::types::{RoleId, SignerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// A single time-boxed grant inside a `Limited` access level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationAccess {
    pub kind: OperationKind,
    pub valid_until: Option<DateTime<Utc>>,
}

impl OperationAccess {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            valid_until: None,
        }
    }

    pub fn until(kind: OperationKind, valid_until: DateTime<Utc>) -> Self {
        Self {
            kind,
            valid_until: Some(valid_until),
        }
    }

    fn permits(&self, kind: OperationKind, now: DateTime<Utc>) -> bool {
        self.kind == kind && self.valid_until.map(|until| until >= now).unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "level", content = "grants", rename_all = "snake_case")]
pub enum AccessLevel {
    ReadOnly,
    /// Trusted system-to-system caller.
    Canister,
    FullAccess,
    Limited(Vec<OperationAccess>),
}

impl AccessLevel {
    pub fn permits(&self, kind: OperationKind, now: DateTime<Utc>) -> bool {
        match self {
            Self::FullAccess | Self::Canister => true,
            Self::ReadOnly => false,
            Self::Limited(grants) => grants.iter().any(|grant| grant.permits(kind, now)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub access: AccessLevel,
    /// Confirm votes required for operations initiated under this role.
    pub threshold: usize,
}

impl Role {
    pub fn new(name: impl Into<String>, access: AccessLevel) -> Self {
        Self {
            id: RoleId::generate(),
            name: name.into(),
            access,
            threshold: 1,
        }
    }

    pub fn with_id(mut self, id: RoleId) -> Self {
        self.id = id;
        self
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signer {
    pub id: SignerId,
    pub name: String,
    pub role_id: RoleId,
    /// Overrides the role threshold for operations this signer initiates.
    pub threshold: Option<usize>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Signer {
    pub fn new(id: impl Into<SignerId>, name: impl Into<String>, role_id: RoleId) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role_id,
            threshold: None,
            expires_at: None,
        }
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerRegistry {
    roles: BTreeMap<RoleId, Role>,
    signers: BTreeMap<SignerId, Signer>,
}

impl SignerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn roles(&self) -> impl Iterator<Item = &Role> {
        self.roles.values()
    }

    pub fn signers(&self) -> impl Iterator<Item = &Signer> {
        self.signers.values()
    }

    pub fn role(&self, id: &RoleId) -> Option<&Role> {
        self.roles.get(id)
    }

    pub fn signer(&self, id: &SignerId) -> Option<&Signer> {
        self.signers.get(id)
    }

    pub fn signer_count(&self) -> usize {
        self.signers.len()
    }

    pub fn add_role(&mut self, role: Role) -> VaultResult<RoleId> {
        if role.name.trim().is_empty() {
            return Err(VaultError::validation("role name cannot be empty"));
        }
        if role.threshold == 0 {
            return Err(VaultError::validation("role threshold must be at least 1"));
        }
        if self.roles.contains_key(&role.id) {
            return Err(VaultError::validation(format!(
                "role '{}' already exists",
                role.id
            )));
        }
        let id = role.id.clone();
        info!(role = %id, name = %role.name, "Role added");
        self.roles.insert(id.clone(), role);
        Ok(id)
    }

    pub fn remove_role(&mut self, id: &RoleId) -> VaultResult<Role> {
        if !self.roles.contains_key(id) {
            return Err(VaultError::validation(format!("unknown role '{id}'")));
        }
        if let Some(holder) = self.signers.values().find(|s| &s.role_id == id) {
            return Err(VaultError::validation(format!(
                "role '{id}' is still assigned to signer '{}'",
                holder.id
            )));
        }
        let role = self
            .roles
            .remove(id)
            .ok_or_else(|| VaultError::validation(format!("unknown role '{id}'")))?;
        info!(role = %id, "Role removed");
        Ok(role)
    }

    /// Insert or replace a signer. Replacing may change its role, so the full-access
    /// guard is re-checked against the resulting registry.
    pub fn add_signer(&mut self, signer: Signer) -> VaultResult<()> {
        if signer.id.as_str().trim().is_empty() {
            return Err(VaultError::validation("signer id cannot be empty"));
        }
        if signer.threshold == Some(0) {
            return Err(VaultError::validation("signer threshold must be at least 1"));
        }
        if !self.roles.contains_key(&signer.role_id) {
            return Err(VaultError::validation(format!(
                "unknown role '{}'",
                signer.role_id
            )));
        }
        let id = signer.id.clone();
        match self.signers.insert(id.clone(), signer) {
            Some(previous) if !self.has_full_access_signer() => {
                self.signers.insert(id.clone(), previous);
                Err(VaultError::validation(format!(
                    "changing signer '{id}' would leave no full-access signer"
                )))
            }
            Some(_) => {
                info!(signer = %id, "Signer replaced");
                Ok(())
            }
            None => {
                info!(signer = %id, "Signer added");
                Ok(())
            }
        }
    }

    pub fn remove_signer(&mut self, id: &SignerId) -> VaultResult<Signer> {
        let removed = self
            .signers
            .remove(id)
            .ok_or_else(|| VaultError::validation(format!("unknown signer '{id}'")))?;
        if !self.has_full_access_signer() {
            self.signers.insert(id.clone(), removed);
            return Err(VaultError::validation(format!(
                "removing signer '{id}' would leave no full-access signer"
            )));
        }
        info!(signer = %id, "Signer removed");
        Ok(removed)
    }

    pub fn set_signer_threshold(
        &mut self,
        id: &SignerId,
        threshold: Option<usize>,
    ) -> VaultResult<()> {
        if threshold == Some(0) {
            return Err(VaultError::validation("signer threshold must be at least 1"));
        }
        let signer = self
            .signers
            .get_mut(id)
            .ok_or_else(|| VaultError::validation(format!("unknown signer '{id}'")))?;
        signer.threshold = threshold;
        Ok(())
    }

    /// True if `id` is a registered signer that has not expired.
    pub fn validate_signer(&self, id: &SignerId, now: DateTime<Utc>) -> bool {
        self.signers
            .get(id)
            .map(|signer| signer.is_active(now))
            .unwrap_or(false)
    }

    pub fn can_authorize(&self, id: &SignerId, kind: OperationKind, now: DateTime<Utc>) -> bool {
        let Some(signer) = self.signers.get(id) else {
            return false;
        };
        if !signer.is_active(now) {
            return false;
        }
        self.roles
            .get(&signer.role_id)
            .map(|role| role.access.permits(kind, now))
            .unwrap_or(false)
    }

    pub fn eligible_voters(&self, kind: OperationKind, now: DateTime<Utc>) -> BTreeSet<SignerId> {
        self.signers
            .keys()
            .filter(|id| self.can_authorize(id, kind, now))
            .cloned()
            .collect()
    }

    /// Signer override if present, otherwise the role threshold.
    pub fn effective_threshold(&self, id: &SignerId) -> Option<usize> {
        let signer = self.signers.get(id)?;
        signer
            .threshold
            .or_else(|| self.roles.get(&signer.role_id).map(|role| role.threshold))
    }

    fn has_full_access_signer(&self) -> bool {
        self.signers.values().any(|signer| {
            self.roles
                .get(&signer.role_id)
                .map(|role| role.access == AccessLevel::FullAccess)
                .unwrap_or(false)
        })
    }
}
