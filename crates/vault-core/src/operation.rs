//! Operation payloads, results and the in-flight `PendingOperation` record.

use crate::chain::ChainType;
use crate::settings::CanisterSettings;
use crate::signer::AccessLevel;
use crate::types::{AccountId, OperationId, RoleId, SignerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Schema tag stamped on every pending operation.
pub const OPERATION_VERSION: u32 = 1;

/// Operation discriminant used for access scoping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CreateAccount,
    RenameAccount,
    HideAccount,
    UnhideAccount,
    RemoveAccount,
    CreateAddress,
    RemoveAddress,
    SendBtc,
    SendEvmNative,
    SendErc20,
    SendIcp,
    SendIcrc,
    SwapBtcToCkbtc,
    SwapCkbtcToBtc,
    SignMessage,
    SignEvmTransaction,
    AddSigner,
    RemoveSigner,
    UpdateSignerThreshold,
    AddRole,
    RemoveRole,
    UpdateSettings,
    UpgradeCode,
}

impl OperationKind {
    pub const ALL: [OperationKind; 23] = [
        Self::CreateAccount,
        Self::RenameAccount,
        Self::HideAccount,
        Self::UnhideAccount,
        Self::RemoveAccount,
        Self::CreateAddress,
        Self::RemoveAddress,
        Self::SendBtc,
        Self::SendEvmNative,
        Self::SendErc20,
        Self::SendIcp,
        Self::SendIcrc,
        Self::SwapBtcToCkbtc,
        Self::SwapCkbtcToBtc,
        Self::SignMessage,
        Self::SignEvmTransaction,
        Self::AddSigner,
        Self::RemoveSigner,
        Self::UpdateSignerThreshold,
        Self::AddRole,
        Self::RemoveRole,
        Self::UpdateSettings,
        Self::UpgradeCode,
    ];
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = serde_json::to_value(self)
            .ok()
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{self:?}"));
        f.write_str(&text)
    }
}

/// A proposed state change awaiting multi-signer approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "args", rename_all = "snake_case")]
pub enum Operation {
    CreateAccount {
        name: String,
    },
    RenameAccount {
        account_id: AccountId,
        name: String,
    },
    HideAccount {
        account_id: AccountId,
    },
    UnhideAccount {
        account_id: AccountId,
    },
    RemoveAccount {
        account_id: AccountId,
    },
    CreateAddress {
        account_id: AccountId,
        chain: ChainType,
    },
    RemoveAddress {
        account_id: AccountId,
        chain: ChainType,
    },
    SendBtc {
        account_id: AccountId,
        to: String,
        amount: u128,
    },
    SendEvmNative {
        account_id: AccountId,
        chain_id: u64,
        to: String,
        amount: u128,
    },
    SendErc20 {
        account_id: AccountId,
        chain_id: u64,
        contract: String,
        to: String,
        amount: u128,
    },
    SendIcp {
        account_id: AccountId,
        to: String,
        amount: u128,
        memo: Option<u64>,
    },
    SendIcrc {
        account_id: AccountId,
        ledger: String,
        to: String,
        amount: u128,
    },
    /// Deposit BTC at the minter's address; ckBTC is credited once the minter reports the mint.
    SwapBtcToCkbtc {
        account_id: AccountId,
        amount: u128,
    },
    /// Burn ckBTC and ask the minter to release BTC to `btc_address`.
    SwapCkbtcToBtc {
        account_id: AccountId,
        btc_address: String,
        amount: u128,
    },
    SignMessage {
        account_id: AccountId,
        message: String,
    },
    SignEvmTransaction {
        account_id: AccountId,
        chain_id: u64,
        /// Hex-encoded unsigned transaction payload.
        transaction: String,
    },
    /// Adds a signer, or replaces an existing one (role, name, threshold, expiry).
    AddSigner {
        signer_id: SignerId,
        name: String,
        role_id: RoleId,
        threshold: Option<usize>,
        expires_at: Option<DateTime<Utc>>,
    },
    RemoveSigner {
        signer_id: SignerId,
    },
    UpdateSignerThreshold {
        signer_id: SignerId,
        threshold: Option<usize>,
    },
    AddRole {
        name: String,
        access: AccessLevel,
        threshold: usize,
    },
    RemoveRole {
        role_id: RoleId,
    },
    UpdateSettings {
        settings: CanisterSettings,
    },
    /// Swap the running module for the uploaded one if it hashes to the registered release.
    UpgradeCode {
        version: String,
    },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::CreateAccount { .. } => OperationKind::CreateAccount,
            Self::RenameAccount { .. } => OperationKind::RenameAccount,
            Self::HideAccount { .. } => OperationKind::HideAccount,
            Self::UnhideAccount { .. } => OperationKind::UnhideAccount,
            Self::RemoveAccount { .. } => OperationKind::RemoveAccount,
            Self::CreateAddress { .. } => OperationKind::CreateAddress,
            Self::RemoveAddress { .. } => OperationKind::RemoveAddress,
            Self::SendBtc { .. } => OperationKind::SendBtc,
            Self::SendEvmNative { .. } => OperationKind::SendEvmNative,
            Self::SendErc20 { .. } => OperationKind::SendErc20,
            Self::SendIcp { .. } => OperationKind::SendIcp,
            Self::SendIcrc { .. } => OperationKind::SendIcrc,
            Self::SwapBtcToCkbtc { .. } => OperationKind::SwapBtcToCkbtc,
            Self::SwapCkbtcToBtc { .. } => OperationKind::SwapCkbtcToBtc,
            Self::SignMessage { .. } => OperationKind::SignMessage,
            Self::SignEvmTransaction { .. } => OperationKind::SignEvmTransaction,
            Self::AddSigner { .. } => OperationKind::AddSigner,
            Self::RemoveSigner { .. } => OperationKind::RemoveSigner,
            Self::UpdateSignerThreshold { .. } => OperationKind::UpdateSignerThreshold,
            Self::AddRole { .. } => OperationKind::AddRole,
            Self::RemoveRole { .. } => OperationKind::RemoveRole,
            Self::UpdateSettings { .. } => OperationKind::UpdateSettings,
            Self::UpgradeCode { .. } => OperationKind::UpgradeCode,
        }
    }

    /// Account the operation targets, if any.
    pub fn account_id(&self) -> Option<&AccountId> {
        match self {
            Self::RenameAccount { account_id, .. }
            | Self::HideAccount { account_id }
            | Self::UnhideAccount { account_id }
            | Self::RemoveAccount { account_id }
            | Self::CreateAddress { account_id, .. }
            | Self::RemoveAddress { account_id, .. }
            | Self::SendBtc { account_id, .. }
            | Self::SendEvmNative { account_id, .. }
            | Self::SendErc20 { account_id, .. }
            | Self::SendIcp { account_id, .. }
            | Self::SendIcrc { account_id, .. }
            | Self::SwapBtcToCkbtc { account_id, .. }
            | Self::SwapCkbtcToBtc { account_id, .. }
            | Self::SignMessage { account_id, .. }
            | Self::SignEvmTransaction { account_id, .. } => Some(account_id),
            _ => None,
        }
    }
}

/// Effect produced by a successfully executed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationResult {
    AccountCreated {
        account_id: AccountId,
    },
    AccountRenamed {
        account_id: AccountId,
        name: String,
    },
    AccountHidden {
        account_id: AccountId,
    },
    AccountUnhidden {
        account_id: AccountId,
    },
    AccountRemoved {
        account_id: AccountId,
    },
    AddressCreated {
        chain: ChainType,
        address: String,
    },
    AddressRemoved {
        chain: ChainType,
    },
    BtcSent {
        txid: String,
    },
    EvmSent {
        tx_hash: String,
        block_index: u64,
    },
    Erc20Sent {
        tx_hash: String,
        block_index: u64,
    },
    IcpSent {
        block_index: u64,
    },
    IcrcSent {
        tx_index: u128,
    },
    BtcSwapped {
        txid: String,
    },
    CkbtcSwapped {
        block_index: u64,
    },
    MessageSigned {
        signature: String,
    },
    EvmTransactionSigned {
        signature: String,
    },
    SignerAdded {
        signer_id: SignerId,
    },
    SignerRemoved {
        signer_id: SignerId,
    },
    SignerThresholdUpdated {
        signer_id: SignerId,
        threshold: Option<usize>,
    },
    RoleAdded {
        role_id: RoleId,
    },
    RoleRemoved {
        role_id: RoleId,
    },
    SettingsUpdated {
        settings: CanisterSettings,
    },
    CodeUpgraded {
        version: String,
        module_hash: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vote {
    Confirm,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Success,
    Fail,
    Expired,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Fail => "fail",
            Self::Expired => "expired",
        };
        f.write_str(text)
    }
}

/// An operation collecting votes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: OperationId,
    pub operation: Operation,
    /// Voters frozen at creation; later registry edits never change this set.
    pub allowed_signers: BTreeSet<SignerId>,
    /// Confirm votes required, fixed at creation.
    pub threshold: usize,
    pub responses: BTreeMap<SignerId, Vote>,
    pub status: OperationStatus,
    pub deadline: DateTime<Utc>,
    pub created_by: SignerId,
    pub created_at: DateTime<Utc>,
    pub consent_message: String,
    pub version: u32,
}

impl PendingOperation {
    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }

    pub fn confirms(&self) -> usize {
        self.responses
            .values()
            .filter(|vote| **vote == Vote::Confirm)
            .count()
    }

    pub fn rejects(&self) -> usize {
        self.responses
            .values()
            .filter(|vote| **vote == Vote::Reject)
            .count()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline
    }

    /// Status implied by the recorded votes.
    ///
    /// Success once confirms reach the threshold; Fail once rejects exceed
    /// `allowed - threshold`, since the remaining voters can no longer reach it.
    pub fn tally(&self) -> OperationStatus {
        let allowed = self.allowed_signers.len();
        if self.confirms() >= self.threshold {
            OperationStatus::Success
        } else if self.rejects() > allowed.saturating_sub(self.threshold) {
            OperationStatus::Fail
        } else {
            OperationStatus::Pending
        }
    }
}
