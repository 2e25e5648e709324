//! Wallet facade.
//!
//! One `Wallet` owns every piece of per-wallet state and serves calls one at a time
//! (`&mut self`). State-changing actions go through the request manager; reconciliation
//! and code upload are direct calls guarded by the caller's signer status.

use crate::account::{AccountBook, WalletAccount};
use crate::chain::{ChainFamily, ChainType, PendingEntry};
use crate::clock::TimeSource;
use crate::config::WalletConfig;
use crate::connectors::{ConnectorRegistry, RetrieveBtcStatus};
use crate::error::{VaultError, VaultResult};
use crate::executor::{ExecutionContext, OperationExecutor};
use crate::loader::{ChunkedCodeLoader, RunningModule};
use crate::operation::{Operation, OperationKind, OperationStatus, PendingOperation, Vote};
use crate::pending::{PendingReport, PendingTransactionTracker};
use crate::processed::{ProcessedLog, ProcessedOperation, Resolution};
use crate::request::OperationRequestManager;
use crate::settings::CanisterSettings;
use crate::signer::{AccessLevel, Role, Signer, SignerRegistry};
use crate::storage::{WalletSnapshot, SNAPSHOT_VERSION};
use crate::types::{AccountId, OperationId, RoleId, SignerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Id of the role seeded for the wallet owner.
pub const ADMIN_ROLE: &str = "admin";

/// An operation as seen by callers: still collecting votes, or resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "operation", rename_all = "snake_case")]
pub enum OperationView {
    Pending(PendingOperation),
    Processed(ProcessedOperation),
}

impl OperationView {
    pub fn id(&self) -> OperationId {
        match self {
            Self::Pending(operation) => operation.id,
            Self::Processed(record) => record.id(),
        }
    }

    pub fn status(&self) -> OperationStatus {
        match self {
            Self::Pending(operation) => operation.status,
            Self::Processed(record) => record.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletStatus {
    pub signers: usize,
    pub roles: usize,
    pub accounts: usize,
    pub pending_operations: usize,
    pub processed_operations: usize,
    pub processed_chain_valid: bool,
    pub next_operation_id: OperationId,
    pub module_version: Option<String>,
    pub module_hash: Option<String>,
    pub upload_bytes: usize,
}

pub struct Wallet {
    config: WalletConfig,
    clock: Arc<dyn TimeSource>,
    connectors: ConnectorRegistry,
    registry: SignerRegistry,
    accounts: AccountBook,
    requests: OperationRequestManager,
    processed: ProcessedLog,
    settings: CanisterSettings,
    loader: ChunkedCodeLoader,
}

impl Wallet {
    /// Fresh wallet whose only signer is `owner`, holding the full-access admin role.
    pub fn new(
        owner: impl Into<SignerId>,
        config: WalletConfig,
        connectors: ConnectorRegistry,
        clock: Arc<dyn TimeSource>,
    ) -> VaultResult<Self> {
        let owner = owner.into();
        let mut registry = SignerRegistry::new();
        let admin = registry.add_role(
            Role::new(ADMIN_ROLE, AccessLevel::FullAccess)
                .with_id(RoleId::new(ADMIN_ROLE))
                .with_threshold(config.default_role_threshold.max(1)),
        )?;
        registry.add_signer(Signer::new(owner.clone(), "owner", admin))?;

        let settings = CanisterSettings {
            controllers: vec![owner.clone()],
            ..CanisterSettings::default()
        };
        info!(owner = %owner, app = %config.app_name, "Wallet initialized");

        Ok(Self {
            requests: OperationRequestManager::new(&config),
            loader: ChunkedCodeLoader::new(config.max_chunk_bytes, config.max_module_bytes),
            config,
            clock,
            connectors,
            registry,
            accounts: AccountBook::new(),
            processed: ProcessedLog::new(),
            settings,
        })
    }

    /// Rebuild a wallet from a persisted snapshot, re-verifying the audit chain.
    pub fn from_snapshot(
        snapshot: WalletSnapshot,
        config: WalletConfig,
        connectors: ConnectorRegistry,
        clock: Arc<dyn TimeSource>,
    ) -> VaultResult<Self> {
        let requests =
            OperationRequestManager::restore(&config, snapshot.pending, snapshot.next_operation_id)?;
        let processed = ProcessedLog::from_entries(snapshot.processed)?;
        let loader = ChunkedCodeLoader::new(config.max_chunk_bytes, config.max_module_bytes)
            .with_running(snapshot.running_module);
        info!(
            pending = requests.len(),
            processed = processed.len(),
            "Wallet restored from snapshot"
        );

        Ok(Self {
            config,
            clock,
            connectors,
            registry: snapshot.registry,
            accounts: snapshot.accounts,
            requests,
            processed,
            settings: snapshot.settings,
            loader,
        })
    }

    pub fn snapshot(&self) -> WalletSnapshot {
        WalletSnapshot {
            version: SNAPSHOT_VERSION,
            registry: self.registry.clone(),
            accounts: self.accounts.clone(),
            pending: self.requests.list(),
            processed: self.processed.entries().to_vec(),
            next_operation_id: self.requests.next_id(),
            settings: self.settings.clone(),
            running_module: self.loader.running().cloned(),
            saved_at: self.now(),
        }
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn registry(&self) -> &SignerRegistry {
        &self.registry
    }

    pub fn accounts(&self) -> &AccountBook {
        &self.accounts
    }

    pub fn settings(&self) -> &CanisterSettings {
        &self.settings
    }

    pub fn running_module(&self) -> Option<&RunningModule> {
        self.loader.running()
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Propose an operation and return its id.
    pub async fn request(
        &mut self,
        caller: &SignerId,
        operation: Operation,
        consent_message: impl Into<String>,
        deadline: Option<DateTime<Utc>>,
    ) -> VaultResult<OperationId> {
        self.sweep_expired()?;
        let now = self.now();
        let created = self.requests.request(
            &self.registry,
            caller,
            operation,
            consent_message,
            deadline,
            now,
        )?;
        let id = created.id;
        if created.status.is_terminal() {
            self.finalize(created).await?;
        }
        Ok(id)
    }

    /// Cast a vote; returns the processed record once the vote resolves the operation.
    pub async fn response(
        &mut self,
        caller: &SignerId,
        id: OperationId,
        vote: Vote,
    ) -> VaultResult<OperationView> {
        self.sweep_expired()?;
        if self.requests.get(id).is_none() {
            return Err(self.resolved_error(id));
        }
        let now = self.now();
        let updated = self
            .requests
            .respond(&self.registry, id, caller, vote, now)?;
        if updated.status.is_terminal() {
            let record = self.finalize(updated).await?;
            Ok(OperationView::Processed(record))
        } else {
            Ok(OperationView::Pending(updated))
        }
    }

    pub fn get_pending_list(&mut self) -> VaultResult<Vec<PendingOperation>> {
        self.sweep_expired()?;
        Ok(self.requests.list())
    }

    pub fn get_processed_list(&mut self) -> VaultResult<Vec<ProcessedOperation>> {
        self.sweep_expired()?;
        Ok(self.processed.entries().to_vec())
    }

    pub fn get_operation(&mut self, id: OperationId) -> VaultResult<OperationView> {
        self.sweep_expired()?;
        if let Some(pending) = self.requests.get(id) {
            return Ok(OperationView::Pending(pending.clone()));
        }
        self.processed
            .find(id)
            .cloned()
            .map(OperationView::Processed)
            .ok_or(VaultError::OperationNotFound(id))
    }

    pub fn validate_signer(&self, id: &SignerId) -> bool {
        self.registry.validate_signer(id, self.now())
    }

    pub async fn signer_add(
        &mut self,
        caller: &SignerId,
        signer: Signer,
        consent_message: impl Into<String>,
    ) -> VaultResult<OperationId> {
        let operation = Operation::AddSigner {
            signer_id: signer.id,
            name: signer.name,
            role_id: signer.role_id,
            threshold: signer.threshold,
            expires_at: signer.expires_at,
        };
        self.request(caller, operation, consent_message, None).await
    }

    pub async fn signer_remove(
        &mut self,
        caller: &SignerId,
        signer_id: SignerId,
        consent_message: impl Into<String>,
    ) -> VaultResult<OperationId> {
        self.request(
            caller,
            Operation::RemoveSigner { signer_id },
            consent_message,
            None,
        )
        .await
    }

    pub async fn role_add(
        &mut self,
        caller: &SignerId,
        name: impl Into<String>,
        access: AccessLevel,
        threshold: usize,
        consent_message: impl Into<String>,
    ) -> VaultResult<OperationId> {
        let operation = Operation::AddRole {
            name: name.into(),
            access,
            threshold,
        };
        self.request(caller, operation, consent_message, None).await
    }

    pub async fn role_remove(
        &mut self,
        caller: &SignerId,
        role_id: RoleId,
        consent_message: impl Into<String>,
    ) -> VaultResult<OperationId> {
        self.request(
            caller,
            Operation::RemoveRole { role_id },
            consent_message,
            None,
        )
        .await
    }

    pub fn account(&self, caller: &SignerId, account_id: &AccountId) -> VaultResult<WalletAccount> {
        self.ensure_signer(caller)?;
        self.accounts.get(account_id).cloned()
    }

    pub fn account_balance(
        &self,
        caller: &SignerId,
        account_id: &AccountId,
        chain: &ChainType,
    ) -> VaultResult<u128> {
        self.ensure_signer(caller)?;
        self.accounts.balance(account_id, chain)
    }

    pub async fn account_create_address(
        &mut self,
        caller: &SignerId,
        account_id: AccountId,
        chain: ChainType,
        consent_message: impl Into<String>,
    ) -> VaultResult<OperationId> {
        self.request(
            caller,
            Operation::CreateAddress { account_id, chain },
            consent_message,
            None,
        )
        .await
    }

    pub async fn account_remove_address(
        &mut self,
        caller: &SignerId,
        account_id: AccountId,
        chain: ChainType,
        consent_message: impl Into<String>,
    ) -> VaultResult<OperationId> {
        self.request(
            caller,
            Operation::RemoveAddress { account_id, chain },
            consent_message,
            None,
        )
        .await
    }

    /// Track a transaction submitted outside the wallet's own transfer operations.
    pub fn account_add_pending(
        &mut self,
        caller: &SignerId,
        account_id: &AccountId,
        chain: &ChainType,
        entry: PendingEntry,
    ) -> VaultResult<usize> {
        self.ensure_authorized(caller, transfer_kind(chain.family()))?;
        let count = self.accounts.add_pending(account_id, chain, entry)?;
        info!(account = %account_id, chain = %chain, pendings = count, "Pending entry added");
        Ok(count)
    }

    pub fn account_remove_pending(
        &mut self,
        caller: &SignerId,
        account_id: &AccountId,
        chain: &ChainType,
        index: usize,
    ) -> VaultResult<PendingEntry> {
        self.ensure_authorized(caller, transfer_kind(chain.family()))?;
        let removed = self.accounts.remove_pending(account_id, chain, index)?;
        info!(account = %account_id, chain = %chain, pending = %removed.key(), "Pending entry removed");
        Ok(removed)
    }

    pub async fn account_check_pending(
        &mut self,
        caller: &SignerId,
        account_id: &AccountId,
        chain: &ChainType,
    ) -> VaultResult<PendingReport> {
        self.ensure_signer(caller)?;
        PendingTransactionTracker::new(&self.connectors)
            .check_pending(&mut self.accounts, account_id, chain)
            .await
    }

    pub async fn account_update_balance(
        &mut self,
        caller: &SignerId,
        account_id: &AccountId,
    ) -> VaultResult<PendingReport> {
        self.ensure_signer(caller)?;
        PendingTransactionTracker::new(&self.connectors)
            .update_balance(&mut self.accounts, account_id)
            .await
    }

    pub async fn retrieve_btc_status(
        &mut self,
        caller: &SignerId,
        account_id: &AccountId,
        block_index: u64,
    ) -> VaultResult<RetrieveBtcStatus> {
        self.ensure_signer(caller)?;
        PendingTransactionTracker::new(&self.connectors)
            .retrieve_btc_status(&mut self.accounts, account_id, block_index)
            .await
    }

    pub async fn account_sync_balance(
        &mut self,
        caller: &SignerId,
        account_id: &AccountId,
        chain: &ChainType,
    ) -> VaultResult<u128> {
        self.ensure_signer(caller)?;
        PendingTransactionTracker::new(&self.connectors)
            .sync_balance(&mut self.accounts, account_id, chain)
            .await
    }

    pub fn load_wasm(&mut self, caller: &SignerId, chunk: &[u8]) -> VaultResult<usize> {
        self.ensure_authorized(caller, OperationKind::UpgradeCode)?;
        self.loader.load(chunk)
    }

    pub fn unload_wasm(&mut self, caller: &SignerId) -> VaultResult<usize> {
        self.ensure_authorized(caller, OperationKind::UpgradeCode)?;
        Ok(self.loader.unload())
    }

    pub fn wasm_hash(&self) -> [u8; 32] {
        self.loader.hash()
    }

    pub fn wasm_hash_string(&self) -> String {
        self.loader.hash_string()
    }

    pub fn wasm_len(&self) -> usize {
        self.loader.len()
    }

    pub async fn upgrade(
        &mut self,
        caller: &SignerId,
        version: impl Into<String>,
        consent_message: impl Into<String>,
    ) -> VaultResult<OperationId> {
        self.request(
            caller,
            Operation::UpgradeCode {
                version: version.into(),
            },
            consent_message,
            None,
        )
        .await
    }

    pub fn wallet_status(&mut self) -> VaultResult<WalletStatus> {
        self.sweep_expired()?;
        let running = self.loader.running();
        Ok(WalletStatus {
            signers: self.registry.signer_count(),
            roles: self.registry.roles().count(),
            accounts: self.accounts.len(),
            pending_operations: self.requests.len(),
            processed_operations: self.processed.len(),
            processed_chain_valid: self.processed.verify_chain(),
            next_operation_id: self.requests.next_id(),
            module_version: running.map(|module| module.version.clone()),
            module_hash: running.map(|module| module.hash.clone()),
            upload_bytes: self.loader.len(),
        })
    }

    fn ensure_signer(&self, caller: &SignerId) -> VaultResult<()> {
        if self.registry.validate_signer(caller, self.now()) {
            Ok(())
        } else {
            Err(VaultError::unauthorized(caller, "not an active signer"))
        }
    }

    fn ensure_authorized(&self, caller: &SignerId, kind: OperationKind) -> VaultResult<()> {
        self.ensure_signer(caller)?;
        if self.registry.can_authorize(caller, kind, self.now()) {
            Ok(())
        } else {
            Err(VaultError::unauthorized(
                caller,
                format!("role does not permit {kind}"),
            ))
        }
    }

    fn resolved_error(&self, id: OperationId) -> VaultError {
        match self.processed.find(id) {
            Some(record) if record.operation.status == OperationStatus::Expired => {
                VaultError::DeadlineExpired(id)
            }
            Some(record) => VaultError::AlreadyResolved {
                id,
                status: record.status.to_string(),
            },
            None => VaultError::OperationNotFound(id),
        }
    }

    /// Move past-deadline operations into the processed log.
    fn sweep_expired(&mut self) -> VaultResult<()> {
        let now = self.now();
        for expired in self.requests.expire_stale(now) {
            self.processed.append(expired, Resolution::NotExecuted, now)?;
        }
        Ok(())
    }

    /// Execute an approved operation (if approved) and append its audit record.
    async fn finalize(&mut self, operation: PendingOperation) -> VaultResult<ProcessedOperation> {
        let now = self.now();
        let resolution = if operation.status == OperationStatus::Success {
            let executor = OperationExecutor::new(&self.connectors, &self.config.app_name);
            let ctx = ExecutionContext {
                registry: &mut self.registry,
                accounts: &mut self.accounts,
                settings: &mut self.settings,
                loader: &mut self.loader,
            };
            match executor.execute(ctx, &operation.operation, now).await {
                Ok(result) => Resolution::Executed(result),
                Err(err) => {
                    warn!(
                        operation_id = operation.id,
                        kind = %operation.kind(),
                        error = %err,
                        "Operation execution failed"
                    );
                    Resolution::ExecutionFailed(err.to_string())
                }
            }
        } else {
            Resolution::NotExecuted
        };

        let record = self.processed.append(operation, resolution, now)?;
        info!(
            operation_id = record.id(),
            status = %record.status,
            index = record.index,
            "Operation processed"
        );
        Ok(record)
    }
}

/// Operation kind whose authorization also covers manual pending-entry bookkeeping.
fn transfer_kind(family: ChainFamily) -> OperationKind {
    match family {
        ChainFamily::Btc => OperationKind::SwapBtcToCkbtc,
        ChainFamily::Evm => OperationKind::SendEvmNative,
        ChainFamily::Icp => OperationKind::SendIcp,
        ChainFamily::Icrc => OperationKind::SendIcrc,
        ChainFamily::Ckbtc => OperationKind::SwapCkbtcToBtc,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedTimeSource;
    use crate::operation::OperationResult;
    use chrono::Duration;

    fn wallet_with_clock(config: WalletConfig) -> (Wallet, SimulatedTimeSource) {
        let clock = SimulatedTimeSource::from_recent();
        let wallet = Wallet::new(
            "owner",
            config,
            ConnectorRegistry::new(),
            Arc::new(clock.clone()),
        )
        .unwrap();
        (wallet, clock)
    }

    fn owner() -> SignerId {
        SignerId::from("owner")
    }

    async fn approve(wallet: &mut Wallet, operation: Operation) -> ProcessedOperation {
        let id = wallet
            .request(&owner(), operation, "approve", None)
            .await
            .unwrap();
        match wallet.response(&owner(), id, Vote::Confirm).await.unwrap() {
            OperationView::Processed(record) => record,
            other => panic!("expected processed record, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn owner_can_manage_accounts_through_operations() {
        let (mut wallet, _) = wallet_with_clock(WalletConfig::default());
        let record = approve(
            &mut wallet,
            Operation::CreateAccount {
                name: "Treasury".into(),
            },
        )
        .await;
        let Some(OperationResult::AccountCreated { account_id }) = record.result.clone() else {
            panic!("unexpected result {:?}", record.result);
        };
        assert_eq!(record.status, OperationStatus::Success);

        approve(
            &mut wallet,
            Operation::HideAccount {
                account_id: account_id.clone(),
            },
        )
        .await;
        assert!(wallet.account(&owner(), &account_id).unwrap().hidden);
        assert_eq!(wallet.get_processed_list().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn execution_failures_are_recorded_not_raised() {
        let (mut wallet, _) = wallet_with_clock(WalletConfig::default());
        let record = approve(
            &mut wallet,
            Operation::RenameAccount {
                account_id: AccountId::new("missing"),
                name: "x".into(),
            },
        )
        .await;
        assert_eq!(record.status, OperationStatus::Fail);
        assert!(record.error.unwrap().contains("unknown account"));
        assert!(record.result.is_none());
    }

    #[tokio::test]
    async fn expired_operations_move_to_processed_on_read() {
        let (mut wallet, clock) = wallet_with_clock(WalletConfig::default());
        let id = wallet
            .request(
                &owner(),
                Operation::CreateAccount { name: "Late".into() },
                "",
                None,
            )
            .await
            .unwrap();
        clock.advance(Duration::days(8));

        assert!(wallet.get_pending_list().unwrap().is_empty());
        let view = wallet.get_operation(id).unwrap();
        assert_eq!(view.status(), OperationStatus::Expired);

        let err = wallet.response(&owner(), id, Vote::Confirm).await.unwrap_err();
        assert!(matches!(err, VaultError::DeadlineExpired(_)));
        assert_eq!(wallet.accounts().len(), 0);
    }

    #[tokio::test]
    async fn votes_on_processed_operations_are_rejected() {
        let (mut wallet, _) = wallet_with_clock(WalletConfig::default());
        let record = approve(&mut wallet, Operation::CreateAccount { name: "A".into() }).await;
        let err = wallet
            .response(&owner(), record.id(), Vote::Confirm)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::AlreadyResolved { .. }));
    }

    #[tokio::test]
    async fn auto_confirm_executes_on_request() {
        let config = WalletConfig {
            creator_auto_confirm: true,
            ..WalletConfig::default()
        };
        let (mut wallet, _) = wallet_with_clock(config);
        let id = wallet
            .request(&owner(), Operation::CreateAccount { name: "Auto".into() }, "", None)
            .await
            .unwrap();
        assert_eq!(wallet.get_operation(id).unwrap().status(), OperationStatus::Success);
        assert_eq!(wallet.accounts().len(), 1);
    }

    #[tokio::test]
    async fn upload_requires_upgrade_permission() {
        let (mut wallet, _) = wallet_with_clock(WalletConfig::default());
        assert_eq!(wallet.load_wasm(&owner(), b"\0asm").unwrap(), 4);
        assert!(wallet.load_wasm(&"stranger".into(), b"x").is_err());
        assert_eq!(wallet.unload_wasm(&owner()).unwrap(), 0);
        assert_eq!(wallet.wallet_status().unwrap().upload_bytes, 0);
    }

    #[tokio::test]
    async fn snapshot_restores_equivalent_wallet() {
        let (mut wallet, clock) = wallet_with_clock(WalletConfig::default());
        approve(&mut wallet, Operation::CreateAccount { name: "Kept".into() }).await;
        wallet
            .request(&owner(), Operation::CreateAccount { name: "Open".into() }, "", None)
            .await
            .unwrap();

        let snapshot = wallet.snapshot();
        let mut restored = Wallet::from_snapshot(
            snapshot.clone(),
            WalletConfig::default(),
            ConnectorRegistry::new(),
            Arc::new(clock),
        )
        .unwrap();
        assert_eq!(restored.get_pending_list().unwrap().len(), 1);
        assert_eq!(restored.get_processed_list().unwrap().len(), 1);
        assert_eq!(restored.snapshot().next_operation_id, snapshot.next_operation_id);
    }
}
