//! Operation executor.
//!
//! Performs the effect of an approved operation. Every branch checks its preconditions
//! before touching state, and external calls happen before any local mutation, so a
//! failed branch leaves the registry and ledgers as they were. Once a transfer has been
//! accepted by a connector, the local bookkeeping that follows cannot fail.

use crate::account::AccountBook;
use crate::chain::{
    BtcPending, ChainType, CkbtcPending, EvmPending, IcpPending, IcrcPending, PendingEntry,
};
use crate::connectors::{ConnectorRegistry, TransferReceipt, TransferRequest};
use crate::error::{VaultError, VaultResult};
use crate::loader::ChunkedCodeLoader;
use crate::operation::{Operation, OperationResult};
use crate::settings::CanisterSettings;
use crate::signer::{Role, Signer, SignerRegistry};
use crate::types::AccountId;
use chrono::{DateTime, Utc};
use tracing::debug;

/// Mutable wallet state an operation may touch.
pub struct ExecutionContext<'a> {
    pub registry: &'a mut SignerRegistry,
    pub accounts: &'a mut AccountBook,
    pub settings: &'a mut CanisterSettings,
    pub loader: &'a mut ChunkedCodeLoader,
}

pub struct OperationExecutor<'a> {
    connectors: &'a ConnectorRegistry,
    app_name: &'a str,
}

impl<'a> OperationExecutor<'a> {
    pub fn new(connectors: &'a ConnectorRegistry, app_name: &'a str) -> Self {
        Self {
            connectors,
            app_name,
        }
    }

    pub async fn execute(
        &self,
        ctx: ExecutionContext<'_>,
        operation: &Operation,
        now: DateTime<Utc>,
    ) -> VaultResult<OperationResult> {
        debug!(kind = %operation.kind(), "Executing operation");
        let ExecutionContext {
            registry,
            accounts,
            settings,
            loader,
        } = ctx;

        match operation {
            Operation::CreateAccount { name } => {
                let account_id = accounts.create(name)?;
                Ok(OperationResult::AccountCreated { account_id })
            }
            Operation::RenameAccount { account_id, name } => {
                let name = accounts.rename(account_id, name)?;
                Ok(OperationResult::AccountRenamed {
                    account_id: account_id.clone(),
                    name,
                })
            }
            Operation::HideAccount { account_id } => {
                accounts.set_hidden(account_id, true)?;
                Ok(OperationResult::AccountHidden {
                    account_id: account_id.clone(),
                })
            }
            Operation::UnhideAccount { account_id } => {
                accounts.set_hidden(account_id, false)?;
                Ok(OperationResult::AccountUnhidden {
                    account_id: account_id.clone(),
                })
            }
            Operation::RemoveAccount { account_id } => {
                accounts.remove(account_id)?;
                Ok(OperationResult::AccountRemoved {
                    account_id: account_id.clone(),
                })
            }
            Operation::CreateAddress { account_id, chain } => {
                accounts.ensure_no_address(account_id, chain)?;
                let subaccount = accounts.get(account_id)?.ledger.subaccount.clone();
                let address = self
                    .connectors
                    .chain(chain.family())?
                    .derive_address(chain, &subaccount)
                    .await?;
                accounts.insert_address(account_id, chain.clone(), address.clone())?;
                Ok(OperationResult::AddressCreated {
                    chain: chain.clone(),
                    address,
                })
            }
            Operation::RemoveAddress { account_id, chain } => {
                accounts.remove_address(account_id, chain)?;
                Ok(OperationResult::AddressRemoved {
                    chain: chain.clone(),
                })
            }
            Operation::SendBtc {
                account_id,
                to,
                amount,
            } => {
                let chain = ChainType::Btc;
                let request = self.prepare(accounts, account_id, &chain, to, *amount, None, None)?;
                let record = accounts.chain_mut(account_id, &chain)?;
                match self.submit(&request).await? {
                    TransferReceipt::Btc { txid } => {
                        record.settle_outbound(None, *amount);
                        Ok(OperationResult::BtcSent { txid })
                    }
                    other => Err(unexpected_receipt(&chain, &other)),
                }
            }
            Operation::SendEvmNative {
                account_id,
                chain_id,
                to,
                amount,
            } => {
                let chain = ChainType::Evm(*chain_id);
                let request = self.prepare(accounts, account_id, &chain, to, *amount, None, None)?;
                let record = accounts.chain_mut(account_id, &chain)?;
                match self.submit(&request).await? {
                    TransferReceipt::Evm {
                        tx_hash,
                        block_index,
                    } => {
                        let entry = PendingEntry::Evm(EvmPending {
                            tx_hash: tx_hash.clone(),
                            block_index,
                        });
                        record.settle_outbound(Some(entry), *amount);
                        Ok(OperationResult::EvmSent {
                            tx_hash,
                            block_index,
                        })
                    }
                    other => Err(unexpected_receipt(&chain, &other)),
                }
            }
            Operation::SendErc20 {
                account_id,
                chain_id,
                contract,
                to,
                amount,
            } => {
                // token balances are held by the contract; the book balance is native only
                let chain = ChainType::Evm(*chain_id);
                let request = self.prepare(
                    accounts,
                    account_id,
                    &chain,
                    to,
                    *amount,
                    Some(contract.clone()),
                    None,
                )?;
                let record = accounts.chain_mut(account_id, &chain)?;
                match self.submit(&request).await? {
                    TransferReceipt::Evm {
                        tx_hash,
                        block_index,
                    } => {
                        let entry = PendingEntry::Evm(EvmPending {
                            tx_hash: tx_hash.clone(),
                            block_index,
                        });
                        record.settle_outbound(Some(entry), 0);
                        Ok(OperationResult::Erc20Sent {
                            tx_hash,
                            block_index,
                        })
                    }
                    other => Err(unexpected_receipt(&chain, &other)),
                }
            }
            Operation::SendIcp {
                account_id,
                to,
                amount,
                memo,
            } => {
                let chain = ChainType::Icp;
                let request =
                    self.prepare(accounts, account_id, &chain, to, *amount, None, *memo)?;
                let record = accounts.chain_mut(account_id, &chain)?;
                match self.submit(&request).await? {
                    TransferReceipt::Icp {
                        block_index,
                        canister,
                    } => {
                        let entry = PendingEntry::Icp(IcpPending {
                            block_index,
                            canister,
                        });
                        record.settle_outbound(Some(entry), *amount);
                        Ok(OperationResult::IcpSent { block_index })
                    }
                    other => Err(unexpected_receipt(&chain, &other)),
                }
            }
            Operation::SendIcrc {
                account_id,
                ledger,
                to,
                amount,
            } => {
                let chain = ChainType::Icrc(ledger.clone());
                let request = self.prepare(accounts, account_id, &chain, to, *amount, None, None)?;
                let record = accounts.chain_mut(account_id, &chain)?;
                match self.submit(&request).await? {
                    TransferReceipt::Icrc {
                        tx_index,
                        block_index,
                    } => {
                        let entry = PendingEntry::Icrc(IcrcPending {
                            tx_index,
                            block_index,
                        });
                        record.settle_outbound(Some(entry), *amount);
                        Ok(OperationResult::IcrcSent { tx_index })
                    }
                    other => Err(unexpected_receipt(&chain, &other)),
                }
            }
            Operation::SwapBtcToCkbtc { account_id, amount } => {
                // minted ckBTC is credited to this chain later, so it must exist up front
                let owner = accounts.chain(account_id, &ChainType::Ckbtc)?.address.clone();
                let minter = self.connectors.minter()?;
                accounts
                    .chain(account_id, &ChainType::Btc)?
                    .ensure_funds(*amount)?;
                let deposit = minter.get_btc_address(&owner).await?;
                let request = self.prepare(
                    accounts,
                    account_id,
                    &ChainType::Btc,
                    &deposit,
                    *amount,
                    None,
                    None,
                )?;
                let record = accounts.chain_mut(account_id, &ChainType::Btc)?;
                match self.submit(&request).await? {
                    TransferReceipt::Btc { txid } => {
                        let entry = PendingEntry::Btc(BtcPending {
                            txid: txid.clone(),
                            account: owner,
                        });
                        record.settle_outbound(Some(entry), *amount);
                        Ok(OperationResult::BtcSwapped { txid })
                    }
                    other => Err(unexpected_receipt(&ChainType::Btc, &other)),
                }
            }
            Operation::SwapCkbtcToBtc {
                account_id,
                btc_address,
                amount,
            } => {
                require_amount(*amount)?;
                if btc_address.trim().is_empty() {
                    return Err(VaultError::validation("destination BTC address is empty"));
                }
                let minter = self.connectors.minter()?;
                let record = accounts.chain_mut(account_id, &ChainType::Ckbtc)?;
                record.ensure_funds(*amount)?;
                let block_index = minter.retrieve_btc(btc_address, *amount).await?;
                let entry = PendingEntry::Ckbtc(CkbtcPending {
                    block_index,
                    txid: None,
                });
                record.settle_outbound(Some(entry), *amount);
                Ok(OperationResult::CkbtcSwapped { block_index })
            }
            Operation::SignMessage {
                account_id,
                message,
            } => {
                let key_id = accounts.get(account_id)?.ledger.subaccount.clone();
                let signature = self
                    .connectors
                    .signer()?
                    .sign(&key_id, message.as_bytes())
                    .await?;
                Ok(OperationResult::MessageSigned {
                    signature: hex::encode(signature),
                })
            }
            Operation::SignEvmTransaction {
                account_id,
                chain_id,
                transaction,
            } => {
                accounts.chain(account_id, &ChainType::Evm(*chain_id))?;
                let payload = decode_hex(transaction)?;
                let key_id = accounts.get(account_id)?.ledger.subaccount.clone();
                let signature = self.connectors.signer()?.sign(&key_id, &payload).await?;
                Ok(OperationResult::EvmTransactionSigned {
                    signature: hex::encode(signature),
                })
            }
            Operation::AddSigner {
                signer_id,
                name,
                role_id,
                threshold,
                expires_at,
            } => {
                registry.add_signer(Signer {
                    id: signer_id.clone(),
                    name: name.clone(),
                    role_id: role_id.clone(),
                    threshold: *threshold,
                    expires_at: *expires_at,
                })?;
                Ok(OperationResult::SignerAdded {
                    signer_id: signer_id.clone(),
                })
            }
            Operation::RemoveSigner { signer_id } => {
                registry.remove_signer(signer_id)?;
                Ok(OperationResult::SignerRemoved {
                    signer_id: signer_id.clone(),
                })
            }
            Operation::UpdateSignerThreshold {
                signer_id,
                threshold,
            } => {
                registry.set_signer_threshold(signer_id, *threshold)?;
                Ok(OperationResult::SignerThresholdUpdated {
                    signer_id: signer_id.clone(),
                    threshold: *threshold,
                })
            }
            Operation::AddRole {
                name,
                access,
                threshold,
            } => {
                let role_id = registry
                    .add_role(Role::new(name.clone(), access.clone()).with_threshold(*threshold))?;
                Ok(OperationResult::RoleAdded { role_id })
            }
            Operation::RemoveRole { role_id } => {
                registry.remove_role(role_id)?;
                Ok(OperationResult::RoleRemoved {
                    role_id: role_id.clone(),
                })
            }
            Operation::UpdateSettings { settings: update } => {
                update.validate()?;
                *settings = update.clone();
                Ok(OperationResult::SettingsUpdated {
                    settings: update.clone(),
                })
            }
            Operation::UpgradeCode { version } => {
                if loader.is_empty() {
                    return Err(VaultError::Loader("no module has been loaded".to_string()));
                }
                let expected = self
                    .connectors
                    .releases()?
                    .release_hash(self.app_name, version)
                    .await?;
                let running = loader.upgrade(version, &expected, now)?;
                Ok(OperationResult::CodeUpgraded {
                    version: running.version,
                    module_hash: running.hash,
                })
            }
        }
    }

    /// Check funds and build the transfer request without mutating anything.
    #[allow(clippy::too_many_arguments)]
    fn prepare(
        &self,
        accounts: &AccountBook,
        account_id: &AccountId,
        chain: &ChainType,
        to: &str,
        amount: u128,
        token: Option<String>,
        memo: Option<u64>,
    ) -> VaultResult<TransferRequest> {
        require_amount(amount)?;
        if to.trim().is_empty() {
            return Err(VaultError::validation("destination address is empty"));
        }
        let record = accounts.chain(account_id, chain)?;
        if token.is_none() {
            record.ensure_funds(amount)?;
        }
        Ok(TransferRequest {
            chain: chain.clone(),
            from: record.address.clone(),
            to: to.to_string(),
            amount,
            token,
            memo,
        })
    }

    async fn submit(&self, request: &TransferRequest) -> VaultResult<TransferReceipt> {
        self.connectors
            .chain(request.chain.family())?
            .transfer(request)
            .await
    }
}

fn require_amount(amount: u128) -> VaultResult<()> {
    if amount == 0 {
        return Err(VaultError::validation("transfer amount must be positive"));
    }
    Ok(())
}

fn decode_hex(value: &str) -> VaultResult<Vec<u8>> {
    let trimmed = value.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let bytes = hex::decode(digits)
        .map_err(|e| VaultError::validation(format!("transaction is not valid hex: {e}")))?;
    if bytes.is_empty() {
        return Err(VaultError::validation("transaction payload is empty"));
    }
    Ok(bytes)
}

fn unexpected_receipt(chain: &ChainType, receipt: &TransferReceipt) -> VaultError {
    VaultError::connector(
        chain.family().name(),
        format!("unexpected receipt for {chain}: {receipt:?}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainFamily;
    use crate::connectors::{ChainConnector, Finality};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    struct StubIcp {
        fail: bool,
        next_block: AtomicU64,
    }

    #[async_trait]
    impl ChainConnector for StubIcp {
        fn family(&self) -> ChainFamily {
            ChainFamily::Icp
        }

        async fn derive_address(&self, _chain: &ChainType, subaccount: &str) -> VaultResult<String> {
            Ok(format!("icp-{}", &subaccount[..8]))
        }

        async fn transfer(&self, _request: &TransferRequest) -> VaultResult<TransferReceipt> {
            if self.fail {
                return Err(VaultError::connector("icp", "ledger unavailable"));
            }
            Ok(TransferReceipt::Icp {
                block_index: self.next_block.fetch_add(1, Ordering::SeqCst),
                canister: "ryjl3-tyaaa-aaaaa-aaaba-cai".to_string(),
            })
        }

        async fn balance(&self, _chain: &ChainType, _address: &str) -> VaultResult<u128> {
            Ok(0)
        }

        async fn finality(&self, _chain: &ChainType, _entry: &PendingEntry) -> VaultResult<Finality> {
            Ok(Finality::Pending)
        }
    }

    /// Packs every transfer into the same block.
    struct StubEvm {
        next_tx: AtomicU64,
    }

    #[async_trait]
    impl ChainConnector for StubEvm {
        fn family(&self) -> ChainFamily {
            ChainFamily::Evm
        }

        async fn derive_address(&self, _chain: &ChainType, _subaccount: &str) -> VaultResult<String> {
            Ok("0x00000000000000000000000000000000000000aa".to_string())
        }

        async fn transfer(&self, _request: &TransferRequest) -> VaultResult<TransferReceipt> {
            Ok(TransferReceipt::Evm {
                tx_hash: format!("0x{:064x}", self.next_tx.fetch_add(1, Ordering::SeqCst)),
                block_index: 500,
            })
        }

        async fn balance(&self, _chain: &ChainType, _address: &str) -> VaultResult<u128> {
            Ok(0)
        }

        async fn finality(&self, _chain: &ChainType, _entry: &PendingEntry) -> VaultResult<Finality> {
            Ok(Finality::Pending)
        }
    }

    struct Fixture {
        registry: SignerRegistry,
        accounts: AccountBook,
        settings: CanisterSettings,
        loader: ChunkedCodeLoader,
        connectors: ConnectorRegistry,
    }

    impl Fixture {
        fn new(fail: bool) -> Self {
            Self {
                registry: SignerRegistry::new(),
                accounts: AccountBook::new(),
                settings: CanisterSettings::default(),
                loader: ChunkedCodeLoader::new(1024, 4096),
                connectors: ConnectorRegistry::new()
                    .with_chain(Arc::new(StubIcp {
                        fail,
                        next_block: AtomicU64::new(100),
                    }))
                    .with_chain(Arc::new(StubEvm {
                        next_tx: AtomicU64::new(1),
                    })),
            }
        }

        async fn run(&mut self, operation: Operation) -> VaultResult<OperationResult> {
            let executor = OperationExecutor::new(&self.connectors, "custody-wallet");
            executor
                .execute(
                    ExecutionContext {
                        registry: &mut self.registry,
                        accounts: &mut self.accounts,
                        settings: &mut self.settings,
                        loader: &mut self.loader,
                    },
                    &operation,
                    Utc::now(),
                )
                .await
        }

        async fn funded_icp_account(&mut self, balance: u128) -> AccountId {
            let account_id = self.accounts.create("Main").unwrap();
            self.run(Operation::CreateAddress {
                account_id: account_id.clone(),
                chain: ChainType::Icp,
            })
            .await
            .unwrap();
            self.accounts
                .chain_mut(&account_id, &ChainType::Icp)
                .unwrap()
                .credit(balance);
            account_id
        }
    }

    #[tokio::test]
    async fn icp_transfer_debits_and_tracks_pending() {
        let mut fx = Fixture::new(false);
        let account_id = fx.funded_icp_account(1_000).await;

        let result = fx
            .run(Operation::SendIcp {
                account_id: account_id.clone(),
                to: "dest".into(),
                amount: 400,
                memo: Some(7),
            })
            .await
            .unwrap();

        assert_eq!(result, OperationResult::IcpSent { block_index: 100 });
        let chain = fx.accounts.chain(&account_id, &ChainType::Icp).unwrap();
        assert_eq!(chain.balance, 600);
        assert_eq!(chain.pendings.len(), 1);
    }

    #[tokio::test]
    async fn evm_sends_sharing_a_block_are_both_booked() {
        let mut fx = Fixture::new(false);
        let chain = ChainType::Evm(1);
        let account_id = fx.accounts.create("Main").unwrap();
        fx.run(Operation::CreateAddress {
            account_id: account_id.clone(),
            chain: chain.clone(),
        })
        .await
        .unwrap();
        fx.accounts
            .chain_mut(&account_id, &chain)
            .unwrap()
            .credit(1_000);

        for amount in [100, 200] {
            let result = fx
                .run(Operation::SendEvmNative {
                    account_id: account_id.clone(),
                    chain_id: 1,
                    to: "0x00000000000000000000000000000000000000bb".into(),
                    amount,
                })
                .await
                .unwrap();
            assert!(matches!(
                result,
                OperationResult::EvmSent {
                    block_index: 500,
                    ..
                }
            ));
        }

        let record = fx.accounts.chain(&account_id, &chain).unwrap();
        assert_eq!(record.balance, 700);
        assert_eq!(record.pendings.len(), 2);
    }

    #[tokio::test]
    async fn failed_transfer_leaves_state_untouched() {
        let mut fx = Fixture::new(true);
        let account_id = fx.funded_icp_account(1_000).await;

        let err = fx
            .run(Operation::SendIcp {
                account_id: account_id.clone(),
                to: "dest".into(),
                amount: 400,
                memo: None,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, VaultError::Connector { .. }));
        let chain = fx.accounts.chain(&account_id, &ChainType::Icp).unwrap();
        assert_eq!(chain.balance, 1_000);
        assert!(chain.pendings.is_empty());
    }

    #[tokio::test]
    async fn insufficient_funds_is_checked_before_the_call() {
        let mut fx = Fixture::new(false);
        let account_id = fx.funded_icp_account(10).await;

        let err = fx
            .run(Operation::SendIcp {
                account_id,
                to: "dest".into(),
                amount: 11,
                memo: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::InsufficientFunds { .. }));
    }

    #[tokio::test]
    async fn missing_connector_fails_without_creating_address() {
        let mut fx = Fixture::new(false);
        let account_id = fx.accounts.create("Main").unwrap();
        let err = fx
            .run(Operation::CreateAddress {
                account_id: account_id.clone(),
                chain: ChainType::Btc,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Connector { .. }));
        assert!(fx.accounts.chain(&account_id, &ChainType::Btc).is_err());
    }

    #[tokio::test]
    async fn invalid_settings_are_not_applied() {
        let mut fx = Fixture::new(false);
        let err = fx
            .run(Operation::UpdateSettings {
                settings: CanisterSettings {
                    compute_allocation: Some(150),
                    ..Default::default()
                },
            })
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Validation(_)));
        assert_eq!(fx.settings, CanisterSettings::default());
    }

    #[test]
    fn hex_payloads_accept_prefix() {
        assert_eq!(decode_hex("0x0aff").unwrap(), vec![0x0a, 0xff]);
        assert!(decode_hex("zz").is_err());
        assert!(decode_hex("0x").is_err());
    }
}
