//! Pending transaction tracker.
//!
//! Reconciles chain pending entries against the external actor that can finalize them:
//! the ckBTC minter for BTC deposits and BTC retrievals, the source ledger for EVM, ICP
//! and ICRC transfers. Entries are removed by identity, so an entry already resolved by
//! an earlier poll is never removed or credited a second time.

use crate::account::AccountBook;
use crate::chain::{ChainFamily, ChainType, PendingEntry};
use crate::connectors::{ConnectorRegistry, Finality, RetrieveBtcStatus, UtxoStatus};
use crate::error::{VaultError, VaultResult};
use crate::types::AccountId;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Entries resolved by one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingReport {
    pub resolved: Vec<PendingEntry>,
    pub remaining: usize,
    /// ckBTC credited to the account during this pass.
    pub minted: u128,
    /// Entries whose status could not be fetched, with the reason. They stay tracked.
    #[serde(default)]
    pub failed: Vec<String>,
}

pub struct PendingTransactionTracker<'a> {
    connectors: &'a ConnectorRegistry,
}

impl<'a> PendingTransactionTracker<'a> {
    pub fn new(connectors: &'a ConnectorRegistry) -> Self {
        Self { connectors }
    }

    /// Reconcile every pending entry on one chain of an account.
    pub async fn check_pending(
        &self,
        accounts: &mut AccountBook,
        account_id: &AccountId,
        chain: &ChainType,
    ) -> VaultResult<PendingReport> {
        match chain.family() {
            ChainFamily::Btc => self.update_balance(accounts, account_id).await,
            ChainFamily::Ckbtc => self.check_retrievals(accounts, account_id).await,
            _ => self.check_finality(accounts, account_id, chain).await,
        }
    }

    /// Ask the minter to process deposits of this account and settle BTC pendings.
    ///
    /// A `Minted` UTXO credits the ckBTC chain only while its BTC pending entry is still
    /// tracked; reports for entries resolved earlier are ignored.
    pub async fn update_balance(
        &self,
        accounts: &mut AccountBook,
        account_id: &AccountId,
    ) -> VaultResult<PendingReport> {
        let owner = accounts.chain(account_id, &ChainType::Ckbtc)?.address.clone();
        accounts.chain(account_id, &ChainType::Btc)?;
        let statuses = self.connectors.minter()?.update_balance(&owner).await?;

        let mut report = PendingReport::default();
        for status in statuses {
            let key = format!("btc:{}", status.txid());
            let Some(entry) = accounts
                .chain_mut(account_id, &ChainType::Btc)?
                .take_pending(&key)
            else {
                debug!(account = %account_id, txid = status.txid(), "UTXO status for untracked deposit");
                continue;
            };

            match &status {
                UtxoStatus::Minted {
                    block_index,
                    minted_amount,
                    txid,
                } => {
                    accounts
                        .chain_mut(account_id, &ChainType::Ckbtc)?
                        .credit(*minted_amount);
                    report.minted = report.minted.saturating_add(*minted_amount);
                    info!(
                        account = %account_id,
                        txid = %txid,
                        block_index,
                        minted = *minted_amount,
                        "BTC deposit minted"
                    );
                }
                UtxoStatus::Checked { txid } => {
                    info!(account = %account_id, txid = %txid, "BTC deposit checked");
                }
                UtxoStatus::ValueTooSmall { txid } | UtxoStatus::Tainted { txid } => {
                    warn!(account = %account_id, txid = %txid, status = ?status, "BTC deposit not minted");
                }
            }
            report.resolved.push(entry);
        }

        report.remaining = accounts.chain(account_id, &ChainType::Btc)?.pendings.len();
        Ok(report)
    }

    /// Query the minter for one ckBTC retrieval and settle its pending entry.
    pub async fn retrieve_btc_status(
        &self,
        accounts: &mut AccountBook,
        account_id: &AccountId,
        block_index: u64,
    ) -> VaultResult<RetrieveBtcStatus> {
        let key = format!("ckbtc:{block_index}");
        let tracked = accounts
            .chain(account_id, &ChainType::Ckbtc)?
            .pendings
            .iter()
            .any(|entry| entry.key() == key);
        if !tracked {
            return Err(VaultError::validation(format!(
                "no ckBTC retrieval pending at block {block_index}"
            )));
        }

        let status = self
            .connectors
            .minter()?
            .retrieve_btc_status(block_index)
            .await?;
        self.apply_retrieve_status(accounts, account_id, &key, &status)?;
        Ok(status)
    }

    /// Overwrite the book balance of a chain with the source ledger's balance.
    pub async fn sync_balance(
        &self,
        accounts: &mut AccountBook,
        account_id: &AccountId,
        chain: &ChainType,
    ) -> VaultResult<u128> {
        let address = accounts.chain(account_id, chain)?.address.clone();
        let balance = self
            .connectors
            .chain(chain.family())?
            .balance(chain, &address)
            .await?;
        accounts.chain_mut(account_id, chain)?.balance = balance;
        debug!(account = %account_id, chain = %chain, balance, "Balance synced");
        Ok(balance)
    }

    async fn check_retrievals(
        &self,
        accounts: &mut AccountBook,
        account_id: &AccountId,
    ) -> VaultResult<PendingReport> {
        let blocks: Vec<u64> = accounts
            .chain(account_id, &ChainType::Ckbtc)?
            .pendings
            .iter()
            .filter_map(|entry| match entry {
                PendingEntry::Ckbtc(pending) => Some(pending.block_index),
                _ => None,
            })
            .collect();

        let minter = self.connectors.minter()?;
        let mut report = PendingReport::default();
        for block_index in blocks {
            let key = format!("ckbtc:{block_index}");
            let status = match minter.retrieve_btc_status(block_index).await {
                Ok(status) => status,
                Err(err) => {
                    warn!(account = %account_id, pending = %key, error = %err, "Retrieval status unavailable");
                    report.failed.push(format!("{key}: {err}"));
                    continue;
                }
            };
            if let Some(entry) = self.apply_retrieve_status(accounts, account_id, &key, &status)? {
                report.resolved.push(entry);
            }
        }
        report.remaining = accounts.chain(account_id, &ChainType::Ckbtc)?.pendings.len();
        Ok(report)
    }

    fn apply_retrieve_status(
        &self,
        accounts: &mut AccountBook,
        account_id: &AccountId,
        key: &str,
        status: &RetrieveBtcStatus,
    ) -> VaultResult<Option<PendingEntry>> {
        let chain = accounts.chain_mut(account_id, &ChainType::Ckbtc)?;
        if status.is_terminal() {
            let removed = chain.take_pending(key);
            if removed.is_some() {
                info!(account = %account_id, pending = %key, status = ?status, "BTC retrieval resolved");
            }
            return Ok(removed);
        }
        if let (Some(txid), Some(PendingEntry::Ckbtc(pending))) =
            (status.txid(), chain.pending_mut(key))
        {
            pending.txid = Some(txid.to_string());
        }
        Ok(None)
    }

    async fn check_finality(
        &self,
        accounts: &mut AccountBook,
        account_id: &AccountId,
        chain: &ChainType,
    ) -> VaultResult<PendingReport> {
        let entries = accounts.chain(account_id, chain)?.pendings.clone();
        let connector = self.connectors.chain(chain.family())?;

        let mut report = PendingReport::default();
        for entry in entries {
            let finality = match connector.finality(chain, &entry).await {
                Ok(finality) => finality,
                Err(err) => {
                    warn!(account = %account_id, chain = %chain, pending = %entry.key(), error = %err, "Finality check failed");
                    report.failed.push(format!("{}: {err}", entry.key()));
                    continue;
                }
            };
            if finality == Finality::Finalized {
                if let Some(removed) = accounts.chain_mut(account_id, chain)?.take_pending(&entry.key()) {
                    info!(account = %account_id, chain = %chain, pending = %removed.key(), "Pending transfer finalized");
                    report.resolved.push(removed);
                }
            }
        }
        report.remaining = accounts.chain(account_id, chain)?.pendings.len();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{BtcPending, CkbtcPending};
    use crate::connectors::BtcMinter;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct ScriptedMinter {
        utxos: Mutex<Vec<UtxoStatus>>,
        retrieval: Mutex<Option<RetrieveBtcStatus>>,
        unreachable_blocks: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl BtcMinter for ScriptedMinter {
        async fn get_btc_address(&self, owner: &str) -> VaultResult<String> {
            Ok(format!("deposit-{owner}"))
        }

        async fn update_balance(&self, _owner: &str) -> VaultResult<Vec<UtxoStatus>> {
            Ok(self.utxos.lock().unwrap().clone())
        }

        async fn retrieve_btc(&self, _address: &str, _amount: u128) -> VaultResult<u64> {
            Ok(1)
        }

        async fn retrieve_btc_status(&self, block_index: u64) -> VaultResult<RetrieveBtcStatus> {
            if self.unreachable_blocks.lock().unwrap().contains(&block_index) {
                return Err(VaultError::connector("ckbtc-minter", "status query timed out"));
            }
            Ok(self
                .retrieval
                .lock()
                .unwrap()
                .clone()
                .unwrap_or(RetrieveBtcStatus::Unknown))
        }
    }

    fn book() -> (AccountBook, AccountId) {
        let mut book = AccountBook::new();
        let id = book.create("Main").unwrap();
        book.insert_address(&id, ChainType::Btc, "bc1qmain".into())
            .unwrap();
        book.insert_address(&id, ChainType::Ckbtc, "ck-owner".into())
            .unwrap();
        (book, id)
    }

    #[tokio::test]
    async fn minted_deposit_is_credited_once() {
        let (mut book, id) = book();
        book.add_pending(
            &id,
            &ChainType::Btc,
            PendingEntry::Btc(BtcPending {
                txid: "tx-1".into(),
                account: "ck-owner".into(),
            }),
        )
        .unwrap();

        let minter = Arc::new(ScriptedMinter::default());
        minter.utxos.lock().unwrap().push(UtxoStatus::Minted {
            block_index: 5,
            minted_amount: 9_990,
            txid: "tx-1".into(),
        });
        let connectors = ConnectorRegistry::new().with_minter(minter);
        let tracker = PendingTransactionTracker::new(&connectors);

        let first = tracker.update_balance(&mut book, &id).await.unwrap();
        assert_eq!(first.resolved.len(), 1);
        assert_eq!(first.minted, 9_990);

        let second = tracker.update_balance(&mut book, &id).await.unwrap();
        assert!(second.resolved.is_empty());
        assert_eq!(book.balance(&id, &ChainType::Ckbtc).unwrap(), 9_990);
    }

    #[tokio::test]
    async fn retrieval_records_txid_until_confirmed() {
        let (mut book, id) = book();
        book.add_pending(
            &id,
            &ChainType::Ckbtc,
            PendingEntry::Ckbtc(CkbtcPending {
                block_index: 42,
                txid: None,
            }),
        )
        .unwrap();

        let minter = Arc::new(ScriptedMinter::default());
        *minter.retrieval.lock().unwrap() = Some(RetrieveBtcStatus::Submitted {
            txid: "btc-tx".into(),
        });
        let connectors = ConnectorRegistry::new().with_minter(minter.clone());
        let tracker = PendingTransactionTracker::new(&connectors);

        tracker.retrieve_btc_status(&mut book, &id, 42).await.unwrap();
        let chain = book.chain(&id, &ChainType::Ckbtc).unwrap();
        assert_eq!(
            chain.pendings,
            vec![PendingEntry::Ckbtc(CkbtcPending {
                block_index: 42,
                txid: Some("btc-tx".into()),
            })]
        );

        *minter.retrieval.lock().unwrap() = Some(RetrieveBtcStatus::Confirmed {
            txid: "btc-tx".into(),
        });
        let report = tracker
            .check_pending(&mut book, &id, &ChainType::Ckbtc)
            .await
            .unwrap();
        assert_eq!(report.resolved.len(), 1);
        assert_eq!(report.remaining, 0);
        assert!(tracker.retrieve_btc_status(&mut book, &id, 42).await.is_err());
    }

    #[tokio::test]
    async fn one_failed_status_query_keeps_other_resolutions() {
        let (mut book, id) = book();
        for block_index in [41, 42] {
            book.add_pending(
                &id,
                &ChainType::Ckbtc,
                PendingEntry::Ckbtc(CkbtcPending {
                    block_index,
                    txid: None,
                }),
            )
            .unwrap();
        }

        let minter = Arc::new(ScriptedMinter::default());
        *minter.retrieval.lock().unwrap() = Some(RetrieveBtcStatus::Confirmed {
            txid: "btc-tx".into(),
        });
        minter.unreachable_blocks.lock().unwrap().push(42);
        let connectors = ConnectorRegistry::new().with_minter(minter);
        let tracker = PendingTransactionTracker::new(&connectors);

        let report = tracker
            .check_pending(&mut book, &id, &ChainType::Ckbtc)
            .await
            .unwrap();
        assert_eq!(report.resolved.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].starts_with("ckbtc:42"));
        assert_eq!(report.remaining, 1);
        assert_eq!(
            book.chain(&id, &ChainType::Ckbtc).unwrap().pendings[0].key(),
            "ckbtc:42"
        );
    }
}
