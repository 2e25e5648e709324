//! Wallet accounts and their per-chain ledgers.

use crate::chain::{Chain, ChainType, PendingEntry};
use crate::error::{VaultError, VaultResult};
use crate::types::AccountId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Key material and chain records of one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    pub public_key: Option<String>,
    /// 32-byte hex subaccount, derived from the account id.
    pub subaccount: String,
    pub chains: BTreeMap<ChainType, Chain>,
}

impl Ledger {
    pub fn for_account(id: &AccountId) -> Self {
        Self {
            public_key: None,
            subaccount: blake3::hash(id.0.as_bytes()).to_hex().to_string(),
            chains: BTreeMap::new(),
        }
    }

    pub fn chain(&self, chain: &ChainType) -> VaultResult<&Chain> {
        self.chains
            .get(chain)
            .ok_or_else(|| VaultError::validation(format!("no {chain} address on this account")))
    }

    pub fn chain_mut(&mut self, chain: &ChainType) -> VaultResult<&mut Chain> {
        self.chains
            .get_mut(chain)
            .ok_or_else(|| VaultError::validation(format!("no {chain} address on this account")))
    }

    pub fn has_pendings(&self) -> bool {
        self.chains.values().any(|chain| !chain.pendings.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletAccount {
    pub id: AccountId,
    pub name: String,
    pub hidden: bool,
    pub metadata: BTreeMap<String, String>,
    pub ledger: Ledger,
}

impl WalletAccount {
    pub fn new(name: impl Into<String>) -> Self {
        let id = AccountId::generate();
        Self {
            ledger: Ledger::for_account(&id),
            id,
            name: name.into(),
            hidden: false,
            metadata: BTreeMap::new(),
        }
    }
}

/// All accounts owned by the wallet, keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBook {
    accounts: BTreeMap<AccountId, WalletAccount>,
}

impl AccountBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WalletAccount> {
        self.accounts.values()
    }

    pub fn get(&self, id: &AccountId) -> VaultResult<&WalletAccount> {
        self.accounts
            .get(id)
            .ok_or_else(|| VaultError::validation(format!("unknown account '{id}'")))
    }

    pub fn get_mut(&mut self, id: &AccountId) -> VaultResult<&mut WalletAccount> {
        self.accounts
            .get_mut(id)
            .ok_or_else(|| VaultError::validation(format!("unknown account '{id}'")))
    }

    pub fn chain(&self, id: &AccountId, chain: &ChainType) -> VaultResult<&Chain> {
        self.get(id)?.ledger.chain(chain)
    }

    pub fn chain_mut(&mut self, id: &AccountId, chain: &ChainType) -> VaultResult<&mut Chain> {
        self.get_mut(id)?.ledger.chain_mut(chain)
    }

    pub fn create(&mut self, name: &str) -> VaultResult<AccountId> {
        let name = validate_name(name)?;
        let account = WalletAccount::new(name);
        let id = account.id.clone();
        self.accounts.insert(id.clone(), account);
        Ok(id)
    }

    pub fn rename(&mut self, id: &AccountId, name: &str) -> VaultResult<String> {
        let name = validate_name(name)?;
        let account = self.get_mut(id)?;
        account.name = name.clone();
        Ok(name)
    }

    pub fn set_hidden(&mut self, id: &AccountId, hidden: bool) -> VaultResult<()> {
        self.get_mut(id)?.hidden = hidden;
        Ok(())
    }

    /// Accounts with unresolved pending entries cannot be removed.
    pub fn remove(&mut self, id: &AccountId) -> VaultResult<WalletAccount> {
        if self.get(id)?.ledger.has_pendings() {
            return Err(VaultError::validation(format!(
                "account '{id}' still has pending transactions"
            )));
        }
        self.accounts
            .remove(id)
            .ok_or_else(|| VaultError::validation(format!("unknown account '{id}'")))
    }

    pub fn ensure_no_address(&self, id: &AccountId, chain: &ChainType) -> VaultResult<()> {
        if self.get(id)?.ledger.chains.contains_key(chain) {
            return Err(VaultError::validation(format!(
                "account '{id}' already has a {chain} address"
            )));
        }
        Ok(())
    }

    pub fn insert_address(
        &mut self,
        id: &AccountId,
        chain: ChainType,
        address: String,
    ) -> VaultResult<()> {
        self.ensure_no_address(id, &chain)?;
        self.get_mut(id)?
            .ledger
            .chains
            .insert(chain.clone(), Chain::new(chain, address));
        Ok(())
    }

    /// Addresses with unresolved pending entries cannot be removed.
    pub fn remove_address(&mut self, id: &AccountId, chain: &ChainType) -> VaultResult<Chain> {
        if !self.chain(id, chain)?.pendings.is_empty() {
            return Err(VaultError::validation(format!(
                "{chain} address of account '{id}' still has pending transactions"
            )));
        }
        self.get_mut(id)?
            .ledger
            .chains
            .remove(chain)
            .ok_or_else(|| VaultError::validation(format!("no {chain} address on this account")))
    }

    pub fn add_pending(
        &mut self,
        id: &AccountId,
        chain: &ChainType,
        entry: PendingEntry,
    ) -> VaultResult<usize> {
        self.chain_mut(id, chain)?.add_pending(entry)
    }

    pub fn remove_pending(
        &mut self,
        id: &AccountId,
        chain: &ChainType,
        index: usize,
    ) -> VaultResult<PendingEntry> {
        self.chain_mut(id, chain)?.remove_pending(index)
    }

    pub fn balance(&self, id: &AccountId, chain: &ChainType) -> VaultResult<u128> {
        Ok(self.chain(id, chain)?.balance)
    }
}

fn validate_name(name: &str) -> VaultResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(VaultError::validation("account name cannot be empty"));
    }
    if trimmed.chars().count() > 64 {
        return Err(VaultError::validation("account name exceeds 64 characters"));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::IcpPending;

    #[test]
    fn account_lifecycle() {
        let mut book = AccountBook::new();
        let id = book.create("  Treasury ").unwrap();
        assert_eq!(book.get(&id).unwrap().name, "Treasury");
        assert_eq!(book.get(&id).unwrap().ledger.subaccount.len(), 64);

        book.rename(&id, "Ops").unwrap();
        book.set_hidden(&id, true).unwrap();
        assert!(book.get(&id).unwrap().hidden);

        book.remove(&id).unwrap();
        assert!(book.get(&id).is_err());
        assert!(book.create("   ").is_err());
    }

    #[test]
    fn addresses_are_unique_per_chain() {
        let mut book = AccountBook::new();
        let id = book.create("Main").unwrap();
        book.insert_address(&id, ChainType::Icp, "icp-addr".into())
            .unwrap();
        assert!(book
            .insert_address(&id, ChainType::Icp, "other".into())
            .is_err());
        assert_eq!(book.balance(&id, &ChainType::Icp).unwrap(), 0);
    }

    #[test]
    fn pending_entries_block_removal() {
        let mut book = AccountBook::new();
        let id = book.create("Main").unwrap();
        book.insert_address(&id, ChainType::Icp, "icp-addr".into())
            .unwrap();
        book.add_pending(
            &id,
            &ChainType::Icp,
            PendingEntry::Icp(IcpPending {
                block_index: 12,
                canister: "ledger".into(),
            }),
        )
        .unwrap();

        assert!(book.remove_address(&id, &ChainType::Icp).is_err());
        assert!(book.remove(&id).is_err());

        book.remove_pending(&id, &ChainType::Icp, 0).unwrap();
        book.remove_address(&id, &ChainType::Icp).unwrap();
        book.remove(&id).unwrap();
    }
}
