//! Chain identifiers, per-chain records and chain-specific pending entries.

use crate::error::{VaultError, VaultResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Ledger family; selects the connector that talks to the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainFamily {
    Btc,
    Evm,
    Icp,
    Icrc,
    Ckbtc,
}

impl ChainFamily {
    pub fn name(self) -> &'static str {
        match self {
            Self::Btc => "btc",
            Self::Evm => "evm",
            Self::Icp => "icp",
            Self::Icrc => "icrc",
            Self::Ckbtc => "ckbtc",
        }
    }
}

/// Chain identifier used as the key of an account's ledger map.
///
/// Serialized as its textual form (`btc`, `evm:1`, `icp`, `icrc:<ledger>`, `ckbtc`) so it can
/// key JSON objects.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ChainType {
    Btc,
    Evm(u64),
    Icp,
    Icrc(String),
    Ckbtc,
}

impl ChainType {
    pub fn family(&self) -> ChainFamily {
        match self {
            Self::Btc => ChainFamily::Btc,
            Self::Evm(_) => ChainFamily::Evm,
            Self::Icp => ChainFamily::Icp,
            Self::Icrc(_) => ChainFamily::Icrc,
            Self::Ckbtc => ChainFamily::Ckbtc,
        }
    }
}

impl fmt::Display for ChainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Btc => write!(f, "btc"),
            Self::Evm(chain_id) => write!(f, "evm:{chain_id}"),
            Self::Icp => write!(f, "icp"),
            Self::Icrc(ledger) => write!(f, "icrc:{ledger}"),
            Self::Ckbtc => write!(f, "ckbtc"),
        }
    }
}

impl FromStr for ChainType {
    type Err = VaultError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        match normalized.split_once(':') {
            None => match normalized.to_ascii_lowercase().as_str() {
                "btc" => Ok(Self::Btc),
                "icp" => Ok(Self::Icp),
                "ckbtc" => Ok(Self::Ckbtc),
                other => Err(VaultError::validation(format!("unknown chain '{other}'"))),
            },
            Some((family, rest)) => match family.to_ascii_lowercase().as_str() {
                "evm" => rest
                    .parse::<u64>()
                    .map(Self::Evm)
                    .map_err(|_| VaultError::validation(format!("invalid evm chain id '{rest}'"))),
                "icrc" if !rest.is_empty() => Ok(Self::Icrc(rest.to_string())),
                "icrc" => Err(VaultError::validation("icrc chain requires a ledger id")),
                other => Err(VaultError::validation(format!(
                    "unknown chain family '{other}'"
                ))),
            },
        }
    }
}

impl TryFrom<String> for ChainType {
    type Error = VaultError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChainType> for String {
    fn from(value: ChainType) -> Self {
        value.to_string()
    }
}

/// BTC deposit sent to the minter and awaiting conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtcPending {
    pub txid: String,
    /// Minter-side account that owns the deposit address.
    pub account: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvmPending {
    pub tx_hash: String,
    pub block_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IcpPending {
    pub block_index: u64,
    pub canister: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IcrcPending {
    pub tx_index: u128,
    pub block_index: u64,
}

/// ckBTC burned for a BTC retrieval; `txid` becomes known once the minter submits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CkbtcPending {
    pub block_index: u64,
    pub txid: Option<String>,
}

/// A submitted-but-not-final transaction, shaped by the owning chain's confirmation model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PendingEntry {
    Btc(BtcPending),
    Evm(EvmPending),
    Icp(IcpPending),
    Icrc(IcrcPending),
    Ckbtc(CkbtcPending),
}

impl PendingEntry {
    pub fn family(&self) -> ChainFamily {
        match self {
            Self::Btc(_) => ChainFamily::Btc,
            Self::Evm(_) => ChainFamily::Evm,
            Self::Icp(_) => ChainFamily::Icp,
            Self::Icrc(_) => ChainFamily::Icrc,
            Self::Ckbtc(_) => ChainFamily::Ckbtc,
        }
    }

    /// Identity used to reject duplicates and to find an entry again after an await.
    pub fn key(&self) -> String {
        match self {
            Self::Btc(p) => format!("btc:{}", p.txid),
            Self::Evm(p) => format!("evm:{}", p.tx_hash.to_ascii_lowercase()),
            Self::Icp(p) => format!("icp:{}:{}", p.canister, p.block_index),
            Self::Icrc(p) => format!("icrc:{}", p.tx_index),
            Self::Ckbtc(p) => format!("ckbtc:{}", p.block_index),
        }
    }
}

/// Per-chain address record with book balance and ordered pending entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chain {
    pub chain: ChainType,
    pub address: String,
    /// Book balance in the chain's smallest unit.
    pub balance: u128,
    pub pendings: Vec<PendingEntry>,
}

impl Chain {
    pub fn new(chain: ChainType, address: impl Into<String>) -> Self {
        Self {
            chain,
            address: address.into(),
            balance: 0,
            pendings: Vec::new(),
        }
    }

    pub fn add_pending(&mut self, entry: PendingEntry) -> VaultResult<usize> {
        if entry.family() != self.chain.family() {
            return Err(VaultError::validation(format!(
                "{} pending entry cannot be tracked on chain {}",
                entry.family().name(),
                self.chain
            )));
        }
        let key = entry.key();
        if self.pendings.iter().any(|existing| existing.key() == key) {
            return Err(VaultError::validation(format!(
                "pending entry {key} already tracked on {}",
                self.chain
            )));
        }
        self.pendings.push(entry);
        Ok(self.pendings.len())
    }

    pub fn remove_pending(&mut self, index: usize) -> VaultResult<PendingEntry> {
        if index >= self.pendings.len() {
            return Err(VaultError::validation(format!(
                "pending index {index} out of range for {} ({} entries)",
                self.chain,
                self.pendings.len()
            )));
        }
        Ok(self.pendings.remove(index))
    }

    /// Remove by identity; `None` when the entry was already resolved.
    pub fn take_pending(&mut self, key: &str) -> Option<PendingEntry> {
        let position = self.pendings.iter().position(|entry| entry.key() == key)?;
        Some(self.pendings.remove(position))
    }

    pub fn pending_mut(&mut self, key: &str) -> Option<&mut PendingEntry> {
        self.pendings.iter_mut().find(|entry| entry.key() == key)
    }

    pub fn credit(&mut self, amount: u128) {
        self.balance = self.balance.saturating_add(amount);
    }

    pub fn ensure_funds(&self, amount: u128) -> VaultResult<()> {
        if self.balance < amount {
            return Err(VaultError::InsufficientFunds {
                chain: self.chain.to_string(),
                required: amount,
                available: self.balance,
            });
        }
        Ok(())
    }

    /// Book a transfer the connector has already accepted.
    ///
    /// Funds are checked before the external call, so this cannot fail; a receipt whose
    /// identity is already tracked is kept once.
    pub fn settle_outbound(&mut self, entry: Option<PendingEntry>, amount: u128) {
        if let Some(entry) = entry {
            let key = entry.key();
            if self.pendings.iter().any(|existing| existing.key() == key) {
                warn!(chain = %self.chain, key = %key, "Receipt already tracked");
            } else {
                self.pendings.push(entry);
            }
        }
        self.balance = self.balance.saturating_sub(amount);
    }
}
