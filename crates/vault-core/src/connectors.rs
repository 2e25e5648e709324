//! External collaborators reached over asynchronous calls: chain ledgers, the ckBTC
//! minter, the threshold signer and the release registry.

use crate::chain::{ChainFamily, ChainType, PendingEntry};
use crate::error::{VaultError, VaultResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Outbound transfer handed to a chain connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub chain: ChainType,
    pub from: String,
    pub to: String,
    pub amount: u128,
    /// ERC-20 contract address; `None` for the native asset.
    pub token: Option<String>,
    pub memo: Option<u64>,
}

/// Chain-specific proof that a transfer was submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferReceipt {
    Btc { txid: String },
    Evm { tx_hash: String, block_index: u64 },
    Icp { block_index: u64, canister: String },
    Icrc { tx_index: u128, block_index: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Finality {
    Finalized,
    Pending,
}

/// Per-UTXO outcome reported by the minter's `update_balance`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UtxoStatus {
    Minted {
        block_index: u64,
        minted_amount: u128,
        txid: String,
    },
    Checked {
        txid: String,
    },
    ValueTooSmall {
        txid: String,
    },
    Tainted {
        txid: String,
    },
}

impl UtxoStatus {
    pub fn txid(&self) -> &str {
        match self {
            Self::Minted { txid, .. }
            | Self::Checked { txid }
            | Self::ValueTooSmall { txid }
            | Self::Tainted { txid } => txid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RetrieveBtcStatus {
    Unknown,
    Pending,
    Signing,
    Sending { txid: String },
    Submitted { txid: String },
    AmountTooLow,
    Confirmed { txid: String },
}

impl RetrieveBtcStatus {
    /// Minter will not report anything further for this request.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed { .. } | Self::AmountTooLow)
    }

    pub fn txid(&self) -> Option<&str> {
        match self {
            Self::Sending { txid } | Self::Submitted { txid } | Self::Confirmed { txid } => {
                Some(txid)
            }
            _ => None,
        }
    }
}

#[async_trait]
pub trait ChainConnector: Send + Sync {
    fn family(&self) -> ChainFamily;

    async fn derive_address(&self, chain: &ChainType, subaccount: &str) -> VaultResult<String>;

    async fn transfer(&self, request: &TransferRequest) -> VaultResult<TransferReceipt>;

    async fn balance(&self, chain: &ChainType, address: &str) -> VaultResult<u128>;

    async fn finality(&self, chain: &ChainType, entry: &PendingEntry) -> VaultResult<Finality>;
}

/// The ckBTC bridge.
#[async_trait]
pub trait BtcMinter: Send + Sync {
    async fn get_btc_address(&self, owner: &str) -> VaultResult<String>;

    async fn update_balance(&self, owner: &str) -> VaultResult<Vec<UtxoStatus>>;

    /// Burn `amount` ckBTC and queue a BTC payout; returns the burn block index.
    async fn retrieve_btc(&self, address: &str, amount: u128) -> VaultResult<u64>;

    async fn retrieve_btc_status(&self, block_index: u64) -> VaultResult<RetrieveBtcStatus>;
}

#[async_trait]
pub trait MessageSigner: Send + Sync {
    async fn sign(&self, key_id: &str, payload: &[u8]) -> VaultResult<Vec<u8>>;
}

#[async_trait]
pub trait ReleaseRegistry: Send + Sync {
    /// Hex SHA-256 of the published module for `(app_name, version)`.
    async fn release_hash(&self, app_name: &str, version: &str) -> VaultResult<String>;
}

/// Registry of connector plugins.
#[derive(Default, Clone)]
pub struct ConnectorRegistry {
    chains: HashMap<ChainFamily, Arc<dyn ChainConnector>>,
    minter: Option<Arc<dyn BtcMinter>>,
    signer: Option<Arc<dyn MessageSigner>>,
    releases: Option<Arc<dyn ReleaseRegistry>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, connector: Arc<dyn ChainConnector>) {
        self.chains.insert(connector.family(), connector);
    }

    pub fn with_chain(mut self, connector: Arc<dyn ChainConnector>) -> Self {
        self.register(connector);
        self
    }

    pub fn with_minter(mut self, minter: Arc<dyn BtcMinter>) -> Self {
        self.minter = Some(minter);
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn MessageSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_releases(mut self, releases: Arc<dyn ReleaseRegistry>) -> Self {
        self.releases = Some(releases);
        self
    }

    pub fn has(&self, family: ChainFamily) -> bool {
        self.chains.contains_key(&family)
    }

    pub fn chain(&self, family: ChainFamily) -> VaultResult<Arc<dyn ChainConnector>> {
        self.chains
            .get(&family)
            .cloned()
            .ok_or_else(|| VaultError::connector(family.name(), "no connector registered"))
    }

    pub fn minter(&self) -> VaultResult<Arc<dyn BtcMinter>> {
        self.minter
            .clone()
            .ok_or_else(|| VaultError::connector("ckbtc-minter", "no minter registered"))
    }

    pub fn signer(&self) -> VaultResult<Arc<dyn MessageSigner>> {
        self.signer
            .clone()
            .ok_or_else(|| VaultError::connector("signer", "no message signer registered"))
    }

    pub fn releases(&self) -> VaultResult<Arc<dyn ReleaseRegistry>> {
        self.releases
            .clone()
            .ok_or_else(|| VaultError::connector("release-registry", "no release registry registered"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DummyConnector;

    #[async_trait]
    impl ChainConnector for DummyConnector {
        fn family(&self) -> ChainFamily {
            ChainFamily::Icp
        }

        async fn derive_address(&self, _chain: &ChainType, subaccount: &str) -> VaultResult<String> {
            Ok(format!("icp-{subaccount}"))
        }

        async fn transfer(&self, _request: &TransferRequest) -> VaultResult<TransferReceipt> {
            Ok(TransferReceipt::Icp {
                block_index: 1,
                canister: "ledger".to_string(),
            })
        }

        async fn balance(&self, _chain: &ChainType, _address: &str) -> VaultResult<u128> {
            Ok(0)
        }

        async fn finality(&self, _chain: &ChainType, _entry: &PendingEntry) -> VaultResult<Finality> {
            Ok(Finality::Finalized)
        }
    }

    #[test]
    fn connector_registry_roundtrip() {
        let registry = ConnectorRegistry::new().with_chain(Arc::new(DummyConnector));
        assert!(registry.has(ChainFamily::Icp));
        assert!(registry.chain(ChainFamily::Btc).is_err());
        assert!(registry.minter().is_err());
    }

    #[test]
    fn retrieve_status_terminality() {
        assert!(RetrieveBtcStatus::Confirmed { txid: "t".into() }.is_terminal());
        assert!(RetrieveBtcStatus::AmountTooLow.is_terminal());
        assert!(!RetrieveBtcStatus::Unknown.is_terminal());
        assert_eq!(
            RetrieveBtcStatus::Submitted { txid: "t".into() }.txid(),
            Some("t")
        );
    }
}
