//! Connector adapters for the custody wallet.
//!
//! Deterministic in-process stand-ins for the chain ledgers, the ckBTC minter, the
//! threshold signer and the release registry. Identifiers are derived with blake3 from
//! the request contents and a sequence number, so runs are reproducible.

#![deny(unsafe_code)]

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use vault_core::chain::{ChainFamily, ChainType, PendingEntry};
use vault_core::connectors::{
    BtcMinter, ChainConnector, ConnectorRegistry, Finality, MessageSigner, ReleaseRegistry,
    RetrieveBtcStatus, TransferReceipt, TransferRequest, UtxoStatus,
};
use vault_core::error::{VaultError, VaultResult};

/// Principal of the ICP ledger canister, reported in ICP receipts.
pub const ICP_LEDGER_CANISTER: &str = "ryjl3-tyaaa-aaaaa-aaaba-cai";

/// Smallest ckBTC amount the mock minter accepts for a retrieval.
pub const DEFAULT_RETRIEVE_MIN: u128 = 10_000;

fn lock<'a, T>(name: &str, mutex: &'a Mutex<T>) -> VaultResult<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| VaultError::connector(name, "state lock poisoned"))
}

fn digest(parts: &[&[u8]]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
        hasher.update(b"|");
    }
    hasher.finalize().to_hex().to_string()
}

#[derive(Debug, Default)]
struct LedgerState {
    balances: HashMap<(ChainType, String), u128>,
    transfers: Vec<TransferRequest>,
    sequence: u64,
    head: u64,
}

/// Mock ledger for one chain family.
///
/// Holds its own balances, so a transfer fails when the source address was never
/// funded with [`MockLedger::fund`]. EVM transfers become final after the configured
/// number of confirmations; every other family is final on submission.
#[derive(Debug)]
pub struct MockLedger {
    family: ChainFamily,
    confirmations: u64,
    state: Mutex<LedgerState>,
}

impl MockLedger {
    fn with_family(family: ChainFamily, confirmations: u64) -> Self {
        Self {
            family,
            confirmations,
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn btc() -> Self {
        Self::with_family(ChainFamily::Btc, 0)
    }

    pub fn evm(confirmations: u64) -> Self {
        Self::with_family(ChainFamily::Evm, confirmations)
    }

    pub fn icp() -> Self {
        Self::with_family(ChainFamily::Icp, 0)
    }

    pub fn icrc() -> Self {
        Self::with_family(ChainFamily::Icrc, 0)
    }

    pub fn ckbtc() -> Self {
        Self::with_family(ChainFamily::Ckbtc, 0)
    }

    fn state(&self) -> VaultResult<MutexGuard<'_, LedgerState>> {
        lock(self.family.name(), &self.state)
    }

    /// Credit an address on this ledger.
    pub fn fund(&self, chain: &ChainType, address: &str, amount: u128) -> VaultResult<u128> {
        let mut state = self.state()?;
        let balance = state
            .balances
            .entry((chain.clone(), address.to_string()))
            .or_default();
        *balance = balance.saturating_add(amount);
        Ok(*balance)
    }

    /// Advance the chain head by `blocks`.
    pub fn mine(&self, blocks: u64) -> VaultResult<u64> {
        let mut state = self.state()?;
        state.head = state.head.saturating_add(blocks);
        Ok(state.head)
    }

    /// Every transfer accepted so far, in submission order.
    pub fn transfers(&self) -> VaultResult<Vec<TransferRequest>> {
        Ok(self.state()?.transfers.clone())
    }

    fn balance_key(request_chain: &ChainType, token: Option<&str>, address: &str) -> (ChainType, String) {
        match token {
            Some(token) => (request_chain.clone(), format!("{token}:{address}")),
            None => (request_chain.clone(), address.to_string()),
        }
    }

    fn receipt(&self, request: &TransferRequest, sequence: u64, block_index: u64) -> TransferReceipt {
        let id = digest(&[
            self.family.name().as_bytes(),
            request.from.as_bytes(),
            request.to.as_bytes(),
            request.amount.to_string().as_bytes(),
            &sequence.to_le_bytes(),
        ]);
        match self.family {
            ChainFamily::Btc => TransferReceipt::Btc { txid: id },
            ChainFamily::Evm => TransferReceipt::Evm {
                tx_hash: format!("0x{id}"),
                block_index,
            },
            ChainFamily::Icp => TransferReceipt::Icp {
                block_index,
                canister: ICP_LEDGER_CANISTER.to_string(),
            },
            ChainFamily::Icrc | ChainFamily::Ckbtc => TransferReceipt::Icrc {
                tx_index: u128::from(sequence),
                block_index,
            },
        }
    }
}

#[async_trait]
impl ChainConnector for MockLedger {
    fn family(&self) -> ChainFamily {
        self.family
    }

    async fn derive_address(&self, chain: &ChainType, subaccount: &str) -> VaultResult<String> {
        if subaccount.is_empty() {
            return Err(VaultError::validation("subaccount is empty"));
        }
        let id = digest(&[chain.to_string().as_bytes(), subaccount.as_bytes()]);
        Ok(match self.family {
            ChainFamily::Btc => format!("bc1q{}", &id[..38]),
            ChainFamily::Evm => format!("0x{}", &id[..40]),
            ChainFamily::Icp => id,
            ChainFamily::Icrc | ChainFamily::Ckbtc => format!("vault-wallet.{}", &id[..32]),
        })
    }

    async fn transfer(&self, request: &TransferRequest) -> VaultResult<TransferReceipt> {
        if request.chain.family() != self.family {
            return Err(VaultError::connector(
                self.family.name(),
                format!("cannot transfer on {}", request.chain),
            ));
        }
        let mut state = self.state()?;
        let token = request.token.as_deref();
        let source = Self::balance_key(&request.chain, token, &request.from);
        let available = state.balances.get(&source).copied().unwrap_or(0);
        if available < request.amount {
            return Err(VaultError::connector(
                self.family.name(),
                format!(
                    "ledger balance of {} is {available}, transfer needs {}",
                    request.from, request.amount
                ),
            ));
        }
        state.balances.insert(source, available - request.amount);
        let target = Self::balance_key(&request.chain, token, &request.to);
        let credited = state.balances.entry(target).or_default();
        *credited = credited.saturating_add(request.amount);

        state.sequence += 1;
        state.head += 1;
        let (sequence, block_index) = (state.sequence, state.head);
        state.transfers.push(request.clone());
        drop(state);

        let receipt = self.receipt(request, sequence, block_index);
        debug!(chain = %request.chain, amount = request.amount, receipt = ?receipt, "Mock transfer accepted");
        Ok(receipt)
    }

    async fn balance(&self, chain: &ChainType, address: &str) -> VaultResult<u128> {
        let state = self.state()?;
        Ok(state
            .balances
            .get(&(chain.clone(), address.to_string()))
            .copied()
            .unwrap_or(0))
    }

    async fn finality(&self, _chain: &ChainType, entry: &PendingEntry) -> VaultResult<Finality> {
        match entry {
            PendingEntry::Evm(pending) => {
                let head = self.state()?.head;
                if head >= pending.block_index.saturating_add(self.confirmations) {
                    Ok(Finality::Finalized)
                } else {
                    Ok(Finality::Pending)
                }
            }
            _ => Ok(Finality::Finalized),
        }
    }
}

#[derive(Debug, Default)]
struct MinterState {
    utxos: HashMap<String, Vec<UtxoStatus>>,
    retrievals: BTreeMap<u64, RetrieveBtcStatus>,
    next_block: u64,
}

/// Scriptable ckBTC minter.
///
/// `update_balance` replays every UTXO status ever reported for an owner, the way the
/// real minter keeps answering for already-minted deposits.
#[derive(Debug)]
pub struct MockCkbtcMinter {
    retrieve_min: u128,
    state: Mutex<MinterState>,
}

impl Default for MockCkbtcMinter {
    fn default() -> Self {
        Self::new(DEFAULT_RETRIEVE_MIN)
    }
}

impl MockCkbtcMinter {
    pub fn new(retrieve_min: u128) -> Self {
        Self {
            retrieve_min,
            state: Mutex::new(MinterState::default()),
        }
    }

    fn state(&self) -> VaultResult<MutexGuard<'_, MinterState>> {
        lock("ckbtc-minter", &self.state)
    }

    pub fn deposit_address(owner: &str) -> String {
        format!("bc1q{}", &digest(&[b"deposit", owner.as_bytes()])[..38])
    }

    pub fn report_utxo(&self, owner: &str, status: UtxoStatus) -> VaultResult<()> {
        self.state()?
            .utxos
            .entry(owner.to_string())
            .or_default()
            .push(status);
        Ok(())
    }

    pub fn set_retrieve_status(&self, block_index: u64, status: RetrieveBtcStatus) -> VaultResult<()> {
        self.state()?.retrievals.insert(block_index, status);
        Ok(())
    }
}

#[async_trait]
impl BtcMinter for MockCkbtcMinter {
    async fn get_btc_address(&self, owner: &str) -> VaultResult<String> {
        Ok(Self::deposit_address(owner))
    }

    async fn update_balance(&self, owner: &str) -> VaultResult<Vec<UtxoStatus>> {
        Ok(self.state()?.utxos.get(owner).cloned().unwrap_or_default())
    }

    async fn retrieve_btc(&self, address: &str, amount: u128) -> VaultResult<u64> {
        if amount < self.retrieve_min {
            return Err(VaultError::connector(
                "ckbtc-minter",
                format!("amount {amount} is below the retrieval minimum {}", self.retrieve_min),
            ));
        }
        let mut state = self.state()?;
        state.next_block += 1;
        let block_index = state.next_block;
        state.retrievals.insert(block_index, RetrieveBtcStatus::Pending);
        debug!(address, amount, block_index, "Mock BTC retrieval queued");
        Ok(block_index)
    }

    async fn retrieve_btc_status(&self, block_index: u64) -> VaultResult<RetrieveBtcStatus> {
        Ok(self
            .state()?
            .retrievals
            .get(&block_index)
            .cloned()
            .unwrap_or(RetrieveBtcStatus::Unknown))
    }
}

/// Signer that derives a 64-byte signature from the key id and payload.
#[derive(Debug, Clone, Default)]
pub struct MockSigner;

impl MockSigner {
    pub fn signature(key_id: &str, payload: &[u8]) -> Vec<u8> {
        let mut hasher = blake3::Hasher::new_derive_key("custody-wallet mock signature");
        hasher.update(key_id.as_bytes());
        hasher.update(payload);
        let mut signature = vec![0u8; 64];
        hasher.finalize_xof().fill(&mut signature);
        signature
    }

    pub fn verify(key_id: &str, payload: &[u8], signature: &[u8]) -> bool {
        Self::signature(key_id, payload) == signature
    }
}

#[async_trait]
impl MessageSigner for MockSigner {
    async fn sign(&self, key_id: &str, payload: &[u8]) -> VaultResult<Vec<u8>> {
        if key_id.is_empty() {
            return Err(VaultError::connector("signer", "key id is empty"));
        }
        Ok(Self::signature(key_id, payload))
    }
}

/// Release registry backed by an in-memory table of published module hashes.
#[derive(Debug, Default)]
pub struct StaticReleaseRegistry {
    releases: Mutex<HashMap<(String, String), String>>,
}

impl StaticReleaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a module; returns its hex SHA-256.
    pub fn publish(&self, app_name: &str, version: &str, module: &[u8]) -> VaultResult<String> {
        let hash = hex::encode(Sha256::digest(module));
        self.publish_hash(app_name, version, hash.clone())?;
        Ok(hash)
    }

    pub fn publish_hash(&self, app_name: &str, version: &str, hash: impl Into<String>) -> VaultResult<()> {
        lock("release-registry", &self.releases)?
            .insert((app_name.to_string(), version.to_string()), hash.into());
        Ok(())
    }
}

#[async_trait]
impl ReleaseRegistry for StaticReleaseRegistry {
    async fn release_hash(&self, app_name: &str, version: &str) -> VaultResult<String> {
        lock("release-registry", &self.releases)?
            .get(&(app_name.to_string(), version.to_string()))
            .cloned()
            .ok_or_else(|| {
                VaultError::connector(
                    "release-registry",
                    format!("no release {version} published for {app_name}"),
                )
            })
    }
}

/// Deterministic failing connector useful for chaos testing.
#[derive(Debug, Clone)]
pub struct AlwaysFailConnector {
    family: ChainFamily,
    reason: String,
}

impl AlwaysFailConnector {
    pub fn new(family: ChainFamily, reason: impl Into<String>) -> Self {
        Self {
            family,
            reason: reason.into(),
        }
    }

    fn fail<T>(&self) -> VaultResult<T> {
        Err(VaultError::connector(self.family.name(), self.reason.clone()))
    }
}

#[async_trait]
impl ChainConnector for AlwaysFailConnector {
    fn family(&self) -> ChainFamily {
        self.family
    }

    async fn derive_address(&self, _chain: &ChainType, _subaccount: &str) -> VaultResult<String> {
        self.fail()
    }

    async fn transfer(&self, _request: &TransferRequest) -> VaultResult<TransferReceipt> {
        self.fail()
    }

    async fn balance(&self, _chain: &ChainType, _address: &str) -> VaultResult<u128> {
        self.fail()
    }

    async fn finality(&self, _chain: &ChainType, _entry: &PendingEntry) -> VaultResult<Finality> {
        self.fail()
    }
}

/// One of every mock, wired into a [`ConnectorRegistry`] by [`MockSuite::registry`].
#[derive(Debug, Clone)]
pub struct MockSuite {
    pub btc: Arc<MockLedger>,
    pub evm: Arc<MockLedger>,
    pub icp: Arc<MockLedger>,
    pub icrc: Arc<MockLedger>,
    pub ckbtc: Arc<MockLedger>,
    pub minter: Arc<MockCkbtcMinter>,
    pub signer: Arc<MockSigner>,
    pub releases: Arc<StaticReleaseRegistry>,
}

impl MockSuite {
    pub fn new(evm_confirmations: u64) -> Self {
        Self {
            btc: Arc::new(MockLedger::btc()),
            evm: Arc::new(MockLedger::evm(evm_confirmations)),
            icp: Arc::new(MockLedger::icp()),
            icrc: Arc::new(MockLedger::icrc()),
            ckbtc: Arc::new(MockLedger::ckbtc()),
            minter: Arc::new(MockCkbtcMinter::default()),
            signer: Arc::new(MockSigner),
            releases: Arc::new(StaticReleaseRegistry::new()),
        }
    }

    pub fn ledger(&self, family: ChainFamily) -> &Arc<MockLedger> {
        match family {
            ChainFamily::Btc => &self.btc,
            ChainFamily::Evm => &self.evm,
            ChainFamily::Icp => &self.icp,
            ChainFamily::Icrc => &self.icrc,
            ChainFamily::Ckbtc => &self.ckbtc,
        }
    }

    pub fn registry(&self) -> ConnectorRegistry {
        ConnectorRegistry::new()
            .with_chain(self.btc.clone())
            .with_chain(self.evm.clone())
            .with_chain(self.icp.clone())
            .with_chain(self.icrc.clone())
            .with_chain(self.ckbtc.clone())
            .with_minter(self.minter.clone())
            .with_signer(self.signer.clone())
            .with_releases(self.releases.clone())
    }
}

impl Default for MockSuite {
    fn default() -> Self {
        Self::new(12)
    }
}
