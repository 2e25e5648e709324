//! Multi-signer custody wallet core.
//!
//! State-changing actions are proposed as operations, voted on by the signers whose role
//! permits the operation kind, and executed once the frozen threshold is reached before
//! the deadline. Every resolved operation lands in a hash-chained audit log.

#![deny(unsafe_code)]

pub mod account;
pub mod chain;
pub mod clock;
pub mod config;
pub mod connectors;
pub mod error;
pub mod executor;
pub mod loader;
pub mod operation;
pub mod pending;
pub mod processed;
pub mod request;
pub mod settings;
pub mod signer;
pub mod storage;
pub mod types;
pub mod wallet;

pub use account::{AccountBook, Ledger, WalletAccount};
pub use chain::{
    BtcPending, Chain, ChainFamily, ChainType, CkbtcPending, EvmPending, IcpPending, IcrcPending,
    PendingEntry,
};
pub use clock::{SimulatedTimeSource, SystemTimeSource, TimeSource};
pub use config::WalletConfig;
pub use connectors::{
    BtcMinter, ChainConnector, ConnectorRegistry, Finality, MessageSigner, ReleaseRegistry,
    RetrieveBtcStatus, TransferReceipt, TransferRequest, UtxoStatus,
};
pub use error::{ErrorCategory, VaultError, VaultResult};
pub use executor::{ExecutionContext, OperationExecutor};
pub use loader::{ChunkedCodeLoader, RunningModule};
pub use operation::{
    Operation, OperationKind, OperationResult, OperationStatus, PendingOperation, Vote,
    OPERATION_VERSION,
};
pub use pending::{PendingReport, PendingTransactionTracker};
pub use processed::{ProcessedLog, ProcessedOperation, Resolution};
pub use request::OperationRequestManager;
pub use settings::CanisterSettings;
pub use signer::{AccessLevel, OperationAccess, Role, Signer, SignerRegistry};
pub use storage::{StateStore, StorageConfig, WalletSnapshot, SNAPSHOT_VERSION};
pub use types::{AccountId, OperationId, RoleId, SignerId};
pub use wallet::{OperationView, Wallet, WalletStatus, ADMIN_ROLE};
