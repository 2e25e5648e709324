use crate::account::AccountBook;
use crate::error::{VaultError, VaultResult};
use crate::loader::RunningModule;
use crate::operation::PendingOperation;
use crate::processed::ProcessedOperation;
use crate::settings::CanisterSettings;
use crate::signer::SignerRegistry;
use crate::types::OperationId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Wallet state persistence backend configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Keep state in process memory only.
    #[default]
    Memory,
    /// Persist a JSON snapshot after every state change and reload it on startup.
    File { path: PathBuf },
}

impl StorageConfig {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File { path: path.into() }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::File { .. } => "file",
        }
    }
}

/// Everything needed to rebuild a wallet, except the in-progress upload buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletSnapshot {
    pub version: u32,
    pub registry: SignerRegistry,
    pub accounts: AccountBook,
    pub pending: Vec<PendingOperation>,
    pub processed: Vec<ProcessedOperation>,
    pub next_operation_id: OperationId,
    pub settings: CanisterSettings,
    pub running_module: Option<RunningModule>,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
enum StoreBackend {
    Memory(Arc<Mutex<Option<WalletSnapshot>>>),
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct StateStore {
    backend: StoreBackend,
}

impl StateStore {
    pub fn open(config: &StorageConfig) -> Self {
        let backend = match config {
            StorageConfig::Memory => StoreBackend::Memory(Arc::new(Mutex::new(None))),
            StorageConfig::File { path } => StoreBackend::File(path.clone()),
        };
        Self { backend }
    }

    pub fn label(&self) -> &'static str {
        match self.backend {
            StoreBackend::Memory(_) => "memory",
            StoreBackend::File(_) => "file",
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.backend {
            StoreBackend::Memory(_) => None,
            StoreBackend::File(path) => Some(path),
        }
    }

    pub fn load(&self) -> VaultResult<Option<WalletSnapshot>> {
        let snapshot = match &self.backend {
            StoreBackend::Memory(slot) => slot
                .lock()
                .map_err(|_| VaultError::Storage("memory store lock poisoned".to_string()))?
                .clone(),
            StoreBackend::File(path) => {
                if !path.exists() {
                    return Ok(None);
                }
                let bytes = fs::read(path).map_err(|e| io_error(path, e))?;
                if bytes.is_empty() {
                    return Ok(None);
                }
                Some(serde_json::from_slice::<WalletSnapshot>(&bytes)?)
            }
        };

        match snapshot {
            Some(snapshot) if snapshot.version != SNAPSHOT_VERSION => Err(VaultError::Storage(
                format!("unsupported snapshot version {}", snapshot.version),
            )),
            other => Ok(other),
        }
    }

    pub fn save(&self, snapshot: &WalletSnapshot) -> VaultResult<()> {
        match &self.backend {
            StoreBackend::Memory(slot) => {
                *slot
                    .lock()
                    .map_err(|_| VaultError::Storage("memory store lock poisoned".to_string()))? =
                    Some(snapshot.clone());
                Ok(())
            }
            StoreBackend::File(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
                }
                let bytes = serde_json::to_vec_pretty(snapshot)?;
                let tmp_path = path.with_extension("tmp");
                fs::write(&tmp_path, bytes).map_err(|e| io_error(&tmp_path, e))?;
                fs::rename(&tmp_path, path).map_err(|e| io_error(path, e))?;
                Ok(())
            }
        }
    }
}

fn io_error(path: &Path, err: std::io::Error) -> VaultError {
    VaultError::Storage(format!("{}: {err}", path.display()))
}
