#![deny(unsafe_code)]

pub mod config;

use axum::body::Bytes;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;
use vault_adapters::MockSuite;
use vault_core::{
    AccessLevel, AccountId, ChainType, ConnectorRegistry, ErrorCategory, Operation,
    OperationId, OperationView, PendingEntry, PendingOperation, PendingReport,
    ProcessedOperation, RetrieveBtcStatus, RoleId, Signer, SignerId, StateStore,
    SystemTimeSource, TimeSource, VaultError, Vote, Wallet, WalletAccount, WalletStatus,
};

pub use crate::config::ServiceConfig;

/// Header carrying the authenticated principal of the caller.
pub const CALLER_HEADER: &str = "x-caller";

#[derive(Clone)]
pub struct ServiceState {
    pub wallet: Arc<Mutex<Wallet>>,
    pub store: StateStore,
}

impl ServiceState {
    pub fn bootstrap(
        config: &ServiceConfig,
        connectors: ConnectorRegistry,
    ) -> Result<Self, ServiceError> {
        Self::bootstrap_with_clock(config, connectors, Arc::new(SystemTimeSource))
    }

    /// Restore the wallet from the configured store, or create a fresh one for the owner.
    pub fn bootstrap_with_clock(
        config: &ServiceConfig,
        connectors: ConnectorRegistry,
        clock: Arc<dyn TimeSource>,
    ) -> Result<Self, ServiceError> {
        let store = StateStore::open(&config.storage);
        let wallet = match store.load()? {
            Some(snapshot) => {
                info!(backend = store.label(), "Restoring wallet snapshot");
                Wallet::from_snapshot(snapshot, config.wallet.clone(), connectors, clock)?
            }
            None => {
                let wallet = Wallet::new(
                    config.owner.as_str(),
                    config.wallet.clone(),
                    connectors,
                    clock,
                )?;
                store.save(&wallet.snapshot())?;
                wallet
            }
        };

        Ok(Self {
            wallet: Arc::new(Mutex::new(wallet)),
            store,
        })
    }

    fn persist(&self, wallet: &Wallet) -> Result<(), ApiError> {
        self.store.save(&wallet.snapshot())?;
        Ok(())
    }
}

/// Connectors for a development deployment: the in-process mocks, with the configured
/// releases published to the mock registry.
pub fn dev_connectors(config: &ServiceConfig) -> Result<ConnectorRegistry, ServiceError> {
    let mocks = MockSuite::default();
    for (version, hash) in &config.releases {
        mocks
            .releases
            .publish_hash(&config.wallet.app_name, version, hash.clone())?;
    }
    Ok(mocks.registry())
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(wallet_status))
        .route("/v1/operations", post(request_operation))
        .route("/v1/operations/pending", get(list_pending))
        .route("/v1/operations/processed", get(list_processed))
        .route("/v1/operations/:id", get(get_operation))
        .route("/v1/operations/:id/response", post(respond))
        .route("/v1/signers", post(add_signer))
        .route("/v1/signers/:signer_id/validate", get(validate_signer))
        .route("/v1/signers/:signer_id/remove", post(remove_signer))
        .route("/v1/roles", post(add_role))
        .route("/v1/roles/:role_id/remove", post(remove_role))
        .route("/v1/accounts/:account_id", get(get_account))
        .route(
            "/v1/accounts/:account_id/chains/:chain/balance",
            get(account_balance),
        )
        .route(
            "/v1/accounts/:account_id/chains/:chain/address",
            post(create_address),
        )
        .route(
            "/v1/accounts/:account_id/chains/:chain/address/remove",
            post(remove_address),
        )
        .route(
            "/v1/accounts/:account_id/chains/:chain/pendings",
            post(add_pending),
        )
        .route(
            "/v1/accounts/:account_id/chains/:chain/pendings/:index",
            delete(remove_pending),
        )
        .route(
            "/v1/accounts/:account_id/chains/:chain/check-pending",
            post(check_pending),
        )
        .route(
            "/v1/accounts/:account_id/chains/:chain/sync-balance",
            post(sync_balance),
        )
        .route(
            "/v1/accounts/:account_id/update-balance",
            post(update_balance),
        )
        .route(
            "/v1/accounts/:account_id/retrievals/:block_index",
            get(retrieve_btc_status),
        )
        .route("/v1/code/chunks", post(load_chunk).delete(unload_chunks))
        .route("/v1/code/hash", get(code_hash))
        .route("/v1/code/upgrade", post(upgrade))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("wallet error: {0}")]
    Vault(#[from] VaultError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Vault(#[from] VaultError),
}

impl ApiError {
    fn unauthenticated(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }
}

fn vault_status(err: &VaultError) -> StatusCode {
    match err.category() {
        ErrorCategory::Validation => StatusCode::BAD_REQUEST,
        ErrorCategory::Authorization => StatusCode::FORBIDDEN,
        ErrorCategory::Consensus => match err {
            VaultError::OperationNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::CONFLICT,
        },
        ErrorCategory::Execution => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCategory::Infrastructure => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Http { status, message } => {
                (status, Json(serde_json::json!({ "error": message }))).into_response()
            }
            ApiError::Vault(err) => {
                let status = vault_status(&err);
                if status.is_server_error() {
                    tracing::error!(error = %err, "Wallet infrastructure failure");
                }
                (
                    status,
                    Json(serde_json::json!({
                        "error": err.to_string(),
                        "category": err.category(),
                    })),
                )
                    .into_response()
            }
        }
    }
}

/// Principal taken from the [`CALLER_HEADER`] header.
#[derive(Debug, Clone)]
pub struct Caller(pub SignerId);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(CALLER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| Caller(SignerId::from(value)))
            .ok_or_else(|| ApiError::unauthenticated(format!("missing {CALLER_HEADER} header")))
    }
}

fn parse_chain(raw: &str) -> Result<ChainType, ApiError> {
    Ok(raw.parse::<ChainType>()?)
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    storage_backend: &'static str,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "vault-service",
        storage_backend: state.store.label(),
    })
}

async fn wallet_status(State(state): State<ServiceState>) -> Result<Json<WalletStatus>, ApiError> {
    let mut wallet = state.wallet.lock().await;
    let status = wallet.wallet_status()?;
    state.persist(&wallet)?;
    Ok(Json(status))
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationRequestBody {
    pub operation: Operation,
    #[serde(default)]
    pub consent_message: String,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationCreated {
    pub operation_id: OperationId,
}

async fn request_operation(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Json(body): Json<OperationRequestBody>,
) -> Result<Json<OperationCreated>, ApiError> {
    let mut wallet = state.wallet.lock().await;
    let operation_id = wallet
        .request(&caller, body.operation, body.consent_message, body.deadline)
        .await?;
    state.persist(&wallet)?;
    Ok(Json(OperationCreated { operation_id }))
}

#[derive(Debug, Clone, Deserialize)]
struct ResponseBody {
    vote: Vote,
}

async fn respond(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Path(id): Path<OperationId>,
    Json(body): Json<ResponseBody>,
) -> Result<Json<OperationView>, ApiError> {
    let mut wallet = state.wallet.lock().await;
    let view = wallet.response(&caller, id, body.vote).await?;
    state.persist(&wallet)?;
    Ok(Json(view))
}

async fn list_pending(
    State(state): State<ServiceState>,
) -> Result<Json<Vec<PendingOperation>>, ApiError> {
    let mut wallet = state.wallet.lock().await;
    let pending = wallet.get_pending_list()?;
    state.persist(&wallet)?;
    Ok(Json(pending))
}

async fn list_processed(
    State(state): State<ServiceState>,
) -> Result<Json<Vec<ProcessedOperation>>, ApiError> {
    let mut wallet = state.wallet.lock().await;
    let processed = wallet.get_processed_list()?;
    state.persist(&wallet)?;
    Ok(Json(processed))
}

async fn get_operation(
    State(state): State<ServiceState>,
    Path(id): Path<OperationId>,
) -> Result<Json<OperationView>, ApiError> {
    let mut wallet = state.wallet.lock().await;
    let view = wallet.get_operation(id)?;
    state.persist(&wallet)?;
    Ok(Json(view))
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ConsentBody {
    #[serde(default)]
    consent_message: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AddSignerBody {
    signer: Signer,
    #[serde(default)]
    consent_message: String,
}

async fn add_signer(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Json(body): Json<AddSignerBody>,
) -> Result<Json<OperationCreated>, ApiError> {
    let mut wallet = state.wallet.lock().await;
    let operation_id = wallet
        .signer_add(&caller, body.signer, body.consent_message)
        .await?;
    state.persist(&wallet)?;
    Ok(Json(OperationCreated { operation_id }))
}

async fn remove_signer(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Path(signer_id): Path<String>,
    Json(body): Json<ConsentBody>,
) -> Result<Json<OperationCreated>, ApiError> {
    let mut wallet = state.wallet.lock().await;
    let operation_id = wallet
        .signer_remove(&caller, SignerId::from(signer_id), body.consent_message)
        .await?;
    state.persist(&wallet)?;
    Ok(Json(OperationCreated { operation_id }))
}

#[derive(Debug, Clone, Serialize)]
struct SignerValidity {
    signer_id: SignerId,
    valid: bool,
}

async fn validate_signer(
    State(state): State<ServiceState>,
    Path(signer_id): Path<String>,
) -> Json<SignerValidity> {
    let wallet = state.wallet.lock().await;
    let signer_id = SignerId::from(signer_id);
    Json(SignerValidity {
        valid: wallet.validate_signer(&signer_id),
        signer_id,
    })
}

#[derive(Debug, Clone, Deserialize)]
struct AddRoleBody {
    name: String,
    access: AccessLevel,
    #[serde(default = "default_role_threshold")]
    threshold: usize,
    #[serde(default)]
    consent_message: String,
}

fn default_role_threshold() -> usize {
    1
}

async fn add_role(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Json(body): Json<AddRoleBody>,
) -> Result<Json<OperationCreated>, ApiError> {
    let mut wallet = state.wallet.lock().await;
    let operation_id = wallet
        .role_add(
            &caller,
            body.name,
            body.access,
            body.threshold,
            body.consent_message,
        )
        .await?;
    state.persist(&wallet)?;
    Ok(Json(OperationCreated { operation_id }))
}

async fn remove_role(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Path(role_id): Path<String>,
    Json(body): Json<ConsentBody>,
) -> Result<Json<OperationCreated>, ApiError> {
    let mut wallet = state.wallet.lock().await;
    let operation_id = wallet
        .role_remove(&caller, RoleId::new(role_id), body.consent_message)
        .await?;
    state.persist(&wallet)?;
    Ok(Json(OperationCreated { operation_id }))
}

async fn get_account(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Path(account_id): Path<String>,
) -> Result<Json<WalletAccount>, ApiError> {
    let wallet = state.wallet.lock().await;
    Ok(Json(wallet.account(&caller, &AccountId::new(account_id))?))
}

#[derive(Debug, Clone, Serialize)]
struct BalanceResponse {
    chain: ChainType,
    balance: u128,
}

async fn account_balance(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Path((account_id, chain)): Path<(String, String)>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let chain = parse_chain(&chain)?;
    let wallet = state.wallet.lock().await;
    let balance = wallet.account_balance(&caller, &AccountId::new(account_id), &chain)?;
    Ok(Json(BalanceResponse { chain, balance }))
}

async fn create_address(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Path((account_id, chain)): Path<(String, String)>,
    Json(body): Json<ConsentBody>,
) -> Result<Json<OperationCreated>, ApiError> {
    let chain = parse_chain(&chain)?;
    let mut wallet = state.wallet.lock().await;
    let operation_id = wallet
        .account_create_address(&caller, AccountId::new(account_id), chain, body.consent_message)
        .await?;
    state.persist(&wallet)?;
    Ok(Json(OperationCreated { operation_id }))
}

async fn remove_address(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Path((account_id, chain)): Path<(String, String)>,
    Json(body): Json<ConsentBody>,
) -> Result<Json<OperationCreated>, ApiError> {
    let chain = parse_chain(&chain)?;
    let mut wallet = state.wallet.lock().await;
    let operation_id = wallet
        .account_remove_address(&caller, AccountId::new(account_id), chain, body.consent_message)
        .await?;
    state.persist(&wallet)?;
    Ok(Json(OperationCreated { operation_id }))
}

#[derive(Debug, Clone, Serialize)]
struct PendingCount {
    pendings: usize,
}

async fn add_pending(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Path((account_id, chain)): Path<(String, String)>,
    Json(entry): Json<PendingEntry>,
) -> Result<Json<PendingCount>, ApiError> {
    let chain = parse_chain(&chain)?;
    let mut wallet = state.wallet.lock().await;
    let pendings = wallet.account_add_pending(&caller, &AccountId::new(account_id), &chain, entry)?;
    state.persist(&wallet)?;
    Ok(Json(PendingCount { pendings }))
}

async fn remove_pending(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Path((account_id, chain, index)): Path<(String, String, usize)>,
) -> Result<Json<PendingEntry>, ApiError> {
    let chain = parse_chain(&chain)?;
    let mut wallet = state.wallet.lock().await;
    let removed =
        wallet.account_remove_pending(&caller, &AccountId::new(account_id), &chain, index)?;
    state.persist(&wallet)?;
    Ok(Json(removed))
}

async fn check_pending(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Path((account_id, chain)): Path<(String, String)>,
) -> Result<Json<PendingReport>, ApiError> {
    let chain = parse_chain(&chain)?;
    let mut wallet = state.wallet.lock().await;
    let report = wallet
        .account_check_pending(&caller, &AccountId::new(account_id), &chain)
        .await?;
    state.persist(&wallet)?;
    Ok(Json(report))
}

async fn sync_balance(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Path((account_id, chain)): Path<(String, String)>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let chain = parse_chain(&chain)?;
    let mut wallet = state.wallet.lock().await;
    let balance = wallet
        .account_sync_balance(&caller, &AccountId::new(account_id), &chain)
        .await?;
    state.persist(&wallet)?;
    Ok(Json(BalanceResponse { chain, balance }))
}

async fn update_balance(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Path(account_id): Path<String>,
) -> Result<Json<PendingReport>, ApiError> {
    let mut wallet = state.wallet.lock().await;
    let report = wallet
        .account_update_balance(&caller, &AccountId::new(account_id))
        .await?;
    state.persist(&wallet)?;
    Ok(Json(report))
}

async fn retrieve_btc_status(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Path((account_id, block_index)): Path<(String, u64)>,
) -> Result<Json<RetrieveBtcStatus>, ApiError> {
    let mut wallet = state.wallet.lock().await;
    let status = wallet
        .retrieve_btc_status(&caller, &AccountId::new(account_id), block_index)
        .await?;
    state.persist(&wallet)?;
    Ok(Json(status))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSize {
    pub size: usize,
}

async fn load_chunk(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    chunk: Bytes,
) -> Result<Json<UploadSize>, ApiError> {
    let mut wallet = state.wallet.lock().await;
    let size = wallet.load_wasm(&caller, &chunk)?;
    Ok(Json(UploadSize { size }))
}

async fn unload_chunks(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
) -> Result<Json<UploadSize>, ApiError> {
    let mut wallet = state.wallet.lock().await;
    let size = wallet.unload_wasm(&caller)?;
    Ok(Json(UploadSize { size }))
}

#[derive(Debug, Clone, Serialize)]
struct CodeHash {
    hash: String,
    size: usize,
}

async fn code_hash(State(state): State<ServiceState>) -> Json<CodeHash> {
    let wallet = state.wallet.lock().await;
    Json(CodeHash {
        hash: wallet.wasm_hash_string(),
        size: wallet.wasm_len(),
    })
}

#[derive(Debug, Clone, Deserialize)]
struct UpgradeBody {
    version: String,
    #[serde(default)]
    consent_message: String,
}

async fn upgrade(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Json(body): Json<UpgradeBody>,
) -> Result<Json<OperationCreated>, ApiError> {
    let mut wallet = state.wallet.lock().await;
    let operation_id = wallet
        .upgrade(&caller, body.version, body.consent_message)
        .await?;
    state.persist(&wallet)?;
    Ok(Json(OperationCreated { operation_id }))
}
