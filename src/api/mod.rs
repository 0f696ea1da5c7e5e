//! HTTP API for account status, wallet switching and submissions

use crate::account::{AccountSession, ConnectedAccount};
use crate::chain::{CallRequest, ChainClient};
use crate::config::ApiConfig;
use crate::error::{SubmitError, SubmitResult};
use crate::tx::{NonceSnapshot, NoopHooks, SubmitOutcome, TransactionSubmitter};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dashmap::DashMap;
use ethers::types::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info};

/// A wallet the API may switch to
#[derive(Clone)]
pub struct AccountHandle {
    pub address: Address,
    pub chain: Arc<dyn ChainClient>,
}

/// Submitter cached for an action, bound to the account session it signs for
#[derive(Clone)]
pub struct ActionSubmitter {
    pub account: Arc<ConnectedAccount>,
    pub submitter: Arc<TransactionSubmitter>,
}

impl ActionSubmitter {
    fn bind(account: &Arc<ConnectedAccount>, action: &str) -> Self {
        Self {
            account: Arc::clone(account),
            submitter: account.submitter(action),
        }
    }

    fn is_bound_to(&self, account: &Arc<ConnectedAccount>) -> bool {
        Arc::ptr_eq(&self.account, account)
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub session: Arc<AccountSession>,
    /// Configured wallets by name
    pub accounts: Arc<HashMap<String, AccountHandle>>,
    /// Contract aliases
    pub contracts: Arc<HashMap<String, Address>>,
    /// One submitter per action for the connected account
    pub submitters: Arc<DashMap<String, ActionSubmitter>>,
}

impl AppState {
    pub fn new(
        session: Arc<AccountSession>,
        accounts: HashMap<String, AccountHandle>,
        contracts: HashMap<String, Address>,
    ) -> Self {
        Self {
            session,
            accounts: Arc::new(accounts),
            contracts: Arc::new(contracts),
            submitters: Arc::new(DashMap::new()),
        }
    }

    /// Connect a configured wallet by name
    pub fn switch_account(&self, name: &str) -> SubmitResult<Address> {
        let handle = self
            .accounts
            .get(name)
            .ok_or_else(|| SubmitError::Wallet(format!("Unknown account {}", name)))?;

        if self
            .session
            .connect(handle.address, Arc::clone(&handle.chain))
        {
            // Submitters are bound to the old allocator
            self.submitters.clear();
        }
        Ok(handle.address)
    }

    /// Submitter for `action` on the connected account.
    ///
    /// An entry can be left behind by a request that read the session just
    /// before a wallet switch cleared the map; it is rebound here.
    fn submitter_for(&self, action: &str) -> SubmitResult<Arc<TransactionSubmitter>> {
        let account = self.session.current()?;
        let mut cached = self
            .submitters
            .entry(action.to_string())
            .or_insert_with(|| ActionSubmitter::bind(&account, action));

        if !cached.is_bound_to(&account) {
            debug!(
                "Rebinding {} submitter from {:?} to {:?}",
                action, cached.account.address, account.address
            );
            *cached = ActionSubmitter::bind(&account, action);
        }
        Ok(Arc::clone(&cached.submitter))
    }
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/account",
            get(get_account).put(put_account).delete(delete_account),
        )
        .route("/actions/:action", post(submit_action))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> SubmitResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| SubmitError::Config(format!("API bind to {} failed: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| SubmitError::Internal(e.to_string()))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Connected account and its nonce bookkeeping
async fn get_account(State(state): State<AppState>) -> Result<Json<AccountResponse>, ApiError> {
    let account = state.session.current()?;
    Ok(Json(AccountResponse {
        chain_id: account.chain.chain_id(),
        nonce: account.allocator.snapshot(),
        busy_actions: state
            .submitters
            .iter()
            .filter(|entry| entry.is_bound_to(&account) && entry.submitter.is_busy())
            .map(|entry| entry.key().clone())
            .collect(),
    }))
}

async fn put_account(
    State(state): State<AppState>,
    Json(request): Json<SwitchAccountRequest>,
) -> Result<Json<SwitchAccountResponse>, ApiError> {
    let address = state.switch_account(&request.name)?;
    Ok(Json(SwitchAccountResponse {
        name: request.name,
        address,
    }))
}

async fn delete_account(State(state): State<AppState>) -> StatusCode {
    if state.session.disconnect().is_some() {
        state.submitters.clear();
    }
    StatusCode::NO_CONTENT
}

/// Submit a contract call through the action's submitter and wait for it
async fn submit_action(
    State(state): State<AppState>,
    Path(action): Path<String>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let to = *state
        .contracts
        .get(&request.contract)
        .ok_or_else(|| SubmitError::ContractNotFound(request.contract.clone()))?;
    let call = request.into_call(to)?;

    let submitter = state.submitter_for(&action)?;
    let handle = submitter.submit(call, Arc::new(NoopHooks))?;
    let submission_id = handle.id().to_string();
    let outcome = handle.outcome().await?;

    Ok(Json(SubmitResponse::from_outcome(submission_id, &outcome)))
}

// Request / response types

#[derive(Deserialize)]
struct SwitchAccountRequest {
    name: String,
}

#[derive(Deserialize)]
struct SubmitRequest {
    /// Contract alias from configuration
    contract: String,
    /// Hex calldata
    data: String,
    /// Wei, decimal
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    gas_limit: Option<u64>,
}

impl SubmitRequest {
    fn into_call(self, to: Address) -> Result<CallRequest, ApiError> {
        let data = hex::decode(self.data.trim_start_matches("0x"))
            .map_err(|e| ApiError::bad_request(format!("Invalid calldata: {}", e)))?;

        let mut call = CallRequest::new(to, Bytes::from(data));
        if let Some(value) = self.value {
            let value = U256::from_dec_str(&value)
                .map_err(|e| ApiError::bad_request(format!("Invalid value: {}", e)))?;
            call = call.value(value);
        }
        if let Some(gas_limit) = self.gas_limit {
            call = call.gas_limit(U256::from(gas_limit));
        }
        Ok(call)
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct AccountResponse {
    chain_id: u64,
    nonce: NonceSnapshot,
    busy_actions: Vec<String>,
}

#[derive(Serialize)]
struct SwitchAccountResponse {
    name: String,
    address: Address,
}

#[derive(Debug, Serialize, Deserialize)]
struct SubmitResponse {
    submission_id: String,
    status: String,
    nonce: Option<u64>,
    tx_hash: Option<String>,
    block_number: Option<u64>,
    error: Option<String>,
    /// Whether a UI should present the error as a failure
    user_visible: bool,
}

impl SubmitResponse {
    fn from_outcome(submission_id: String, outcome: &SubmitOutcome) -> Self {
        let (status, block_number) = match outcome {
            SubmitOutcome::Confirmed { receipt, .. } => ("confirmed", Some(receipt.block_number)),
            SubmitOutcome::Failed { .. } => ("failed", None),
            SubmitOutcome::RejectedBeforeSend { .. } => ("rejected", None),
        };
        let error = outcome.error();

        Self {
            submission_id,
            status: status.to_string(),
            nonce: outcome.nonce(),
            tx_hash: outcome.tx_hash().map(|h| format!("{:?}", h)),
            block_number,
            error: error.map(|e| e.to_string()),
            user_visible: error.map_or(false, |e| e.is_user_visible()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Error rendered as a JSON body with a status code
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }
}

impl From<SubmitError> for ApiError {
    fn from(error: SubmitError) -> Self {
        let status = match &error {
            SubmitError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            SubmitError::Busy => StatusCode::CONFLICT,
            SubmitError::ContractNotFound(_) => StatusCode::NOT_FOUND,
            SubmitError::Wallet(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}
