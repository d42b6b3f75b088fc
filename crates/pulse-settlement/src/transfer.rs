//! External transfer backends
//!
//! A transfer is irreversible once it succeeds. Every request carries the
//! payout's idempotency key, and backends must treat a repeated key as the
//! same transfer, so retries and crash recovery can never pay twice.

use async_trait::async_trait;
use pulse_core::config::TransferBackendConfig;
use pulse_core::signer::is_valid_public_key;
use pulse_core::Amount;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::TransferError;

/// One outgoing transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub idempotency_key: String,
    /// Recipient address (the validator's public key)
    pub to: String,
    pub amount: Amount,
}

/// The payer side of the external transfer system
#[async_trait]
pub trait TransferBackend: Send + Sync {
    /// Funds available to the payer
    async fn balance(&self) -> Result<Amount, TransferError>;

    /// Submit a transfer, returning the external reference
    async fn transfer(&self, request: &TransferRequest) -> Result<String, TransferError>;

    /// Reference of a transfer previously made with `idempotency_key`, if any
    async fn find_transfer(&self, idempotency_key: &str) -> Result<Option<String>, TransferError>;
}

/// Build the backend named in configuration
pub fn backend_from_config(
    config: &TransferBackendConfig,
    timeout: Duration,
) -> Result<Arc<dyn TransferBackend>, TransferError> {
    match config {
        TransferBackendConfig::Simulated { balance } => {
            info!("Using simulated transfer backend with balance {}", balance);
            Ok(Arc::new(SimulatedTransfer::new(*balance)))
        }
        TransferBackendConfig::Http { url } => {
            info!("Using HTTP transfer backend at {}", url);
            Ok(Arc::new(HttpTransfer::new(url, timeout)?))
        }
    }
}

#[derive(Default)]
struct SimulatedState {
    balance: Amount,
    transfers: HashMap<String, (TransferRequest, String)>,
    injected: VecDeque<TransferError>,
    total_transferred: Amount,
}

/// In-process payer account
///
/// Failures can be queued with [`SimulatedTransfer::inject_failure`]; each
/// queued error is returned by exactly one subsequent `transfer` call,
/// before any funds move.
pub struct SimulatedTransfer {
    state: Mutex<SimulatedState>,
    delay: Option<Duration>,
}

impl SimulatedTransfer {
    pub fn new(balance: Amount) -> Self {
        Self {
            state: Mutex::new(SimulatedState {
                balance,
                ..Default::default()
            }),
            delay: None,
        }
    }

    /// Delay every transfer by `delay`, to exercise timeouts
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn inject_failure(&self, error: TransferError) {
        self.state.lock().await.injected.push_back(error);
    }

    /// Number of distinct transfers that moved funds
    pub async fn transfer_count(&self) -> usize {
        self.state.lock().await.transfers.len()
    }

    pub async fn total_transferred(&self) -> Amount {
        self.state.lock().await.total_transferred
    }

    /// Record a transfer as already made, as if a crash hid its outcome
    pub async fn seed_transfer(&self, request: TransferRequest, reference: &str) {
        let mut state = self.state.lock().await;
        state.balance = state.balance.saturating_sub(request.amount);
        state.total_transferred = state.total_transferred.saturating_add(request.amount);
        state
            .transfers
            .insert(request.idempotency_key.clone(), (request, reference.to_string()));
    }
}

#[async_trait]
impl TransferBackend for SimulatedTransfer {
    async fn balance(&self) -> Result<Amount, TransferError> {
        Ok(self.state.lock().await.balance)
    }

    async fn transfer(&self, request: &TransferRequest) -> Result<String, TransferError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;

        if let Some((_, reference)) = state.transfers.get(&request.idempotency_key) {
            debug!(
                "Duplicate transfer {} deduplicated to {}",
                request.idempotency_key, reference
            );
            return Ok(reference.clone());
        }

        if let Some(error) = state.injected.pop_front() {
            return Err(error);
        }

        if !is_valid_public_key(&request.to) {
            return Err(TransferError::InvalidAddress(request.to.clone()));
        }

        if state.balance < request.amount {
            return Err(TransferError::InsufficientFunds {
                available: state.balance,
                required: request.amount,
            });
        }

        state.balance -= request.amount;
        state.total_transferred = state.total_transferred.saturating_add(request.amount);
        let reference = format!("sim-{}", uuid::Uuid::new_v4());
        state.transfers.insert(
            request.idempotency_key.clone(),
            (request.clone(), reference.clone()),
        );
        Ok(reference)
    }

    async fn find_transfer(&self, idempotency_key: &str) -> Result<Option<String>, TransferError> {
        Ok(self
            .state
            .lock()
            .await
            .transfers
            .get(idempotency_key)
            .map(|(_, reference)| reference.clone()))
    }
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance: Amount,
}

#[derive(Debug, Deserialize)]
struct TransferResponse {
    reference: String,
}

/// Transfer service spoken to over HTTP
///
/// - `GET {base}/balance` returns `{"balance": n}`
/// - `POST {base}/transfers` with a [`TransferRequest`] returns `{"reference": "..."}`
/// - `GET {base}/transfers/{key}` returns `{"reference": "..."}` or 404
pub struct HttpTransfer {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransfer {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransferError::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, TransferError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = format!("{}: {}", status, body);
        if status.is_client_error() {
            Err(TransferError::Rejected(detail))
        } else {
            Err(TransferError::Network(detail))
        }
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransferError {
    if e.is_timeout() {
        TransferError::Timeout(e.to_string())
    } else if e.is_decode() {
        TransferError::Rejected(format!("Malformed response: {}", e))
    } else {
        TransferError::Network(e.to_string())
    }
}

#[async_trait]
impl TransferBackend for HttpTransfer {
    async fn balance(&self) -> Result<Amount, TransferError> {
        let response = self
            .client
            .get(format!("{}/balance", self.base_url))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let body: BalanceResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(map_reqwest_error)?;
        Ok(body.balance)
    }

    async fn transfer(&self, request: &TransferRequest) -> Result<String, TransferError> {
        let response = self
            .client
            .post(format!("{}/transfers", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        // Past a 2xx status the service has accepted the transfer
        let body: TransferResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| {
                TransferError::Unconfirmed(format!(
                    "unreadable reply to transfer {}: {}",
                    request.idempotency_key, e
                ))
            })?;
        Ok(body.reference)
    }

    async fn find_transfer(&self, idempotency_key: &str) -> Result<Option<String>, TransferError> {
        let response = self
            .client
            .get(format!("{}/transfers/{}", self.base_url, idempotency_key))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: TransferResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(map_reqwest_error)?;
        Ok(Some(body.reference))
    }
}
