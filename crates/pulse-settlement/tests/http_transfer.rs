//! HttpTransfer against a local fixture transfer service
//!
//! - Balance, transfer and lookup round trips
//! - Repeated idempotency keys are answered with the original reference
//! - Server errors are transient and end in a revert after a lookup miss
//! - An accepted transfer with an unreadable reply is confirmed by lookup,
//!   never compensated

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use pulse_core::Signer;
use pulse_settlement::{
    CircuitBreaker, HttpTransfer, Ledger, PayoutError, SettlementEngine, TransferBackend,
    TransferError, TransferPolicy, TransferRequest,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Default)]
struct Fixture {
    balance: u64,
    transfers: HashMap<String, (TransferRequest, String)>,
}

type Shared = Arc<Mutex<Fixture>>;

async fn balance(State(state): State<Shared>) -> Json<Value> {
    Json(json!({ "balance": state.lock().await.balance }))
}

async fn create_transfer(
    State(state): State<Shared>,
    Json(request): Json<TransferRequest>,
) -> (StatusCode, Json<Value>) {
    let mut state = state.lock().await;
    if let Some((_, reference)) = state.transfers.get(&request.idempotency_key) {
        return (StatusCode::OK, Json(json!({ "reference": reference })));
    }
    if state.balance < request.amount {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": "insufficient funds" })),
        );
    }
    state.balance -= request.amount;
    let reference = format!("tx-{}", state.transfers.len() + 1);
    state.transfers.insert(
        request.idempotency_key.clone(),
        (request, reference.clone()),
    );
    (StatusCode::OK, Json(json!({ "reference": reference })))
}

async fn find_transfer(
    State(state): State<Shared>,
    Path(key): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    state
        .lock()
        .await
        .transfers
        .get(&key)
        .map(|(_, reference)| Json(json!({ "reference": reference })))
        .ok_or(StatusCode::NOT_FOUND)
}

/// Applies the transfer like `create_transfer` but answers in a shape the
/// client does not understand
async fn create_transfer_unexpected_body(
    state: State<Shared>,
    request: Json<TransferRequest>,
) -> (StatusCode, Json<Value>) {
    let (status, Json(body)) = create_transfer(state, request).await;
    (status, Json(json!({ "signature": body["reference"] })))
}

/// Helper to serve the fixture on an ephemeral port
///
/// Routes under `/down` fail with 500 to simulate an outage. Routes under
/// `/opaque` move funds but reply to transfers with an unexpected body.
async fn spawn_transfer_service(initial_balance: u64) -> (SocketAddr, Shared) {
    let state: Shared = Arc::new(Mutex::new(Fixture {
        balance: initial_balance,
        ..Default::default()
    }));

    let app = Router::new()
        .route("/balance", get(balance))
        .route("/transfers", post(create_transfer))
        .route("/transfers/:key", get(find_transfer))
        .route("/down/balance", get(balance))
        .route(
            "/down/transfers",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "unavailable") }),
        )
        .route("/opaque/balance", get(balance))
        .route("/opaque/transfers", post(create_transfer_unexpected_body))
        .route("/opaque/transfers/:key", get(find_transfer))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind transfer service");
    let addr = listener.local_addr().expect("transfer service addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, state)
}

#[tokio::test]
async fn test_http_transfer_round_trip() {
    let (addr, state) = spawn_transfer_service(1000).await;
    let backend = HttpTransfer::new(&format!("http://{}/", addr), Duration::from_secs(2)).unwrap();

    assert_eq!(backend.balance().await.unwrap(), 1000);

    let request = TransferRequest {
        idempotency_key: "key-1".to_string(),
        to: Signer::generate().public_key(),
        amount: 250,
    };
    let reference = backend.transfer(&request).await.unwrap();
    assert_eq!(reference, "tx-1");

    // Same key, same transfer
    assert_eq!(backend.transfer(&request).await.unwrap(), "tx-1");
    assert_eq!(state.lock().await.balance, 750);

    assert_eq!(
        backend.find_transfer("key-1").await.unwrap(),
        Some("tx-1".to_string())
    );
    assert_eq!(backend.find_transfer("key-unknown").await.unwrap(), None);
}

#[tokio::test]
async fn test_http_client_errors_are_rejections() {
    let (addr, _state) = spawn_transfer_service(10).await;
    let backend = HttpTransfer::new(&format!("http://{}", addr), Duration::from_secs(2)).unwrap();

    let err = backend
        .transfer(&TransferRequest {
            idempotency_key: "key-1".to_string(),
            to: Signer::generate().public_key(),
            amount: 500,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Rejected(_)));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_engine_pays_through_http_service() {
    let (addr, state) = spawn_transfer_service(1000).await;
    let address = Signer::generate().public_key();

    let ledger = Arc::new(Ledger::in_memory());
    ledger.open_account("v-1", &address).await.unwrap();
    ledger.credit("v-1", 500).await.unwrap();

    let backend = Arc::new(
        HttpTransfer::new(&format!("http://{}", addr), Duration::from_secs(2)).unwrap(),
    );
    let engine = SettlementEngine::new(
        ledger.clone(),
        backend,
        TransferPolicy::default(),
        CircuitBreaker::default(),
    );

    let receipt = engine.payout("v-1").await.unwrap();
    assert_eq!(receipt.amount, 500);
    assert_eq!(receipt.transfer_reference, "tx-1");
    assert_eq!(ledger.pending_amount("v-1").await, Some(0));

    let state = state.lock().await;
    assert_eq!(state.balance, 500);
    let (request, _) = state.transfers.values().next().unwrap();
    assert_eq!(request.to, address);
    assert_eq!(request.amount, 500);
}

#[tokio::test]
async fn test_engine_reverts_when_service_is_down() {
    let (addr, _state) = spawn_transfer_service(1000).await;

    let ledger = Arc::new(Ledger::in_memory());
    ledger
        .open_account("v-1", &Signer::generate().public_key())
        .await
        .unwrap();
    ledger.credit("v-1", 500).await.unwrap();

    let backend = Arc::new(
        HttpTransfer::new(&format!("http://{}/down", addr), Duration::from_secs(2)).unwrap(),
    );
    let engine = SettlementEngine::new(
        ledger.clone(),
        backend,
        TransferPolicy {
            timeout: Duration::from_secs(2),
            max_attempts: 2,
            retry_backoff: Duration::from_millis(10),
        },
        CircuitBreaker::new(5, 60),
    );

    let err = engine.payout("v-1").await.unwrap_err();
    match err {
        PayoutError::TransferFailed { attempted, .. } => assert!(attempted),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(ledger.pending_amount("v-1").await, Some(500));
    assert_eq!(engine.breaker().failure_count(), 2);
}

#[tokio::test]
async fn test_unreadable_transfer_reply_is_unconfirmed() {
    let (addr, state) = spawn_transfer_service(1000).await;
    let backend =
        HttpTransfer::new(&format!("http://{}/opaque", addr), Duration::from_secs(2)).unwrap();

    let err = backend
        .transfer(&TransferRequest {
            idempotency_key: "key-1".to_string(),
            to: Signer::generate().public_key(),
            amount: 100,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Unconfirmed(_)));
    assert!(err.is_transient());
    assert_eq!(state.lock().await.balance, 900);
}

#[tokio::test]
async fn test_accepted_transfer_with_unreadable_reply_completes() {
    let (addr, state) = spawn_transfer_service(1000).await;

    let ledger = Arc::new(Ledger::in_memory());
    ledger
        .open_account("v-1", &Signer::generate().public_key())
        .await
        .unwrap();
    ledger.credit("v-1", 500).await.unwrap();

    let backend = Arc::new(
        HttpTransfer::new(&format!("http://{}/opaque", addr), Duration::from_secs(2)).unwrap(),
    );
    let engine = SettlementEngine::new(
        ledger.clone(),
        backend,
        TransferPolicy {
            timeout: Duration::from_secs(2),
            max_attempts: 2,
            retry_backoff: Duration::from_millis(10),
        },
        CircuitBreaker::new(5, 60),
    );

    let receipt = engine.payout("v-1").await.unwrap();
    assert_eq!(receipt.amount, 500);
    assert_eq!(receipt.transfer_reference, "tx-1");
    assert_eq!(ledger.pending_amount("v-1").await, Some(0));
    assert!(ledger.open_intents().await.is_empty());

    // Retries reused the key, so the payer was charged once
    assert_eq!(state.lock().await.balance, 500);
    assert_eq!(state.lock().await.transfers.len(), 1);
    assert_eq!(engine.breaker().failure_count(), 0);

    let err = engine.payout("v-1").await.unwrap_err();
    assert!(matches!(err, PayoutError::NoPendingAmount(_)));
}
