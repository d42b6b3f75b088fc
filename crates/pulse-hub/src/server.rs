//! Axum server: the agent WebSocket and the settlement/admin HTTP API

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures::{SinkExt, StreamExt};
use pulse_core::{PayoutReceipt, Tick};
use pulse_settlement::{PayoutError, SettlementEngine};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, warn};

use crate::hub::{Hub, ValidatorStatus};

/// Shared application state
pub struct AppState {
    pub hub: Arc<Hub>,
    pub settlement: Arc<SettlementEngine>,
}

pub type SharedState = Arc<AppState>;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/v1/payout/:validator_id", post(payout))
        .route("/api/v1/admin/balance", get(payer_balance))
        .route("/api/v1/validators", get(validators))
        .route("/api/v1/ticks", get(ticks))
        .route("/api/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Settlement failure as `{kind, message}`
pub enum ApiError {
    Payout(PayoutError),
    /// The payout task itself died; its intent is left for reconciliation
    Aborted(String),
}

impl From<PayoutError> for ApiError {
    fn from(e: PayoutError) -> Self {
        Self::Payout(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error = match self {
            Self::Payout(error) => error,
            Self::Aborted(message) => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({
                        "kind": "LedgerInconsistency",
                        "message": message,
                        "moneyMayHaveMoved": true,
                    })),
                )
                    .into_response();
            }
        };
        let status = match &error {
            PayoutError::NotFound(_) => StatusCode::NOT_FOUND,
            PayoutError::NoPendingAmount(_) => StatusCode::CONFLICT,
            PayoutError::TransferFailed { .. } => StatusCode::BAD_GATEWAY,
            PayoutError::LedgerInconsistency { .. } | PayoutError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(json!({
            "kind": error.kind(),
            "message": error.to_string(),
            "moneyMayHaveMoved": error.money_may_have_moved(),
        }));
        (status, body).into_response()
    }
}

/// GET /ws - Agent connection
async fn ws_handler(ws: WebSocketUpgrade, State(app): State<SharedState>) -> Response {
    let hub = app.hub.clone();
    ws.on_upgrade(move |socket| handle_socket(hub, socket))
}

async fn handle_socket(hub: Arc<Hub>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let session_id = hub.register_connection(outbound_tx).await;

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode frame: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => hub.handle_frame(session_id, &text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Session {} transport error: {}", session_id, e);
                break;
            }
        }
    }

    hub.close_connection(session_id).await;
    writer.abort();
}

/// POST /api/v1/payout/:validator_id
///
/// The saga runs on its own task: once the balance is zeroed it must reach
/// an outcome even if the client hangs up.
async fn payout(
    State(app): State<SharedState>,
    Path(validator_id): Path<String>,
) -> Result<Json<PayoutReceipt>, ApiError> {
    let settlement = app.settlement.clone();
    let task = tokio::spawn(async move { settlement.payout(&validator_id).await });
    match task.await {
        Ok(result) => Ok(Json(result?)),
        Err(e) => {
            error!("Payout task failed: {}", e);
            Err(ApiError::Aborted(format!("payout task failed: {}", e)))
        }
    }
}

/// GET /api/v1/admin/balance
async fn payer_balance(State(app): State<SharedState>) -> Response {
    match app.settlement.payer_balance().await {
        Ok(balance) => Json(json!({ "lamports": balance })).into_response(),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "kind": "TransferFailed", "message": e.to_string() })),
        )
            .into_response(),
    }
}

/// GET /api/v1/validators
async fn validators(State(app): State<SharedState>) -> Json<Vec<ValidatorStatus>> {
    Json(app.hub.validators().await)
}

/// GET /api/v1/ticks
async fn ticks(State(app): State<SharedState>) -> Json<Vec<Tick>> {
    Json(app.hub.recent_ticks().await)
}

/// GET /api/health
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "pulse-hub"
    }))
}
