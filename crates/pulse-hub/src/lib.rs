//! # pulse-hub
//!
//! Coordinator for the Pulse validator network.
//!
//! - Authenticates agents by Ed25519 signature over their correlation id and
//!   public key, and binds each connection to one validator identity
//! - Dispatches probe assignments round-robin across online validators and
//!   expires those that miss their deadline
//! - Accepts signed reports, records ticks and credits rewards in the ledger
//! - Exposes the settlement entry point and a small admin API over HTTP
//!
//! ## Example
//!
//! ```rust,ignore
//! use pulse_core::PulseConfig;
//!
//! let config = PulseConfig::load_or_default("pulse.toml".as_ref())?;
//! pulse_hub::serve(config, async { let _ = tokio::signal::ctrl_c().await; }).await?;
//! ```

mod assignments;
mod hub;
mod registry;
pub mod scheduler;
pub mod server;
mod sessions;
mod ticks;

pub use hub::{Hub, ValidatorStatus};
pub use registry::{ValidatorRecord, ValidatorRegistry};
pub use server::{router, AppState, SharedState};
pub use sessions::SessionId;

use anyhow::Context;
use pulse_core::PulseConfig;
use pulse_settlement::{Ledger, SettlementEngine};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Open the ledger, settle orphaned payouts and build the hub
pub async fn start(config: &PulseConfig) -> anyhow::Result<SharedState> {
    let ledger = Arc::new(
        Ledger::open(&config.hub.journal_path)
            .await
            .with_context(|| format!("Failed to open ledger at {}", config.hub.journal_path))?,
    );

    let settlement = SettlementEngine::from_config(&config.settlement, ledger.clone())
        .context("Failed to configure transfer backend")?;

    let report = settlement.reconcile().await;
    if !report.completed.is_empty() || !report.reverted.is_empty() {
        info!(
            "Startup reconciliation: {} completed, {} reverted",
            report.completed.len(),
            report.reverted.len()
        );
    }
    for (intent, reason) in &report.unresolved {
        error!(
            "Payout {} for validator {} ({}) is unresolved and needs an operator: {}",
            intent.idempotency_key, intent.validator_id, intent.amount, reason
        );
    }

    let hub = Arc::new(Hub::new(config.hub.clone(), ledger).await);
    Ok(Arc::new(AppState {
        hub,
        settlement: Arc::new(settlement),
    }))
}

/// Serve on an already bound listener until `shutdown` resolves
pub async fn serve_listener<F>(
    listener: TcpListener,
    state: SharedState,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let hub = state.hub.clone();
    let sweep = scheduler::spawn_sweep_loop(hub.clone(), hub.config().sweep_interval());
    let dispatch = scheduler::spawn_dispatch_loop(
        hub.clone(),
        hub.config().websites.clone(),
        hub.config().dispatch_interval(),
    );

    let result = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await;

    sweep.abort();
    if let Some(dispatch) = dispatch {
        dispatch.abort();
    }
    result.context("Hub server failed")
}

/// Run the hub described by `config` until `shutdown` resolves
pub async fn serve<F>(config: PulseConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let state = start(&config).await?;
    let listener = TcpListener::bind(&config.hub.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.hub.bind))?;
    info!("Hub listening on {}", listener.local_addr()?);
    serve_listener(listener, state, shutdown).await
}
