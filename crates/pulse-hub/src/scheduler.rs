//! Background loops: periodic dispatch over configured websites and the
//! assignment deadline sweep

use pulse_core::{PulseError, Website};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::hub::Hub;

/// Dispatch one round for every website
pub async fn dispatch_round(hub: &Hub, websites: &[Website]) -> usize {
    let mut dispatched = 0;
    for website in websites {
        match hub.dispatch_assignment(&website.url, &website.id).await {
            Ok(assignments) => dispatched += assignments.len(),
            Err(PulseError::NoValidatorsOnline) => {
                debug!("No validators online; skipping round");
                break;
            }
            Err(e) => warn!("Dispatch of {} failed: {}", website.id, e),
        }
    }
    dispatched
}

/// Spawn the dispatch loop, or nothing if there is nothing to dispatch
pub fn spawn_dispatch_loop(
    hub: Arc<Hub>,
    websites: Vec<Website>,
    interval: Duration,
) -> Option<JoinHandle<()>> {
    if websites.is_empty() || interval.is_zero() {
        info!("Dispatch scheduler disabled");
        return None;
    }

    info!(
        "Dispatching {} website(s) every {:?}",
        websites.len(),
        interval
    );
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            dispatch_round(&hub, &websites).await;
        }
    }))
}

/// Spawn the sweep that expires overdue assignments
pub fn spawn_sweep_loop(hub: Arc<Hub>, interval: Duration) -> JoinHandle<()> {
    let interval = interval.max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let expired = hub.expire_assignments().await;
            if !expired.is_empty() {
                debug!("Sweep expired {} assignment(s)", expired.len());
            }
        }
    })
}
