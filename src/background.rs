//! Periodic housekeeping: channel TTL sweeps and cursor snapshot flushes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::delivery::Callback;
use crate::hub::Hub;

/// Expires items older than their channel's TTL every `period`.
#[instrument(skip_all)]
pub async fn sweep_loop<C: Callback>(hub: Arc<Hub<C>>, period: Duration, shutdown: CancellationToken) {
    info!(?period, "sweep loop started");
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let removed = hub.sweep(Utc::now());
                if removed > 0 {
                    info!(removed, "expired items removed");
                }
            }
        }
    }
    debug!("sweep loop stopped");
}

/// Saves the hub snapshot every `period` if any cursor moved.
#[instrument(skip_all)]
pub async fn flush_loop<C: Callback>(hub: Arc<Hub<C>>, period: Duration, shutdown: CancellationToken) {
    info!(?period, "flush loop started");
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = hub.flush_if_dirty() {
                    error!(error = %e, "snapshot flush failed");
                }
            }
        }
    }
    debug!("flush loop stopped");
}
