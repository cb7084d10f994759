//! CleanupHandler - Periodic purge of expired dashboard entries
//!
//! Closed sessions stay visible on the dashboard for the retention period; this task
//! drops them afterwards and keeps the number of closed entries bounded.

use chrono::Utc;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info};

use crate::AppState;

/// Run one purge pass, returning how many entries were dropped
pub fn handle_cleanup(state: &AppState) -> usize {
    let purged = state.stats.purge(Utc::now());
    if purged > 0 {
        info!("Cleanup removed {} closed connection entries", purged);
    } else {
        debug!("Cleanup found nothing to remove");
    }
    purged
}

/// Purge on every cleanup interval until shutdown
pub async fn run_cleanup(state: AppState) {
    let mut shutdown = state.shutdown_signal();
    let mut ticker = interval(state.config.cleanup_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                handle_cleanup(&state);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Cleanup task stopping");
                    return;
                }
            }
        }
    }
}
