//! Upkeep keeper: polls the upkeep predicate and triggers settlement.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::service::RaffleService;

/// Poll forever, one [`tick`] per `poll_interval`.
pub async fn run_keeper(service: Arc<RaffleService>, poll_interval: Duration) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(poll_ms = poll_interval.as_millis() as u64, "Keeper started");
    loop {
        ticker.tick().await;
        tick(&service).await;
    }
}

/// Run one keeper pass. Returns the request id when settlement was started.
pub async fn tick(service: &RaffleService) -> Option<u64> {
    let check = service.check_upkeep();
    if check.needed {
        return match service.perform_upkeep(&[]).await {
            Ok(request_id) => Some(request_id),
            Err(e) => {
                warn!(error = %e, "Upkeep failed, will retry next tick");
                None
            }
        };
    }

    if let Some(stale) = service.stale_request() {
        warn!(
            request_id = stale.request_id,
            elapsed_secs = stale.elapsed,
            "Randomness request is stale; POST /admin/rerequest to replace it"
        );
    } else {
        debug!(
            state = check.diagnostics.state.as_str(),
            elapsed = check.diagnostics.elapsed,
            players = check.diagnostics.player_count,
            "Upkeep not needed"
        );
    }
    None
}
