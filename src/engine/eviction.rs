use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::state::AppState;

/// Periodically drops live locations that stopped refreshing, e.g. when a
/// device went dark mid-duty without ending it. Armed sessions are left
/// alone; their next sample re-inserts the entry.
pub async fn run_stale_eviction(state: Arc<AppState>, interval: Duration, max_age: Duration) {
    let max_age = match chrono::Duration::from_std(max_age) {
        Ok(max_age) => max_age,
        Err(err) => {
            warn!(error = %err, "invalid stale age; eviction disabled");
            return;
        }
    };

    info!(
        interval_secs = interval.as_secs(),
        max_age_secs = max_age.num_seconds(),
        "stale location eviction started"
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        evict_once(&state, max_age);
    }
}

pub fn evict_once(state: &AppState, max_age: chrono::Duration) -> usize {
    let evicted = state.registry.evict_stale(max_age);
    if !evicted.is_empty() {
        state.metrics.live_locations.set(state.registry.len() as i64);
        for operator_id in &evicted {
            warn!(
                operator_id = %operator_id,
                tracking = state.sessions.is_tracking(operator_id),
                "evicted stale live location"
            );
        }
    }
    evicted.len()
}
