use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::engine::duty::DutyStateMachine;
use crate::engine::session::TrackingSessions;
use crate::observability::metrics::Metrics;
use crate::registry::{ChangeFeed, LiveLocationRegistry};
use crate::source::ChannelPositionSource;
use crate::store::{DutyStore, InMemoryDutyStore};

pub struct AppState {
    pub duties: DutyStateMachine,
    pub sessions: Arc<TrackingSessions>,
    pub registry: Arc<LiveLocationRegistry>,
    pub positions: Arc<ChannelPositionSource>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        Self::with_parts(config, Arc::new(InMemoryDutyStore::new()), Arc::new(SystemClock))
    }

    pub fn with_parts(config: &Config, store: Arc<dyn DutyStore>, clock: Arc<dyn Clock>) -> Self {
        let metrics = Metrics::new();
        let registry = Arc::new(LiveLocationRegistry::new(
            ChangeFeed::new(config.event_buffer_size),
            clock.clone(),
        ));
        let positions = Arc::new(ChannelPositionSource::new(config.sample_buffer_size));
        let sessions = Arc::new(TrackingSessions::new(
            positions.clone(),
            registry.clone(),
            clock.clone(),
            metrics.clone(),
        ));
        let duties = DutyStateMachine::new(store, sessions.clone(), clock.clone(), metrics.clone());

        Self {
            duties,
            sessions,
            registry,
            positions,
            clock,
            metrics,
        }
    }
}
