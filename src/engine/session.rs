use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::AppError;
use crate::geo::DistanceAccumulator;
use crate::models::coordinate::{Coordinate, OperatorId, PositionSample};
use crate::observability::metrics::Metrics;
use crate::registry::LiveLocationRegistry;
use crate::source::{PositionSource, PositionStream, SensorError};

#[derive(Debug, Clone, Serialize)]
pub struct TrackingStatus {
    pub operator_id: OperatorId,
    pub started_at: DateTime<Utc>,
    pub distance_km: f64,
    pub samples_accepted: u64,
    pub samples_rejected: u64,
    pub last_coordinate: Option<Coordinate>,
    pub last_sample_at: Option<DateTime<Utc>>,
    pub location_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub operator_id: OperatorId,
    pub distance_km: f64,
    pub samples_accepted: u64,
    pub samples_rejected: u64,
}

#[derive(Default)]
struct Progress {
    accumulator: DistanceAccumulator,
    route: Vec<Coordinate>,
    samples_accepted: u64,
    samples_rejected: u64,
    last_sample_at: Option<DateTime<Utc>>,
    location_error: Option<String>,
}

/// State shared between an armed session's handle and its sampling task.
struct Shared {
    operator_id: OperatorId,
    armed: AtomicBool,
    progress: Mutex<Progress>,
}

impl Shared {
    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct ArmedSession {
    shared: Arc<Shared>,
    started_at: DateTime<Utc>,
    task: JoinHandle<()>,
}

/// One sampling task per tracked operator.
///
/// The armed flag is only read and cleared while holding the session's
/// progress lock, and every registry upsert happens under that same lock, so
/// once `stop` has returned no late sample can resurrect the registry entry.
pub struct TrackingSessions {
    sessions: DashMap<OperatorId, ArmedSession>,
    source: Arc<dyn PositionSource>,
    registry: Arc<LiveLocationRegistry>,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
}

impl TrackingSessions {
    pub fn new(
        source: Arc<dyn PositionSource>,
        registry: Arc<LiveLocationRegistry>,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            source,
            registry,
            clock,
            metrics,
        }
    }

    /// Arms tracking for `operator_id`. `origin` seeds the distance
    /// accumulator and route so the first delivered sample already counts.
    /// Must be called from within a tokio runtime.
    pub fn start(&self, operator_id: &OperatorId, origin: Option<Coordinate>) -> Result<(), AppError> {
        let slot = match self.sessions.entry(operator_id.clone()) {
            Entry::Occupied(_) => return Err(AppError::AlreadyTracking),
            Entry::Vacant(slot) => slot,
        };

        let stream = self.source.watch(operator_id).map_err(|err| {
            warn!(operator_id = %operator_id, error = %err, "position source unavailable");
            AppError::LocationUnavailable(err.to_string())
        })?;

        let mut progress = Progress::default();
        if let Some(origin) = origin {
            progress.accumulator.add_sample(origin);
            progress.route.push(origin);
        }

        let shared = Arc::new(Shared {
            operator_id: operator_id.clone(),
            armed: AtomicBool::new(true),
            progress: Mutex::new(progress),
        });

        let task = tokio::spawn(run_sampling(
            shared.clone(),
            stream,
            self.registry.clone(),
            self.metrics.clone(),
        ));

        slot.insert(ArmedSession {
            shared,
            started_at: self.clock.now(),
            task,
        });
        self.metrics.tracking_sessions_active.inc();

        info!(operator_id = %operator_id, seeded = origin.is_some(), "tracking started");
        Ok(())
    }

    /// Disarms, cancels the sampling task and drops the operator's registry
    /// entry. Safe to call when nothing is armed.
    pub fn stop(&self, operator_id: &OperatorId) -> Option<SessionSummary> {
        let summary = self.sessions.remove(operator_id).map(|(_, session)| {
            let summary = {
                let progress = session.shared.progress();
                session.shared.armed.store(false, Ordering::Release);
                SessionSummary {
                    operator_id: operator_id.clone(),
                    distance_km: progress.accumulator.total_km(),
                    samples_accepted: progress.samples_accepted,
                    samples_rejected: progress.samples_rejected,
                }
            };
            session.task.abort();
            self.metrics.tracking_sessions_active.dec();
            summary
        });

        self.source.release(operator_id);
        self.registry.remove(operator_id);
        self.metrics.live_locations.set(self.registry.len() as i64);

        match &summary {
            Some(summary) => info!(
                operator_id = %operator_id,
                distance_km = summary.distance_km,
                samples = summary.samples_accepted,
                "tracking stopped"
            ),
            None => debug!(operator_id = %operator_id, "stop requested with no armed session"),
        }

        summary
    }

    /// Runs `write` with the session's final distance while sampling is held
    /// off, then stops the session if the write succeeded. Without an armed
    /// session `write` gets `fallback_km`. On error the session keeps running.
    pub fn finish_with<T, E>(
        &self,
        operator_id: &OperatorId,
        fallback_km: f64,
        write: impl FnOnce(f64) -> Result<T, E>,
    ) -> Result<(T, Option<SessionSummary>), E> {
        let shared = self
            .sessions
            .get(operator_id)
            .map(|session| session.shared.clone());

        let written = match shared {
            Some(shared) => {
                let progress = shared.progress();
                let written = write(progress.accumulator.total_km())?;
                shared.armed.store(false, Ordering::Release);
                written
            }
            None => write(fallback_km)?,
        };

        Ok((written, self.stop(operator_id)))
    }

    pub fn is_tracking(&self, operator_id: &OperatorId) -> bool {
        self.sessions.contains_key(operator_id)
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn distance_km(&self, operator_id: &OperatorId) -> Option<f64> {
        self.sessions
            .get(operator_id)
            .map(|session| session.shared.progress().accumulator.total_km())
    }

    pub fn status(&self, operator_id: &OperatorId) -> Option<TrackingStatus> {
        self.sessions.get(operator_id).map(|session| {
            let progress = session.shared.progress();
            TrackingStatus {
                operator_id: operator_id.clone(),
                started_at: session.started_at,
                distance_km: progress.accumulator.total_km(),
                samples_accepted: progress.samples_accepted,
                samples_rejected: progress.samples_rejected,
                last_coordinate: progress.accumulator.last(),
                last_sample_at: progress.last_sample_at,
                location_error: progress.location_error.clone(),
            }
        })
    }

    pub fn route(&self, operator_id: &OperatorId) -> Option<Vec<Coordinate>> {
        self.sessions
            .get(operator_id)
            .map(|session| session.shared.progress().route.clone())
    }

    /// Stops every session, used on shutdown.
    pub fn stop_all(&self) -> usize {
        let operators: Vec<OperatorId> = self
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for operator_id in &operators {
            self.stop(operator_id);
        }
        operators.len()
    }
}

async fn run_sampling(
    shared: Arc<Shared>,
    mut stream: PositionStream,
    registry: Arc<LiveLocationRegistry>,
    metrics: Metrics,
) {
    // Items are handled one at a time, so samples are applied in arrival order.
    while let Some(delivery) = stream.next().await {
        match delivery {
            Ok(sample) => apply_sample(&shared, sample, &registry, &metrics),
            Err(err) => record_sensor_error(&shared, err, &metrics),
        }
    }

    let mut progress = shared.progress();
    if shared.armed.load(Ordering::Acquire) {
        progress.location_error = Some("position stream ended".to_string());
        warn!(operator_id = %shared.operator_id, "position stream ended while armed");
    }
}

fn apply_sample(
    shared: &Shared,
    sample: PositionSample,
    registry: &LiveLocationRegistry,
    metrics: &Metrics,
) {
    let started = Instant::now();
    let mut progress = shared.progress();

    if !shared.armed.load(Ordering::Acquire) {
        metrics.record_sample("dropped");
        return;
    }

    if let Err(err) = sample.coordinate.validate() {
        progress.samples_rejected += 1;
        metrics.record_sample("rejected");
        warn!(operator_id = %shared.operator_id, error = %err, "sample rejected");
        return;
    }

    let total_km = progress.accumulator.add_sample(sample.coordinate);
    progress.route.push(sample.coordinate);
    progress.samples_accepted += 1;
    progress.last_sample_at = Some(sample.recorded_at);
    if progress.location_error.take().is_some() {
        info!(operator_id = %shared.operator_id, "location recovered");
    }

    registry.upsert(&shared.operator_id, sample.coordinate);
    drop(progress);

    metrics.live_locations.set(registry.len() as i64);
    metrics.record_sample("accepted");
    metrics
        .sample_processing_seconds
        .observe(started.elapsed().as_secs_f64());

    debug!(
        operator_id = %shared.operator_id,
        lat = sample.coordinate.lat,
        lng = sample.coordinate.lng,
        total_km,
        "sample applied"
    );
}

fn record_sensor_error(shared: &Shared, err: SensorError, metrics: &Metrics) {
    let mut progress = shared.progress();
    if !shared.armed.load(Ordering::Acquire) {
        return;
    }

    metrics.record_sample("sensor_error");
    warn!(operator_id = %shared.operator_id, error = %err, "location unavailable");
    progress.location_error = Some(AppError::LocationUnavailable(err.to_string()).to_string());
}
