use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::engine::session::TrackingSessions;
use crate::error::AppError;
use crate::models::coordinate::{Coordinate, OperatorId};
use crate::models::duty::{Duty, DutyState};
use crate::observability::metrics::Metrics;
use crate::store::DutyStore;

/// Idle -> Active -> Completed, one duty per operator per UTC day.
///
/// Transitions for the same operator are serialized; the store is always
/// written before the tracking side effect, so a store failure leaves both
/// the duty and tracking exactly as they were.
pub struct DutyStateMachine {
    store: Arc<dyn DutyStore>,
    sessions: Arc<TrackingSessions>,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
    locks: DashMap<OperatorId, Arc<Mutex<()>>>,
}

impl DutyStateMachine {
    pub fn new(
        store: Arc<dyn DutyStore>,
        sessions: Arc<TrackingSessions>,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            sessions,
            clock,
            metrics,
            locks: DashMap::new(),
        }
    }

    pub async fn start_duty(
        &self,
        operator_id: &OperatorId,
        coordinate: Coordinate,
    ) -> Result<Duty, AppError> {
        coordinate.validate()?;
        let _guard = self.lock(operator_id).await;

        let today = self.clock.today();
        if let Some(existing) = self.store.get_duty(operator_id, today)? {
            return Err(match existing.state() {
                DutyState::Active => AppError::AlreadyActive,
                DutyState::Completed | DutyState::Idle => AppError::DutyCompleted,
            });
        }

        let duty = self
            .store
            .create_duty(operator_id, today, self.clock.now(), coordinate)?;
        self.metrics.record_transition("start");
        info!(operator_id = %operator_id, duty_id = %duty.id, "duty started");

        self.arm(operator_id, coordinate);
        Ok(duty)
    }

    pub async fn end_duty(
        &self,
        operator_id: &OperatorId,
        coordinate: Coordinate,
    ) -> Result<Duty, AppError> {
        coordinate.validate()?;
        let _guard = self.lock(operator_id).await;

        let Some(duty) = self
            .store
            .get_duty(operator_id, self.clock.today())?
            .filter(Duty::is_active)
        else {
            self.release_orphaned(operator_id);
            return Err(AppError::NoActiveDuty);
        };

        let now = self.clock.now();
        let end_time = duty.start_time.map_or(now, |start| now.max(start));

        let (ended, _summary) = self
            .sessions
            .finish_with(operator_id, duty.distance_km, |distance_km| {
                self.store
                    .update_duty_end(duty.id, end_time, coordinate, distance_km)
            })
            .inspect_err(|err| {
                warn!(operator_id = %operator_id, error = %err, "failed to end duty; still active");
            })?;

        self.metrics.record_transition("end");
        info!(
            operator_id = %operator_id,
            duty_id = %ended.id,
            distance_km = ended.distance_km,
            "duty ended"
        );

        Ok(ended)
    }

    /// Today's duty row in whatever state it is in.
    pub fn current_duty(&self, operator_id: &OperatorId) -> Result<Option<Duty>, AppError> {
        Ok(self.store.get_duty(operator_id, self.clock.today())?)
    }

    /// Re-arms tracking for an Active duty that has no running session, e.g.
    /// after a client reload or a service restart. Returns the Active duty, if
    /// there is one.
    pub async fn resume(&self, operator_id: &OperatorId) -> Result<Option<Duty>, AppError> {
        let _guard = self.lock(operator_id).await;

        let Some(duty) = self.current_duty(operator_id)?.filter(Duty::is_active) else {
            self.release_orphaned(operator_id);
            return Ok(None);
        };

        if !self.sessions.is_tracking(operator_id) {
            match self.sessions.start(operator_id, duty.start_position) {
                Ok(()) | Err(AppError::AlreadyTracking) => {
                    self.metrics.record_transition("resume");
                    info!(operator_id = %operator_id, duty_id = %duty.id, "tracking resumed");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(Some(duty))
    }

    /// `resume` followed by today's row. A tracking failure is logged, not
    /// returned: the duty stays readable while the sensor is unavailable.
    pub async fn refresh(&self, operator_id: &OperatorId) -> Result<Option<Duty>, AppError> {
        match self.resume(operator_id).await {
            Ok(_) => {}
            Err(AppError::LocationUnavailable(reason)) => {
                warn!(operator_id = %operator_id, reason = %reason, "duty active without live tracking");
            }
            Err(err) => return Err(err),
        }
        self.current_duty(operator_id)
    }

    /// Resumes every Active duty for today. Returns how many are tracking.
    pub async fn resume_all(&self) -> Result<usize, AppError> {
        let active = self.store.active_duties(self.clock.today())?;
        let mut resumed = 0;

        for duty in active {
            match self.resume(&duty.operator_id).await {
                Ok(Some(_)) => resumed += 1,
                Ok(None) => {}
                Err(err) => {
                    warn!(operator_id = %duty.operator_id, error = %err, "could not resume tracking");
                }
            }
        }

        Ok(resumed)
    }

    /// Tracking only runs for today's Active duty. A duty left open past
    /// midnight is no longer today's, so its session and live entry go.
    fn release_orphaned(&self, operator_id: &OperatorId) {
        if self.sessions.is_tracking(operator_id) {
            warn!(operator_id = %operator_id, "stopping tracking with no active duty today");
        }
        self.sessions.stop(operator_id);
    }

    fn arm(&self, operator_id: &OperatorId, origin: Coordinate) {
        let result = match self.sessions.start(operator_id, Some(origin)) {
            Err(AppError::AlreadyTracking) => {
                // Left over from an earlier duty that never ended cleanly.
                warn!(operator_id = %operator_id, "replacing stale tracking session");
                self.sessions.stop(operator_id);
                self.sessions.start(operator_id, Some(origin))
            }
            other => other,
        };

        if let Err(err) = result {
            warn!(operator_id = %operator_id, error = %err, "duty active without live tracking");
        }
    }

    async fn lock(&self, operator_id: &OperatorId) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(operator_id.clone())
            .or_default()
            .value()
            .clone();
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
    use uuid::Uuid;

    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::{ChangeFeed, LiveLocationRegistry};
    use crate::source::{ChannelPositionSource, PositionSource, PositionStream, SensorError};
    use crate::store::{InMemoryDutyStore, StoreError};

    /// Wraps the in-memory store with a switch that makes writes fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryDutyStore,
        down: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection refused".to_string()));
            }
            Ok(())
        }
    }

    impl DutyStore for FlakyStore {
        fn get_duty(&self, operator_id: &OperatorId, date: NaiveDate) -> Result<Option<Duty>, StoreError> {
            self.inner.get_duty(operator_id, date)
        }

        fn create_duty(
            &self,
            operator_id: &OperatorId,
            date: NaiveDate,
            start_time: DateTime<Utc>,
            start_position: Coordinate,
        ) -> Result<Duty, StoreError> {
            self.check()?;
            self.inner.create_duty(operator_id, date, start_time, start_position)
        }

        fn update_duty_end(
            &self,
            duty_id: Uuid,
            end_time: DateTime<Utc>,
            end_position: Coordinate,
            distance_km: f64,
        ) -> Result<Duty, StoreError> {
            self.check()?;
            self.inner.update_duty_end(duty_id, end_time, end_position, distance_km)
        }

        fn active_duties(&self, date: NaiveDate) -> Result<Vec<Duty>, StoreError> {
            self.inner.active_duties(date)
        }
    }

    struct Harness {
        store: Arc<FlakyStore>,
        clock: Arc<ManualClock>,
        registry: Arc<LiveLocationRegistry>,
        sessions: Arc<TrackingSessions>,
        machine: DutyStateMachine,
    }

    struct DeniedSource;

    impl PositionSource for DeniedSource {
        fn watch(&self, _operator_id: &OperatorId) -> Result<PositionStream, SensorError> {
            Err(SensorError::PermissionDenied("user denied geolocation".to_string()))
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(ChannelPositionSource::new(16)), 8)
    }

    fn harness_with(source: Arc<dyn PositionSource>, start_hour: u32) -> Harness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, start_hour, 0, 0).unwrap(),
        ));
        let store = Arc::new(FlakyStore::default());
        let metrics = Metrics::new();
        let registry = Arc::new(LiveLocationRegistry::new(ChangeFeed::new(64), clock.clone()));
        let sessions = Arc::new(TrackingSessions::new(
            source,
            registry.clone(),
            clock.clone(),
            metrics.clone(),
        ));
        let machine = DutyStateMachine::new(store.clone(), sessions.clone(), clock.clone(), metrics);
        Harness {
            store,
            clock,
            registry,
            sessions,
            machine,
        }
    }

    fn op(id: &str) -> OperatorId {
        OperatorId::new(id).unwrap()
    }

    fn here() -> Coordinate {
        Coordinate::new(19.07, 72.87).unwrap()
    }

    #[tokio::test]
    async fn start_creates_active_duty_and_arms_tracking() {
        let h = harness();
        let duty = h.machine.start_duty(&op("a"), here()).await.unwrap();

        assert_eq!(duty.state(), DutyState::Active);
        assert_eq!(duty.start_position, Some(here()));
        assert_eq!(duty.start_time, Some(h.clock.now()));
        assert!(h.sessions.is_tracking(&op("a")));
    }

    #[tokio::test]
    async fn double_start_fails_without_changing_state() {
        let h = harness();
        let first = h.machine.start_duty(&op("a"), here()).await.unwrap();

        let err = h
            .machine
            .start_duty(&op("a"), Coordinate::new(1.0, 1.0).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AlreadyActive));

        let current = h.machine.current_duty(&op("a")).unwrap().unwrap();
        assert_eq!(current.id, first.id);
        assert_eq!(current.start_position, Some(here()));
        assert_eq!(h.store.inner.len(), 1);
    }

    #[tokio::test]
    async fn end_without_active_duty_fails() {
        let h = harness();
        let err = h.machine.end_duty(&op("a"), here()).await.unwrap_err();
        assert!(matches!(err, AppError::NoActiveDuty));
    }

    #[tokio::test]
    async fn end_completes_duty_and_stops_tracking() {
        let h = harness();
        h.machine.start_duty(&op("a"), here()).await.unwrap();
        h.registry.upsert(&op("a"), here());
        h.clock.advance(Duration::hours(8));

        let end = Coordinate::new(19.10, 72.87).unwrap();
        let duty = h.machine.end_duty(&op("a"), end).await.unwrap();

        assert_eq!(duty.state(), DutyState::Completed);
        assert_eq!(duty.end_position, Some(end));
        assert!(duty.end_time >= duty.start_time);
        assert!(!h.sessions.is_tracking(&op("a")));
        assert!(h.registry.get(&op("a")).is_none());
    }

    #[tokio::test]
    async fn restart_on_completed_day_is_rejected_until_tomorrow() {
        let h = harness();
        h.machine.start_duty(&op("a"), here()).await.unwrap();
        h.machine.end_duty(&op("a"), here()).await.unwrap();

        let err = h.machine.start_duty(&op("a"), here()).await.unwrap_err();
        assert!(matches!(err, AppError::DutyCompleted));

        h.clock.advance(Duration::days(1));
        assert!(h.machine.current_duty(&op("a")).unwrap().is_none());
        h.machine.start_duty(&op("a"), here()).await.unwrap();
    }

    #[tokio::test]
    async fn store_failure_on_start_leaves_operator_idle() {
        let h = harness();
        h.store.down.store(true, Ordering::SeqCst);

        let err = h.machine.start_duty(&op("a"), here()).await.unwrap_err();
        assert!(matches!(err, AppError::StoreUnavailable(_)));
        assert!(h.machine.current_duty(&op("a")).unwrap().is_none());
        assert!(!h.sessions.is_tracking(&op("a")));
    }

    #[tokio::test]
    async fn store_failure_on_end_keeps_duty_active_and_tracking() {
        let h = harness();
        h.machine.start_duty(&op("a"), here()).await.unwrap();
        h.registry.upsert(&op("a"), here());
        h.store.down.store(true, Ordering::SeqCst);

        let err = h.machine.end_duty(&op("a"), here()).await.unwrap_err();
        assert!(matches!(err, AppError::StoreUnavailable(_)));

        assert!(h.machine.current_duty(&op("a")).unwrap().unwrap().is_active());
        assert!(h.sessions.is_tracking(&op("a")));
        assert!(h.registry.get(&op("a")).is_some());

        h.store.down.store(false, Ordering::SeqCst);
        h.machine.end_duty(&op("a"), here()).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_coordinate_is_rejected_before_any_transition() {
        let h = harness();
        let bad = Coordinate { lat: 91.0, lng: 0.0 };

        let err = h.machine.start_duty(&op("a"), bad).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidCoordinate(_)));
        assert!(h.machine.current_duty(&op("a")).unwrap().is_none());
    }

    #[tokio::test]
    async fn resume_rearms_tracking_for_active_duty() {
        let h = harness();
        h.machine.start_duty(&op("a"), here()).await.unwrap();
        h.sessions.stop(&op("a"));

        let resumed = h.machine.resume(&op("a")).await.unwrap();
        assert!(resumed.is_some());
        assert!(h.sessions.is_tracking(&op("a")));
        assert_eq!(h.sessions.route(&op("a")).unwrap(), vec![here()]);

        // Already tracking: no-op.
        assert!(h.machine.resume(&op("a")).await.unwrap().is_some());
        assert_eq!(h.sessions.active_count(), 1);
    }

    #[tokio::test]
    async fn resume_all_picks_up_every_active_duty() {
        let h = harness();
        h.machine.start_duty(&op("a"), here()).await.unwrap();
        h.machine.start_duty(&op("b"), here()).await.unwrap();
        h.machine.start_duty(&op("c"), here()).await.unwrap();
        h.machine.end_duty(&op("c"), here()).await.unwrap();
        h.sessions.stop_all();

        assert_eq!(h.machine.resume_all().await.unwrap(), 2);
        assert!(h.sessions.is_tracking(&op("a")));
        assert!(h.sessions.is_tracking(&op("b")));
        assert!(!h.sessions.is_tracking(&op("c")));
    }

    #[tokio::test]
    async fn concurrent_starts_for_one_operator_yield_one_duty() {
        let h = Arc::new(harness());
        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let h = h.clone();
                tokio::spawn(async move { h.machine.start_duty(&op("a"), here()).await })
            })
            .collect();

        let mut ok = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => ok += 1,
                Err(err) => assert!(matches!(err, AppError::AlreadyActive)),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(h.store.active_duties(h.clock.today()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn end_after_midnight_releases_tracking() {
        let h = harness_with(Arc::new(ChannelPositionSource::new(16)), 22);
        h.machine.start_duty(&op("a"), here()).await.unwrap();
        h.registry.upsert(&op("a"), here());
        h.clock.advance(Duration::hours(4));

        let err = h.machine.end_duty(&op("a"), here()).await.unwrap_err();
        assert!(matches!(err, AppError::NoActiveDuty));
        assert!(h.machine.current_duty(&op("a")).unwrap().is_none());
        assert!(!h.sessions.is_tracking(&op("a")));
        assert!(h.registry.get(&op("a")).is_none());
    }

    #[tokio::test]
    async fn resume_after_midnight_releases_tracking() {
        let h = harness_with(Arc::new(ChannelPositionSource::new(16)), 23);
        h.machine.start_duty(&op("a"), here()).await.unwrap();
        h.registry.upsert(&op("a"), here());
        h.clock.advance(Duration::hours(2));

        assert!(h.machine.resume(&op("a")).await.unwrap().is_none());
        assert!(!h.sessions.is_tracking(&op("a")));
        assert!(h.registry.is_empty());

        // The new day starts clean.
        h.machine.start_duty(&op("a"), here()).await.unwrap();
        assert!(h.sessions.is_tracking(&op("a")));
    }

    #[tokio::test]
    async fn refresh_returns_active_duty_when_sensor_is_denied() {
        let h = harness_with(Arc::new(DeniedSource), 8);
        let started = h.machine.start_duty(&op("a"), here()).await.unwrap();
        assert!(!h.sessions.is_tracking(&op("a")));

        let err = h.machine.resume(&op("a")).await.unwrap_err();
        assert!(matches!(err, AppError::LocationUnavailable(_)));

        let duty = h.machine.refresh(&op("a")).await.unwrap().unwrap();
        assert_eq!(duty.id, started.id);
        assert!(duty.is_active());
    }

    #[tokio::test]
    async fn ended_duty_records_distance_of_applied_samples() {
        let source = Arc::new(ChannelPositionSource::new(16));
        let h = harness_with(source.clone(), 8);
        let a = op("a");
        h.machine
            .start_duty(&a, Coordinate::new(0.0, 0.0).unwrap())
            .await
            .unwrap();
        for lat in [0.5, 1.0] {
            source
                .push(
                    &a,
                    crate::models::coordinate::PositionSample {
                        coordinate: Coordinate::new(lat, 0.0).unwrap(),
                        recorded_at: h.clock.now(),
                    },
                )
                .await
                .unwrap();
        }
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while h.sessions.status(&a).is_none_or(|s| s.samples_accepted < 2) {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let duty = h.machine.end_duty(&a, Coordinate::new(1.0, 0.0).unwrap()).await.unwrap();
        assert!((duty.distance_km - 111.19).abs() < 0.5);
    }
}
