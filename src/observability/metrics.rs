use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub duty_transitions_total: IntCounterVec,
    pub tracking_sessions_active: IntGauge,
    pub location_samples_total: IntCounterVec,
    pub live_locations: IntGauge,
    pub sample_processing_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let duty_transitions_total = IntCounterVec::new(
            Opts::new("duty_transitions_total", "Duty lifecycle transitions by kind"),
            &["transition"],
        )
        .expect("valid duty_transitions_total metric");

        let tracking_sessions_active = IntGauge::new(
            "tracking_sessions_active",
            "Number of armed tracking sessions",
        )
        .expect("valid tracking_sessions_active metric");

        let location_samples_total = IntCounterVec::new(
            Opts::new("location_samples_total", "Position samples by outcome"),
            &["outcome"],
        )
        .expect("valid location_samples_total metric");

        let live_locations = IntGauge::new(
            "live_locations",
            "Entries currently held in the live location registry",
        )
        .expect("valid live_locations metric");

        let sample_processing_seconds = Histogram::with_opts(HistogramOpts::new(
            "sample_processing_seconds",
            "Time spent applying one accepted position sample",
        ))
        .expect("valid sample_processing_seconds metric");

        registry
            .register(Box::new(duty_transitions_total.clone()))
            .expect("register duty_transitions_total");
        registry
            .register(Box::new(tracking_sessions_active.clone()))
            .expect("register tracking_sessions_active");
        registry
            .register(Box::new(location_samples_total.clone()))
            .expect("register location_samples_total");
        registry
            .register(Box::new(live_locations.clone()))
            .expect("register live_locations");
        registry
            .register(Box::new(sample_processing_seconds.clone()))
            .expect("register sample_processing_seconds");

        Self {
            registry,
            duty_transitions_total,
            tracking_sessions_active,
            location_samples_total,
            live_locations,
            sample_processing_seconds,
        }
    }

    pub fn record_transition(&self, transition: &str) {
        self.duty_transitions_total
            .with_label_values(&[transition])
            .inc();
    }

    pub fn record_sample(&self, outcome: &str) {
        self.location_samples_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
