//! Prometheus metrics for core execution events.
//!
//! Metrics mirror the event contract of [`crate::stats::StatsSink`]: session
//! starts, finishes, failures, and blocked (saturated) arrivals per phase,
//! plus phase status transitions and a session-duration histogram. Attach
//! [`PrometheusStats`] to a runner to feed them.

use prometheus::{
    Encoder, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::env;
use tracing::error;

use crate::errors::SessionError;
use crate::phase_instance::PhaseStatus;
use crate::stats::StatsSink;

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "volley".to_string());

    pub static ref SESSIONS_STARTED_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("sessions_started_total", "Virtual users started")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["phase"]
        ).unwrap();

    pub static ref SESSIONS_FINISHED_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("sessions_finished_total", "Virtual users that completed their scenario")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["phase"]
        ).unwrap();

    pub static ref SESSIONS_FAILED_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("sessions_failed_total", "Virtual users that failed a step")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["phase"]
        ).unwrap();

    pub static ref SESSIONS_BLOCKED_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("sessions_blocked_total", "Arrivals dropped because the session pool was exhausted")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["phase"]
        ).unwrap();

    pub static ref PHASE_STATUS: IntGaugeVec =
        IntGaugeVec::new(
            Opts::new("phase_status", "Current phase status (0=notStarted .. 5=terminated)")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["phase"]
        ).unwrap();

    pub static ref SESSION_DURATION_SECONDS: HistogramVec =
        HistogramVec::new(
            prometheus::HistogramOpts::new(
                "session_duration_seconds",
                "Virtual-user scenario duration in seconds"
            ).namespace(METRIC_NAMESPACE.as_str()),
            &["phase"]
        ).unwrap();
}

/// Register all core metrics with the default registry. Call once at startup.
pub fn register_metrics() -> Result<(), prometheus::Error> {
    let registry = prometheus::default_registry();
    registry.register(Box::new(SESSIONS_STARTED_TOTAL.clone()))?;
    registry.register(Box::new(SESSIONS_FINISHED_TOTAL.clone()))?;
    registry.register(Box::new(SESSIONS_FAILED_TOTAL.clone()))?;
    registry.register(Box::new(SESSIONS_BLOCKED_TOTAL.clone()))?;
    registry.register(Box::new(PHASE_STATUS.clone()))?;
    registry.register(Box::new(SESSION_DURATION_SECONDS.clone()))?;
    Ok(())
}

/// Render a registry in the Prometheus text exposition format.
pub fn gather_metrics_string(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Stats sink feeding the Prometheus metrics above.
pub struct PrometheusStats;

impl StatsSink for PrometheusStats {
    fn session_started(&self, phase: &str) {
        SESSIONS_STARTED_TOTAL.with_label_values(&[phase]).inc();
    }

    fn session_finished(&self, phase: &str, duration_ms: u64) {
        SESSIONS_FINISHED_TOTAL.with_label_values(&[phase]).inc();
        SESSION_DURATION_SECONDS
            .with_label_values(&[phase])
            .observe(duration_ms as f64 / 1000.0);
    }

    fn session_failed(&self, phase: &str, _error: &SessionError) {
        SESSIONS_FAILED_TOTAL.with_label_values(&[phase]).inc();
    }

    fn session_blocked(&self, phase: &str) {
        SESSIONS_BLOCKED_TOTAL.with_label_values(&[phase]).inc();
    }

    fn phase_status_changed(&self, phase: &str, _from: PhaseStatus, to: PhaseStatus, _wall_ms: u64) {
        PHASE_STATUS.with_label_values(&[phase]).set(to as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_sink_counts_events() {
        let sink = PrometheusStats;
        sink.session_started("m-test");
        sink.session_started("m-test");
        sink.session_finished("m-test", 25);
        sink.session_blocked("m-test");
        sink.phase_status_changed("m-test", PhaseStatus::Running, PhaseStatus::Finished, 10);

        assert_eq!(
            SESSIONS_STARTED_TOTAL.with_label_values(&["m-test"]).get(),
            2
        );
        assert_eq!(
            SESSIONS_FINISHED_TOTAL.with_label_values(&["m-test"]).get(),
            1
        );
        assert_eq!(
            SESSIONS_BLOCKED_TOTAL.with_label_values(&["m-test"]).get(),
            1
        );
        assert_eq!(
            PHASE_STATUS.with_label_values(&["m-test"]).get(),
            PhaseStatus::Finished as i64
        );
    }

    #[test]
    fn test_gather_renders_registered_metrics() {
        let registry = Registry::new();
        registry
            .register(Box::new(SESSIONS_STARTED_TOTAL.clone()))
            .unwrap();
        SESSIONS_STARTED_TOTAL.with_label_values(&["m-render"]).inc();

        let rendered = gather_metrics_string(&registry);
        assert!(rendered.contains("sessions_started_total"));
    }
}
