//! Statistics events emitted by the core.
//!
//! The core exposes exactly five events to the statistics collector:
//! session-start, session-finish, session-fail, session-blocked (pool
//! saturation), and phase-status-change. [`StatsSink`] is the narrow contract
//! behind which any collector sits; [`RecordingStats`] is an in-memory
//! implementation used by tests and by the runner's final report, including a
//! session-duration histogram in the HDR histogram idiom.

use std::sync::Mutex;

use hdrhistogram::Histogram;

use crate::errors::SessionError;
use crate::phase_instance::PhaseStatus;

/// Receiver of core execution events. Implementations must be cheap and
/// non-blocking; they are invoked from the executor's hot path.
pub trait StatsSink: Send + Sync {
    fn session_started(&self, phase: &str);
    fn session_finished(&self, phase: &str, duration_ms: u64);
    fn session_failed(&self, phase: &str, error: &SessionError);
    fn session_blocked(&self, phase: &str);
    fn phase_status_changed(&self, phase: &str, from: PhaseStatus, to: PhaseStatus, wall_ms: u64);
}

/// Sink that drops every event.
pub struct NullStats;

impl StatsSink for NullStats {
    fn session_started(&self, _phase: &str) {}
    fn session_finished(&self, _phase: &str, _duration_ms: u64) {}
    fn session_failed(&self, _phase: &str, _error: &SessionError) {}
    fn session_blocked(&self, _phase: &str) {}
    fn phase_status_changed(
        &self,
        _phase: &str,
        _from: PhaseStatus,
        _to: PhaseStatus,
        _wall_ms: u64,
    ) {
    }
}

/// Forwards every event to a list of sinks. The runner uses this to feed its
/// report recorder and any user-supplied collector at the same time.
pub struct FanoutStats {
    sinks: Vec<std::sync::Arc<dyn StatsSink>>,
}

impl FanoutStats {
    pub fn new(sinks: Vec<std::sync::Arc<dyn StatsSink>>) -> Self {
        Self { sinks }
    }
}

impl StatsSink for FanoutStats {
    fn session_started(&self, phase: &str) {
        for sink in &self.sinks {
            sink.session_started(phase);
        }
    }

    fn session_finished(&self, phase: &str, duration_ms: u64) {
        for sink in &self.sinks {
            sink.session_finished(phase, duration_ms);
        }
    }

    fn session_failed(&self, phase: &str, error: &SessionError) {
        for sink in &self.sinks {
            sink.session_failed(phase, error);
        }
    }

    fn session_blocked(&self, phase: &str) {
        for sink in &self.sinks {
            sink.session_blocked(phase);
        }
    }

    fn phase_status_changed(&self, phase: &str, from: PhaseStatus, to: PhaseStatus, wall_ms: u64) {
        for sink in &self.sinks {
            sink.phase_status_changed(phase, from, to, wall_ms);
        }
    }
}

/// One recorded event, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum StatsEvent {
    SessionStarted { phase: String },
    SessionFinished { phase: String, duration_ms: u64 },
    SessionFailed { phase: String, message: String },
    SessionBlocked { phase: String },
    PhaseStatusChanged {
        phase: String,
        from: PhaseStatus,
        to: PhaseStatus,
        wall_ms: u64,
    },
}

/// Session-duration percentile summary.
///
/// All values are milliseconds. Tracks from 1ms to 10 minutes with 3
/// significant digits.
#[derive(Debug, Clone)]
pub struct LatencySummary {
    pub count: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
}

/// In-memory recording sink.
pub struct RecordingStats {
    events: Mutex<Vec<StatsEvent>>,
    durations: Mutex<Histogram<u64>>,
}

impl RecordingStats {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            durations: Mutex::new(
                Histogram::new_with_bounds(1, 600_000, 3).expect("static histogram bounds"),
            ),
        }
    }

    /// Snapshot of all events recorded so far, in emission order.
    pub fn events(&self) -> Vec<StatsEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn started_count(&self, phase: &str) -> usize {
        self.count(|e| matches!(e, StatsEvent::SessionStarted { phase: p } if p == phase))
    }

    pub fn finished_count(&self, phase: &str) -> usize {
        self.count(|e| matches!(e, StatsEvent::SessionFinished { phase: p, .. } if p == phase))
    }

    pub fn failed_count(&self, phase: &str) -> usize {
        self.count(|e| matches!(e, StatsEvent::SessionFailed { phase: p, .. } if p == phase))
    }

    pub fn blocked_count(&self, phase: &str) -> usize {
        self.count(|e| matches!(e, StatsEvent::SessionBlocked { phase: p } if p == phase))
    }

    /// Wall-clock times (ms since benchmark start) at which the phase entered
    /// the given status.
    pub fn status_times(&self, phase: &str, status: PhaseStatus) -> Vec<u64> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                StatsEvent::PhaseStatusChanged {
                    phase: p,
                    to,
                    wall_ms,
                    ..
                } if p == phase && *to == status => Some(*wall_ms),
                _ => None,
            })
            .collect()
    }

    /// Percentile summary over recorded session durations, or `None` when no
    /// session finished.
    pub fn latency(&self) -> Option<LatencySummary> {
        let histogram = self.durations.lock().unwrap();
        if histogram.is_empty() {
            return None;
        }
        Some(LatencySummary {
            count: histogram.len(),
            min: histogram.min(),
            max: histogram.max(),
            mean: histogram.mean(),
            p50: histogram.value_at_quantile(0.50),
            p90: histogram.value_at_quantile(0.90),
            p99: histogram.value_at_quantile(0.99),
        })
    }

    fn count(&self, predicate: impl Fn(&StatsEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }
}

impl Default for RecordingStats {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsSink for RecordingStats {
    fn session_started(&self, phase: &str) {
        self.events.lock().unwrap().push(StatsEvent::SessionStarted {
            phase: phase.to_string(),
        });
    }

    fn session_finished(&self, phase: &str, duration_ms: u64) {
        // Saturating record; durations above the histogram bound are clamped.
        let mut histogram = self.durations.lock().unwrap();
        histogram.saturating_record(duration_ms.max(1));
        drop(histogram);
        self.events.lock().unwrap().push(StatsEvent::SessionFinished {
            phase: phase.to_string(),
            duration_ms,
        });
    }

    fn session_failed(&self, phase: &str, error: &SessionError) {
        self.events.lock().unwrap().push(StatsEvent::SessionFailed {
            phase: phase.to_string(),
            message: error.to_string(),
        });
    }

    fn session_blocked(&self, phase: &str) {
        self.events.lock().unwrap().push(StatsEvent::SessionBlocked {
            phase: phase.to_string(),
        });
    }

    fn phase_status_changed(&self, phase: &str, from: PhaseStatus, to: PhaseStatus, wall_ms: u64) {
        self.events
            .lock()
            .unwrap()
            .push(StatsEvent::PhaseStatusChanged {
                phase: phase.to_string(),
                from,
                to,
                wall_ms,
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_counts_by_phase() {
        let stats = RecordingStats::new();
        stats.session_started("a");
        stats.session_started("a");
        stats.session_started("b");
        stats.session_finished("a", 12);
        stats.session_blocked("b");

        assert_eq!(stats.started_count("a"), 2);
        assert_eq!(stats.started_count("b"), 1);
        assert_eq!(stats.finished_count("a"), 1);
        assert_eq!(stats.blocked_count("b"), 1);
        assert_eq!(stats.failed_count("a"), 0);
    }

    #[test]
    fn test_latency_summary() {
        let stats = RecordingStats::new();
        assert!(stats.latency().is_none());

        for ms in [10, 20, 30, 40] {
            stats.session_finished("a", ms);
        }

        let summary = stats.latency().unwrap();
        assert_eq!(summary.count, 4);
        assert!(summary.min <= 10);
        assert!(summary.max >= 39);
    }

    #[test]
    fn test_status_times_filters_phase_and_status() {
        let stats = RecordingStats::new();
        stats.phase_status_changed("a", PhaseStatus::NotStarted, PhaseStatus::Running, 5);
        stats.phase_status_changed("a", PhaseStatus::Running, PhaseStatus::Finished, 50);
        stats.phase_status_changed("b", PhaseStatus::Running, PhaseStatus::Finished, 70);

        assert_eq!(stats.status_times("a", PhaseStatus::Finished), vec![50]);
        assert_eq!(stats.status_times("b", PhaseStatus::Running), Vec::<u64>::new());
    }
}
