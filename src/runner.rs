//! Wires a benchmark definition into a live run.
//!
//! The runner creates the shared status signal, one phase instance per phase
//! definition, and the executor thread, then drives the phase scheduler on
//! the calling thread until every phase is TERMINATED. The result reports
//! whether any phase recorded an error, together with the recorded statistics
//! and session-duration percentiles.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{info, warn};

use crate::benchmark::Benchmark;
use crate::client::ClientPool;
use crate::errors::SessionError;
use crate::executor::Executor;
use crate::phase_instance::{PhaseInstance, StatusSignal};
use crate::scheduler::PhaseScheduler;
use crate::stats::{FanoutStats, RecordingStats, StatsSink};

/// Failure to get a run off the ground (the definition itself was already
/// validated at build time).
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Failed to spawn executor thread: {0}")]
    ExecutorSpawn(#[from] std::io::Error),
}

/// Terminal state of a benchmark run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenchmarkOutcome {
    Completed,
    Failed,
}

/// Result of one benchmark run.
pub struct BenchmarkReport {
    pub outcome: BenchmarkOutcome,
    pub elapsed_ms: u64,

    /// First recorded error per failed phase, in phase order.
    pub phase_errors: Vec<(String, SessionError)>,

    /// Event recorder fed during the run; includes the session-duration
    /// histogram.
    pub stats: Arc<RecordingStats>,
}

/// Builder-style entry point for executing a benchmark.
pub struct BenchmarkRunner {
    benchmark: Arc<Benchmark>,
    client: Option<Arc<dyn ClientPool>>,
    extra_stats: Vec<Arc<dyn StatsSink>>,
}

impl BenchmarkRunner {
    pub fn new(benchmark: Benchmark) -> Self {
        Self {
            benchmark: Arc::new(benchmark),
            client: None,
            extra_stats: Vec::new(),
        }
    }

    /// Attach the HTTP client pool used by request steps.
    pub fn with_client(mut self, client: Arc<dyn ClientPool>) -> Self {
        self.client = Some(client);
        self
    }

    /// Attach an additional statistics sink (metrics exporter, test probe).
    pub fn with_stats(mut self, sink: Arc<dyn StatsSink>) -> Self {
        self.extra_stats.push(sink);
        self
    }

    /// Execute the benchmark to completion, blocking the calling thread.
    pub fn run(self) -> Result<BenchmarkReport, RunError> {
        let epoch = Instant::now();
        let signal = Arc::new(StatusSignal::new());
        let recording = Arc::new(RecordingStats::new());

        let mut sinks: Vec<Arc<dyn StatsSink>> = vec![recording.clone()];
        sinks.extend(self.extra_stats);
        let stats: Arc<dyn StatsSink> = Arc::new(FanoutStats::new(sinks));

        let instances: Vec<Arc<PhaseInstance>> = self
            .benchmark
            .phases()
            .iter()
            .enumerate()
            .map(|(i, def)| {
                Arc::new(PhaseInstance::new(
                    def.clone(),
                    i,
                    signal.clone(),
                    stats.clone(),
                    epoch,
                ))
            })
            .collect();

        info!(
            benchmark = %self.benchmark.name(),
            phases = instances.len(),
            sessions = self.benchmark.sessions_to_reserve(),
            "Starting benchmark run"
        );

        let executor = Executor::spawn(
            &self.benchmark,
            instances.clone(),
            epoch,
            self.client.clone(),
            stats,
        )?;

        let scheduler = PhaseScheduler::new(
            instances.clone(),
            executor.handle().clone(),
            signal,
            epoch,
        );
        scheduler.run();
        executor.shutdown();

        let phase_errors: Vec<(String, SessionError)> = instances
            .iter()
            .filter_map(|p| p.error().map(|e| (p.name().to_string(), e)))
            .collect();

        let outcome = if phase_errors.is_empty() {
            BenchmarkOutcome::Completed
        } else {
            for (phase, error) in &phase_errors {
                warn!(phase = %phase, error = %error, "Phase failed");
            }
            BenchmarkOutcome::Failed
        };

        let elapsed_ms = epoch.elapsed().as_millis() as u64;
        info!(
            benchmark = %self.benchmark.name(),
            elapsed_ms,
            outcome = ?outcome,
            "Benchmark run complete"
        );

        Ok(BenchmarkReport {
            outcome,
            elapsed_ms,
            phase_errors,
            stats: recording,
        })
    }
}
