//! Phase-driven load-injection core.
//!
//! `volley` translates a benchmark definition — a directed acyclic graph of
//! phases, each phase driving a scenario of step sequences — into a precisely
//! timed stream of virtual-user executions. Phases start and stop according to
//! their dependencies and duration windows, arrival processes control how fast
//! new virtual users are injected, and every virtual user runs its scenario on
//! a single-threaded cooperative executor.
//!
//! The crate is the scheduling and lifecycle core of a load generator: the
//! HTTP transport, the control plane between a controller and its agents, and
//! report rendering are external collaborators behind narrow contracts
//! ([`client::ClientPool`], [`stats::StatsSink`]).

pub mod benchmark;
pub mod client;
pub mod errors;
pub mod executor;
pub mod metrics;
pub mod phase;
pub mod phase_instance;
pub mod runner;
pub mod scenario;
pub mod scheduler;
pub mod session;
pub mod session_pool;
pub mod stats;
pub mod steps;
pub mod thread_data;
pub mod utils;
pub mod yaml_config;

pub use benchmark::{Agent, Benchmark, BenchmarkBuilder};
pub use errors::{BenchmarkError, SessionError};
pub use phase::{ArrivalSpec, Phase};
pub use phase_instance::PhaseStatus;
pub use runner::{BenchmarkOutcome, BenchmarkReport, BenchmarkRunner};
pub use scenario::{Registry, Scenario, Sequence, Step, StepContext, StepOutcome};
pub use session::Session;
pub use stats::{RecordingStats, StatsSink};
