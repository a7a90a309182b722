//! Error types for benchmark construction and session execution.
//!
//! Two families of errors exist. [`BenchmarkError`] covers structural problems
//! detected while building a benchmark definition and is always fatal at
//! setup. [`SessionError`] is raised by a step at runtime; it terminates the
//! owning phase and marks the benchmark result as failed, but other phases
//! keep running. Pool saturation is deliberately not an error — it is reported
//! as a statistics event and execution continues.

use thiserror::Error;

/// Structural problem in a benchmark definition, detected at build time.
#[derive(Error, Debug)]
pub enum BenchmarkError {
    #[error("Benchmark has no phases")]
    NoPhases,

    #[error("Duplicate phase name: {0}")]
    DuplicatePhase(String),

    #[error("Phase '{phase}' depends on unknown phase '{dependency}'")]
    DanglingDependency { phase: String, dependency: String },

    #[error("Phase dependency cycle involving '{0}'")]
    DependencyCycle(String),

    #[error("Phase '{phase}': {message}")]
    InvalidPhase { phase: String, message: String },

    #[error("Sequence '{sequence}' has no steps")]
    EmptySequence { sequence: String },

    #[error("Unknown template sequence '{template}' referenced by phase '{phase}'")]
    UnknownTemplate { phase: String, template: String },
}

impl BenchmarkError {
    /// Shorthand for a per-phase validation failure.
    pub fn invalid(phase: &str, message: impl Into<String>) -> Self {
        BenchmarkError::InvalidPhase {
            phase: phase.to_string(),
            message: message.into(),
        }
    }
}

/// Failure raised by a step during session execution.
///
/// The error is recorded on the phase instance that owned the failing session;
/// the phase transitions to TERMINATING and the benchmark result becomes
/// failed. The executor itself is never taken down by a step failure.
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("Step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Explicit failure: {0}")]
    Explicit(String),
}

impl SessionError {
    pub fn step(step: &str, message: impl Into<String>) -> Self {
        SessionError::StepFailed {
            step: step.to_string(),
            message: message.into(),
        }
    }
}
