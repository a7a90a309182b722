//! Immutable phase definitions.
//!
//! A phase is the scheduling atom of a benchmark: a scenario, a timed window,
//! dependencies on other phases, and an arrival specification describing how
//! virtual users are injected while the phase runs. Closed models (`AtOnce`,
//! `Always`, `Sequentially`) keep a fixed population of users; open models
//! (`ConstantPerSec`, `RampPerSec`) create users at a rate decoupled from
//! completions.

use std::sync::Arc;

use crate::errors::BenchmarkError;
use crate::scenario::{Scenario, Sequence};

/// How a phase injects virtual users over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrivalSpec {
    /// Burst of `users` sessions at phase start, then finish when all
    /// complete.
    AtOnce { users: u64 },

    /// Keep exactly `users` sessions active for the phase duration,
    /// re-driving each session as soon as it completes.
    Always { users: u64 },

    /// Open-loop constant arrival rate. `max_sessions` bounds the pool
    /// reservation; an arrival finding the pool empty is counted as blocked
    /// and dropped.
    ConstantPerSec { users_per_sec: u64, max_sessions: u64 },

    /// Open-loop rate ramping linearly from `initial_users_per_sec` to
    /// `target_users_per_sec` over the phase duration.
    RampPerSec {
        initial_users_per_sec: u64,
        target_users_per_sec: u64,
        max_sessions: u64,
    },

    /// One session at a time, repeated `repeats` times.
    Sequentially { repeats: u64 },
}

impl ArrivalSpec {
    /// Number of pool sessions this phase contributes to the executor's
    /// reservation.
    pub fn sessions_to_reserve(&self) -> u64 {
        match *self {
            ArrivalSpec::AtOnce { users } | ArrivalSpec::Always { users } => users,
            ArrivalSpec::ConstantPerSec { max_sessions, .. }
            | ArrivalSpec::RampPerSec { max_sessions, .. } => max_sessions,
            ArrivalSpec::Sequentially { .. } => 1,
        }
    }

    /// Open models create users at a rate decoupled from completions.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            ArrivalSpec::ConstantPerSec { .. } | ArrivalSpec::RampPerSec { .. }
        )
    }

    pub fn model_name(&self) -> &'static str {
        match self {
            ArrivalSpec::AtOnce { .. } => "atOnce",
            ArrivalSpec::Always { .. } => "always",
            ArrivalSpec::ConstantPerSec { .. } => "constantPerSec",
            ArrivalSpec::RampPerSec { .. } => "rampPerSec",
            ArrivalSpec::Sequentially { .. } => "sequentially",
        }
    }
}

/// Immutable definition of one phase.
#[derive(Debug, Clone)]
pub struct Phase {
    /// Unique name within the benchmark.
    pub name: String,

    /// The scenario every session of this phase executes.
    pub scenario: Arc<Scenario>,

    /// Arrival specification.
    pub arrival: ArrivalSpec,

    /// Optional absolute offset (ms) from benchmark start before which the
    /// phase may not start.
    pub start_time: Option<u64>,

    /// Phases that must be at least FINISHED before this phase starts.
    pub start_after: Vec<String>,

    /// Phases that must be TERMINATED before this phase starts.
    pub start_after_strict: Vec<String>,

    /// Once FINISHED, this phase terminates when all named phases are
    /// TERMINATED.
    pub terminate_after_strict: Vec<String>,

    /// Length of the RUNNING window in ms. Zero means the phase has no timed
    /// window and relies on natural arrival completion.
    pub duration: u64,

    /// Hard stop: elapsed RUNNING time after which the scheduler terminates
    /// the phase regardless of in-flight sessions.
    pub max_duration: Option<u64>,
}

impl Phase {
    pub fn new(name: &str, scenario: Arc<Scenario>, arrival: ArrivalSpec) -> Self {
        Self {
            name: name.to_string(),
            scenario,
            arrival,
            start_time: None,
            start_after: Vec::new(),
            start_after_strict: Vec::new(),
            terminate_after_strict: Vec::new(),
            duration: 0,
            max_duration: None,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration = duration_ms;
        self
    }

    pub fn with_max_duration(mut self, max_duration_ms: u64) -> Self {
        self.max_duration = Some(max_duration_ms);
        self
    }

    pub fn with_start_time(mut self, start_time_ms: u64) -> Self {
        self.start_time = Some(start_time_ms);
        self
    }

    pub fn with_start_after(mut self, phase: &str) -> Self {
        self.start_after.push(phase.to_string());
        self
    }

    pub fn with_start_after_strict(mut self, phase: &str) -> Self {
        self.start_after_strict.push(phase.to_string());
        self
    }

    pub fn with_terminate_after_strict(mut self, phase: &str) -> Self {
        self.terminate_after_strict.push(phase.to_string());
        self
    }

    /// Validate the definition in isolation (dependencies are checked at the
    /// benchmark level, where the full phase set is known).
    pub fn validate(&self) -> Result<(), BenchmarkError> {
        match self.arrival {
            ArrivalSpec::ConstantPerSec {
                users_per_sec,
                max_sessions,
            } => {
                if users_per_sec == 0 {
                    return Err(BenchmarkError::invalid(&self.name, "usersPerSec must be positive"));
                }
                if max_sessions == 0 {
                    return Err(BenchmarkError::invalid(&self.name, "maxSessions must be positive"));
                }
                if self.duration == 0 {
                    return Err(BenchmarkError::invalid(
                        &self.name,
                        "open-model phases require a duration",
                    ));
                }
            }
            ArrivalSpec::RampPerSec {
                initial_users_per_sec,
                target_users_per_sec,
                max_sessions,
            } => {
                if initial_users_per_sec == 0 && target_users_per_sec == 0 {
                    return Err(BenchmarkError::invalid(
                        &self.name,
                        "ramp needs a non-zero initial or target rate",
                    ));
                }
                if max_sessions == 0 {
                    return Err(BenchmarkError::invalid(&self.name, "maxSessions must be positive"));
                }
                if self.duration == 0 {
                    return Err(BenchmarkError::invalid(
                        &self.name,
                        "open-model phases require a duration",
                    ));
                }
            }
            ArrivalSpec::Always { users } => {
                if users == 0 {
                    return Err(BenchmarkError::invalid(&self.name, "always requires users > 0"));
                }
                if self.duration == 0 {
                    return Err(BenchmarkError::invalid(
                        &self.name,
                        "always-model phases require a duration",
                    ));
                }
            }
            ArrivalSpec::Sequentially { repeats } => {
                if repeats == 0 {
                    return Err(BenchmarkError::invalid(&self.name, "repeats must be positive"));
                }
            }
            ArrivalSpec::AtOnce { .. } => {}
        }

        if let Some(max) = self.max_duration {
            if max < self.duration {
                return Err(BenchmarkError::invalid(
                    &self.name,
                    "maxDuration must not be shorter than duration",
                ));
            }
        }

        for sequence in self.scenario.initial_sequences() {
            if sequence.is_empty() {
                return Err(BenchmarkError::EmptySequence {
                    sequence: sequence.name().to_string(),
                });
            }
        }
        if self.scenario.initial_sequences().is_empty() {
            return Err(BenchmarkError::invalid(&self.name, "scenario has no initial sequences"));
        }

        self.validate_template_references()?;

        Ok(())
    }

    /// Every template sequence a step instantiates must exist in this
    /// scenario. Template sequences may reference further templates, so both
    /// the initial and the template sequences are walked.
    fn validate_template_references(&self) -> Result<(), BenchmarkError> {
        let templates: Vec<&Arc<Sequence>> = self
            .scenario
            .template_names()
            .filter_map(|name| self.scenario.template(name))
            .collect();
        let sequences = self.scenario.initial_sequences().iter().chain(templates);

        for sequence in sequences {
            for step in sequence.steps() {
                if let Some(template) = step.template_reference() {
                    if self.scenario.template(template).is_none() {
                        return Err(BenchmarkError::UnknownTemplate {
                            phase: self.name.clone(),
                            template: template.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::{Step, StepContext, StepOutcome};
    use crate::session::Session;
    use crate::steps::NewSequenceStep;

    struct Noop;

    impl Step for Noop {
        fn invoke(&self, _s: &mut Session, _c: &mut StepContext<'_>) -> StepOutcome {
            StepOutcome::Advance
        }
    }

    fn scenario() -> Arc<Scenario> {
        Arc::new(Scenario::new(
            "s",
            vec![Sequence::new("main", vec![Arc::new(Noop)])],
        ))
    }

    #[test]
    fn test_sessions_to_reserve_per_model() {
        assert_eq!(ArrivalSpec::AtOnce { users: 7 }.sessions_to_reserve(), 7);
        assert_eq!(ArrivalSpec::Always { users: 3 }.sessions_to_reserve(), 3);
        assert_eq!(
            ArrivalSpec::ConstantPerSec {
                users_per_sec: 100,
                max_sessions: 40
            }
            .sessions_to_reserve(),
            40
        );
        assert_eq!(
            ArrivalSpec::Sequentially { repeats: 10 }.sessions_to_reserve(),
            1
        );
    }

    #[test]
    fn test_open_vs_closed_models() {
        assert!(ArrivalSpec::ConstantPerSec {
            users_per_sec: 1,
            max_sessions: 1
        }
        .is_open());
        assert!(!ArrivalSpec::AtOnce { users: 1 }.is_open());
        assert!(!ArrivalSpec::Sequentially { repeats: 1 }.is_open());
    }

    #[test]
    fn test_validate_rejects_zero_rate() {
        let phase = Phase::new(
            "p",
            scenario(),
            ArrivalSpec::ConstantPerSec {
                users_per_sec: 0,
                max_sessions: 10,
            },
        )
        .with_duration(1000);

        assert!(phase.validate().is_err());
    }

    #[test]
    fn test_validate_requires_duration_for_open_models() {
        let phase = Phase::new(
            "p",
            scenario(),
            ArrivalSpec::ConstantPerSec {
                users_per_sec: 10,
                max_sessions: 10,
            },
        );

        assert!(phase.validate().is_err());
    }

    #[test]
    fn test_validate_max_duration_bound() {
        let phase = Phase::new("p", scenario(), ArrivalSpec::AtOnce { users: 1 })
            .with_duration(500)
            .with_max_duration(100);

        assert!(phase.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_at_once_without_duration() {
        let phase = Phase::new("p", scenario(), ArrivalSpec::AtOnce { users: 5 });
        assert!(phase.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_template_reference() {
        let scenario = Arc::new(Scenario::new(
            "s",
            vec![Sequence::new(
                "main",
                vec![Arc::new(NewSequenceStep::new("missing"))],
            )],
        ));
        let phase = Phase::new("p", scenario, ArrivalSpec::AtOnce { users: 1 });

        assert!(matches!(
            phase.validate(),
            Err(BenchmarkError::UnknownTemplate { .. })
        ));
    }

    #[test]
    fn test_validate_resolves_template_references_in_templates() {
        let chained = Arc::new(
            Scenario::new(
                "s",
                vec![Sequence::new(
                    "main",
                    vec![Arc::new(NewSequenceStep::new("first"))],
                )],
            )
            .with_template(Sequence::new(
                "first",
                vec![Arc::new(NewSequenceStep::new("second"))],
            ))
            .with_template(Sequence::new("second", vec![Arc::new(Noop)])),
        );
        assert!(Phase::new("p", chained, ArrivalSpec::AtOnce { users: 1 })
            .validate()
            .is_ok());

        // A dangling reference inside a template sequence is caught too.
        let dangling = Arc::new(
            Scenario::new(
                "s",
                vec![Sequence::new(
                    "main",
                    vec![Arc::new(NewSequenceStep::new("first"))],
                )],
            )
            .with_template(Sequence::new(
                "first",
                vec![Arc::new(NewSequenceStep::new("ghost"))],
            )),
        );
        assert!(matches!(
            Phase::new("p", dangling, ArrivalSpec::AtOnce { users: 1 }).validate(),
            Err(BenchmarkError::UnknownTemplate { .. })
        ));
    }
}
