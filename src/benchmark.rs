//! Benchmark definition and structural validation.
//!
//! A [`Benchmark`] is the immutable root of a run: a name, the agents it is
//! meant to execute on (data only — the control plane between a controller
//! and its agents is an external collaborator), and a set of phases whose
//! dependencies induce a partial order. The builder validates structure once,
//! at build time: duplicate names, dangling dependency references, and
//! dependency cycles are all fatal here rather than at runtime.

use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::BenchmarkError;
use crate::phase::Phase;
use crate::scenario::Registry;

/// One worker process of a distributed benchmark. Data only; the wire
/// protocol for driving remote agents is out of scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Agent {
    pub name: String,
}

/// Immutable benchmark definition.
#[derive(Debug)]
pub struct Benchmark {
    name: String,
    agents: Vec<Agent>,
    phases: Vec<Arc<Phase>>,
    var_count: usize,
    counter_keys: Vec<Arc<str>>,
    queue_keys: Vec<Arc<str>>,
}

impl Benchmark {
    pub fn builder(name: &str) -> BenchmarkBuilder {
        BenchmarkBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn phases(&self) -> &[Arc<Phase>] {
        &self.phases
    }

    pub fn phase_index(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == name)
    }

    /// Size of the variable table every pooled session carries. The schema is
    /// the benchmark-wide union of all registered variables, so any session
    /// can run any phase's scenario.
    pub fn var_count(&self) -> usize {
        self.var_count
    }

    pub fn counter_keys(&self) -> &[Arc<str>] {
        &self.counter_keys
    }

    pub fn queue_keys(&self) -> &[Arc<str>] {
        &self.queue_keys
    }

    /// Total pool capacity required by all phases of this benchmark on one
    /// executor.
    pub fn sessions_to_reserve(&self) -> u64 {
        self.phases
            .iter()
            .map(|p| p.arrival.sessions_to_reserve())
            .sum()
    }
}

/// Builder collecting agents and phases, then validating the whole.
pub struct BenchmarkBuilder {
    name: String,
    agents: Vec<Agent>,
    phases: Vec<Phase>,
}

impl BenchmarkBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            agents: Vec::new(),
            phases: Vec::new(),
        }
    }

    pub fn agent(mut self, name: &str) -> Self {
        self.agents.push(Agent {
            name: name.to_string(),
        });
        self
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phases.push(phase);
        self
    }

    /// Validate and seal the definition. The registry carries the variable
    /// schema and shared-state reservations collected while steps were
    /// constructed.
    pub fn build(self, registry: Registry) -> Result<Benchmark, BenchmarkError> {
        if self.phases.is_empty() {
            return Err(BenchmarkError::NoPhases);
        }

        let mut index = HashMap::new();
        for (i, phase) in self.phases.iter().enumerate() {
            if index.insert(phase.name.clone(), i).is_some() {
                return Err(BenchmarkError::DuplicatePhase(phase.name.clone()));
            }
        }

        for phase in &self.phases {
            phase.validate()?;
            for dep in phase
                .start_after
                .iter()
                .chain(&phase.start_after_strict)
                .chain(&phase.terminate_after_strict)
            {
                if !index.contains_key(dep) {
                    return Err(BenchmarkError::DanglingDependency {
                        phase: phase.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        detect_cycles(&self.phases, &index)?;

        // A benchmark without explicit agents runs on the local agent.
        let agents = if self.agents.is_empty() {
            vec![Agent {
                name: "local".to_string(),
            }]
        } else {
            self.agents
        };

        Ok(Benchmark {
            name: self.name,
            agents,
            phases: self.phases.into_iter().map(Arc::new).collect(),
            var_count: registry.var_count(),
            counter_keys: registry.counter_keys().to_vec(),
            queue_keys: registry.queue_keys().to_vec(),
        })
    }
}

/// Depth-first search over the union of all dependency edges. Any cycle makes
/// some phase unable to ever start or terminate.
fn detect_cycles(phases: &[Phase], index: &HashMap<String, usize>) -> Result<(), BenchmarkError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Grey,
        Black,
    }

    fn visit(
        node: usize,
        phases: &[Phase],
        index: &HashMap<String, usize>,
        marks: &mut [Mark],
    ) -> Result<(), BenchmarkError> {
        marks[node] = Mark::Grey;
        let phase = &phases[node];
        for dep in phase
            .start_after
            .iter()
            .chain(&phase.start_after_strict)
            .chain(&phase.terminate_after_strict)
        {
            let next = index[dep];
            match marks[next] {
                Mark::Grey => return Err(BenchmarkError::DependencyCycle(phase.name.clone())),
                Mark::White => visit(next, phases, index, marks)?,
                Mark::Black => {}
            }
        }
        marks[node] = Mark::Black;
        Ok(())
    }

    let mut marks = vec![Mark::White; phases.len()];
    for i in 0..phases.len() {
        if marks[i] == Mark::White {
            visit(i, phases, index, &mut marks)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::ArrivalSpec;
    use crate::scenario::{Scenario, Sequence, Step, StepContext, StepOutcome};
    use crate::session::Session;

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

    fn at_once(name: &str) -> Phase {
        Phase::new(name, scenario(), ArrivalSpec::AtOnce { users: 1 })
    }

    #[test]
    fn test_build_requires_phases() {
        let result = Benchmark::builder("empty").build(Registry::new());
        assert!(matches!(result, Err(BenchmarkError::NoPhases)));
    }

    #[test]
    fn test_build_rejects_duplicate_names() {
        let result = Benchmark::builder("b")
            .phase(at_once("p"))
            .phase(at_once("p"))
            .build(Registry::new());
        assert!(matches!(result, Err(BenchmarkError::DuplicatePhase(_))));
    }

    #[test]
    fn test_build_rejects_dangling_dependency() {
        let result = Benchmark::builder("b")
            .phase(at_once("p").with_start_after("missing"))
            .build(Registry::new());
        assert!(matches!(
            result,
            Err(BenchmarkError::DanglingDependency { .. })
        ));
    }

    #[test]
    fn test_build_rejects_cycles() {
        let result = Benchmark::builder("b")
            .phase(at_once("a").with_start_after("b"))
            .phase(at_once("b").with_start_after_strict("a"))
            .build(Registry::new());
        assert!(matches!(result, Err(BenchmarkError::DependencyCycle(_))));
    }

    #[test]
    fn test_build_defaults_to_local_agent() {
        let benchmark = Benchmark::builder("b")
            .phase(at_once("p"))
            .build(Registry::new())
            .unwrap();
        assert_eq!(benchmark.agents().len(), 1);
        assert_eq!(benchmark.agents()[0].name, "local");
    }

    #[test]
    fn test_pool_reservation_sums_over_phases() {
        let benchmark = Benchmark::builder("b")
            .phase(Phase::new("a", scenario(), ArrivalSpec::AtOnce { users: 5 }))
            .phase(
                Phase::new(
                    "c",
                    scenario(),
                    ArrivalSpec::ConstantPerSec {
                        users_per_sec: 10,
                        max_sessions: 20,
                    },
                )
                .with_duration(1000)
                .with_start_after("a"),
            )
            .build(Registry::new())
            .unwrap();

        assert_eq!(benchmark.sessions_to_reserve(), 25);
        assert_eq!(benchmark.phase_index("c"), Some(1));
    }
}
