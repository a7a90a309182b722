//! Scenario, sequence, and step definitions.
//!
//! A scenario is the program a virtual user executes: an ordered list of
//! initial sequences that start with the session, plus named template
//! sequences that steps may instantiate at runtime. Each sequence is an
//! ordered list of steps, and each step is a non-blocking predicate: invoked
//! on every session tick, it either consumes itself ([`StepOutcome::Advance`]),
//! leaves the program counter in place and yields ([`StepOutcome::Park`]),
//! fails the owning phase, or drops the session.
//!
//! Variable names are resolved to fixed table indices at build time through
//! [`Registry`], so sessions never hash a name on the hot path.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::client::ClientPool;
use crate::errors::SessionError;
use crate::executor::ExecutorHandle;
use crate::session::{Session, SessionId};
use crate::thread_data::ThreadData;

/// Index into a session's variable table, resolved at benchmark build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarIndex(pub(crate) usize);

/// Build-time registry of session variables and per-executor shared state.
///
/// Every variable, shared counter, and shared queue referenced by any step is
/// registered here while the benchmark is being assembled. The registry
/// produces the fixed-size variable schema shared by all pooled sessions and
/// the reservation lists used to pre-create shared-state slots on the
/// executor. Registration is idempotent: the same name always yields the same
/// slot.
#[derive(Debug, Default)]
pub struct Registry {
    var_names: Vec<String>,
    var_index: HashMap<String, usize>,
    counters: Vec<Arc<str>>,
    queues: Vec<Arc<str>>,
    synth: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or look up) a session variable and return its table index.
    pub fn var(&mut self, name: &str) -> VarIndex {
        if let Some(&idx) = self.var_index.get(name) {
            return VarIndex(idx);
        }
        let idx = self.var_names.len();
        self.var_names.push(name.to_string());
        self.var_index.insert(name.to_string(), idx);
        VarIndex(idx)
    }

    /// Register an anonymous variable for a step's private state.
    ///
    /// The slot gets a synthesized name that cannot collide with user-declared
    /// variables, so two steps never share private state by accident.
    pub fn fresh_var(&mut self, prefix: &str) -> VarIndex {
        self.synth += 1;
        let name = format!("!{}#{}", prefix, self.synth);
        self.var(&name)
    }

    /// Reserve a shared counter slot on the executor's [`ThreadData`].
    pub fn shared_counter(&mut self, key: &str) -> Arc<str> {
        if let Some(existing) = self.counters.iter().find(|c| c.as_ref() == key) {
            return existing.clone();
        }
        let key: Arc<str> = Arc::from(key);
        self.counters.push(key.clone());
        key
    }

    /// Reserve a shared queue slot on the executor's [`ThreadData`].
    pub fn shared_queue(&mut self, key: &str) -> Arc<str> {
        if let Some(existing) = self.queues.iter().find(|q| q.as_ref() == key) {
            return existing.clone();
        }
        let key: Arc<str> = Arc::from(key);
        self.queues.push(key.clone());
        key
    }

    /// Number of variable slots every session's table must hold.
    pub fn var_count(&self) -> usize {
        self.var_names.len()
    }

    pub(crate) fn counter_keys(&self) -> &[Arc<str>] {
        &self.counters
    }

    pub(crate) fn queue_keys(&self) -> &[Arc<str>] {
        &self.queues
    }
}

/// Result of invoking a step on a session.
#[derive(Debug)]
pub enum StepOutcome {
    /// Step is done; consume it and continue with the next step.
    Advance,

    /// Step is not ready; leave the program counter in place and yield.
    /// The session will be re-ticked when a wake condition holds.
    Park,

    /// Record the error on the owning phase and tear the session down.
    Fail(SessionError),

    /// Drop the session immediately without failing the phase.
    TerminateSession,
}

/// Execution services available to a step during one invocation.
///
/// Everything here is scoped to the session's executor: shared state is
/// single-threaded by construction, and the handle is only needed to route
/// external completions (HTTP responses) back onto the executor's task queue.
pub struct StepContext<'a> {
    /// Milliseconds since benchmark start.
    pub now_ms: u64,

    /// Identity of the session being ticked.
    pub session_id: SessionId,

    /// Per-executor shared counters, queues, and locks.
    pub thread_data: &'a mut ThreadData,

    /// Handle for posting callbacks back onto this executor.
    pub executor: &'a ExecutorHandle,

    /// HTTP client pool, when one was attached to the run.
    pub client: Option<&'a Arc<dyn ClientPool>>,
}

/// A unit of work within a sequence.
///
/// Steps are shared immutable objects (one instance serves every session), so
/// any per-session state they need lives in session variables registered
/// through [`Registry`].
pub trait Step: Send + Sync {
    fn invoke(&self, session: &mut Session, ctx: &mut StepContext<'_>) -> StepOutcome;

    /// Name of the template sequence this step instantiates at runtime, if
    /// any. Benchmark validation resolves every reference at build time, so
    /// a dangling name is rejected before anything runs.
    fn template_reference(&self) -> Option<&str> {
        None
    }
}

/// An ordered list of steps with a name.
pub struct Sequence {
    name: String,
    steps: Vec<Arc<dyn Step>>,
}

impl Sequence {
    pub fn new(name: &str, steps: Vec<Arc<dyn Step>>) -> Self {
        Self {
            name: name.to_string(),
            steps,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Arc<dyn Step>] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sequence")
            .field("name", &self.name)
            .field("steps", &self.steps.len())
            .finish()
    }
}

/// The set of sequences a session walks through.
#[derive(Debug)]
pub struct Scenario {
    name: String,
    initial: Vec<Arc<Sequence>>,
    templates: HashMap<String, Arc<Sequence>>,
}

impl Scenario {
    pub fn new(name: &str, initial: Vec<Sequence>) -> Self {
        Self {
            name: name.to_string(),
            initial: initial.into_iter().map(Arc::new).collect(),
            templates: HashMap::new(),
        }
    }

    /// Add a named template sequence that steps can instantiate at runtime.
    pub fn with_template(mut self, template: Sequence) -> Self {
        self.templates
            .insert(template.name().to_string(), Arc::new(template));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sequences started on every session activation, in declaration order.
    pub fn initial_sequences(&self) -> &[Arc<Sequence>] {
        &self.initial
    }

    pub fn template(&self, name: &str) -> Option<&Arc<Sequence>> {
        self.templates.get(name)
    }

    pub fn template_names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(|k| k.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_interns_variables() {
        let mut reg = Registry::new();
        let a = reg.var("counter");
        let b = reg.var("other");
        let a_again = reg.var("counter");

        assert_eq!(a, a_again);
        assert_ne!(a, b);
        assert_eq!(reg.var_count(), 2);
    }

    #[test]
    fn test_registry_fresh_vars_never_collide() {
        let mut reg = Registry::new();
        let user = reg.var("delay");
        let s1 = reg.fresh_var("delay");
        let s2 = reg.fresh_var("delay");

        assert_ne!(s1, s2);
        assert_ne!(s1, user);
        assert_eq!(reg.var_count(), 3);
    }

    #[test]
    fn test_registry_counter_reservation_is_idempotent() {
        let mut reg = Registry::new();
        let k1 = reg.shared_counter("gate");
        let k2 = reg.shared_counter("gate");
        reg.shared_counter("other");

        assert!(Arc::ptr_eq(&k1, &k2));
        assert_eq!(reg.counter_keys().len(), 2);
    }

    #[test]
    fn test_scenario_template_lookup() {
        let scenario = Scenario::new("shop", vec![Sequence::new("main", vec![])])
            .with_template(Sequence::new("poll", vec![]));

        assert_eq!(scenario.initial_sequences().len(), 1);
        assert!(scenario.template("poll").is_some());
        assert!(scenario.template("missing").is_none());
    }
}
