//! Step library: the built-in vocabulary scenarios are written in.
//!
//! Every step is a non-blocking predicate over the session. Steps that need
//! per-session state (a delay deadline, an in-flight HTTP marker) register a
//! variable slot at construction time, so a single step instance serves every
//! session without interior mutability.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::client::{HttpRequest, HttpResponse};
use crate::errors::SessionError;
use crate::scenario::{Registry, Step, StepContext, StepOutcome, VarIndex};
use crate::session::Session;

/// Predicate over an integer value, matching the comparison vocabulary of the
/// YAML surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntCondition {
    EqualTo(i64),
    NotEqualTo(i64),
    GreaterThan(i64),
    GreaterOrEqualTo(i64),
    LessThan(i64),
    LessOrEqualTo(i64),
}

impl IntCondition {
    pub fn test(&self, value: i64) -> bool {
        match *self {
            IntCondition::EqualTo(expected) => value == expected,
            IntCondition::NotEqualTo(expected) => value != expected,
            IntCondition::GreaterThan(bound) => value > bound,
            IntCondition::GreaterOrEqualTo(bound) => value >= bound,
            IntCondition::LessThan(bound) => value < bound,
            IntCondition::LessOrEqualTo(bound) => value <= bound,
        }
    }
}

/// Where a step reads an integer input from.
#[derive(Debug, Clone)]
pub enum IntSource {
    Value(i64),
    FromVar(VarIndex),
    FromCounter(Arc<str>),
}

impl IntSource {
    fn resolve(
        &self,
        session: &Session,
        ctx: &mut StepContext<'_>,
    ) -> Result<i64, SessionError> {
        match self {
            IntSource::Value(value) => Ok(*value),
            IntSource::FromVar(var) => session
                .get_int(*var)
                .ok_or_else(|| SessionError::step("intSource", "source variable is not set")),
            IntSource::FromCounter(key) => Ok(ctx.thread_data.counter(key).get()),
        }
    }
}

// ── Timing ─────────────────────────────────────────────────────────────

/// Think-time specification.
#[derive(Debug, Clone)]
pub enum DelayTime {
    Fixed(Duration),

    /// Uniformly random delay in `[min, max]`.
    Random { min: Duration, max: Duration },
}

impl DelayTime {
    fn pick(&self) -> Duration {
        match self {
            DelayTime::Fixed(duration) => *duration,
            DelayTime::Random { min, max } => {
                let min_ms = min.as_millis() as u64;
                let max_ms = max.as_millis() as u64;
                if min_ms >= max_ms {
                    return *min;
                }
                Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
            }
        }
    }
}

/// Park the sequence for a (possibly random) delay.
///
/// On first invocation the wake deadline is stored in a private session
/// variable and a wake is scheduled; subsequent invocations park until the
/// deadline passes.
pub struct DelayStep {
    wake_var: VarIndex,
    delay: DelayTime,
}

impl DelayStep {
    pub fn new(registry: &mut Registry, delay: DelayTime) -> Self {
        Self {
            wake_var: registry.fresh_var("delay"),
            delay,
        }
    }
}

impl Step for DelayStep {
    fn invoke(&self, session: &mut Session, ctx: &mut StepContext<'_>) -> StepOutcome {
        match session.get_int(self.wake_var) {
            None => {
                let wake_at = ctx.now_ms + self.delay.pick().as_millis() as u64;
                session.set_int(self.wake_var, wake_at as i64);
                session.schedule_wake(wake_at);
                StepOutcome::Park
            }
            Some(wake_at) if ctx.now_ms >= wake_at as u64 => {
                session.unset(self.wake_var);
                StepOutcome::Advance
            }
            Some(_) => StepOutcome::Park,
        }
    }
}

// ── Session variables ──────────────────────────────────────────────────

/// Block the sequence until a session variable is set and satisfies the
/// condition (if any).
pub struct AwaitIntStep {
    var: VarIndex,
    condition: Option<IntCondition>,
}

impl AwaitIntStep {
    pub fn new(var: VarIndex, condition: Option<IntCondition>) -> Self {
        Self { var, condition }
    }
}

impl Step for AwaitIntStep {
    fn invoke(&self, session: &mut Session, _ctx: &mut StepContext<'_>) -> StepOutcome {
        match session.get_int(self.var) {
            Some(value) => {
                if self.condition.map_or(true, |c| c.test(value)) {
                    StepOutcome::Advance
                } else {
                    StepOutcome::Park
                }
            }
            None => StepOutcome::Park,
        }
    }
}

pub struct SetIntStep {
    var: VarIndex,
    value: IntSource,
}

impl SetIntStep {
    pub fn new(var: VarIndex, value: IntSource) -> Self {
        Self { var, value }
    }
}

impl Step for SetIntStep {
    fn invoke(&self, session: &mut Session, ctx: &mut StepContext<'_>) -> StepOutcome {
        match self.value.resolve(session, ctx) {
            Ok(value) => {
                session.set_int(self.var, value);
                StepOutcome::Advance
            }
            Err(error) => StepOutcome::Fail(error),
        }
    }
}

pub struct AddToIntStep {
    var: VarIndex,
    delta: i64,
}

impl AddToIntStep {
    pub fn new(var: VarIndex, delta: i64) -> Self {
        Self { var, delta }
    }
}

impl Step for AddToIntStep {
    fn invoke(&self, session: &mut Session, _ctx: &mut StepContext<'_>) -> StepOutcome {
        session.add_int(self.var, self.delta);
        StepOutcome::Advance
    }
}

// ── Shared state ───────────────────────────────────────────────────────

/// Set a counter shared by all sessions on the same executor.
pub struct SetSharedCounterStep {
    key: Arc<str>,
    input: IntSource,
}

impl SetSharedCounterStep {
    pub fn new(registry: &mut Registry, key: &str, input: IntSource) -> Self {
        Self {
            key: registry.shared_counter(key),
            input,
        }
    }
}

impl Step for SetSharedCounterStep {
    fn invoke(&self, session: &mut Session, ctx: &mut StepContext<'_>) -> StepOutcome {
        match self.input.resolve(session, ctx) {
            Ok(value) => {
                ctx.thread_data.counter(&self.key).set(value);
                StepOutcome::Advance
            }
            Err(error) => StepOutcome::Fail(error),
        }
    }
}

pub struct AddSharedCounterStep {
    key: Arc<str>,
    delta: i64,
}

impl AddSharedCounterStep {
    pub fn new(registry: &mut Registry, key: &str, delta: i64) -> Self {
        Self {
            key: registry.shared_counter(key),
            delta,
        }
    }
}

impl Step for AddSharedCounterStep {
    fn invoke(&self, _session: &mut Session, ctx: &mut StepContext<'_>) -> StepOutcome {
        ctx.thread_data.counter(&self.key).add(self.delta);
        StepOutcome::Advance
    }
}

/// Block the sequence until a shared counter satisfies the condition.
///
/// The park is re-evaluated whenever the executor processes activity, so a
/// write from any co-located session unblocks it promptly.
pub struct AwaitSharedCounterStep {
    key: Arc<str>,
    condition: IntCondition,
}

impl AwaitSharedCounterStep {
    pub fn new(registry: &mut Registry, key: &str, condition: IntCondition) -> Self {
        Self {
            key: registry.shared_counter(key),
            condition,
        }
    }
}

impl Step for AwaitSharedCounterStep {
    fn invoke(&self, _session: &mut Session, ctx: &mut StepContext<'_>) -> StepOutcome {
        if self.condition.test(ctx.thread_data.counter(&self.key).get()) {
            StepOutcome::Advance
        } else {
            StepOutcome::Park
        }
    }
}

/// Push the value of a session variable onto a shared queue.
pub struct PushSharedQueueStep {
    key: Arc<str>,
    from: VarIndex,
}

impl PushSharedQueueStep {
    pub fn new(registry: &mut Registry, key: &str, from: VarIndex) -> Self {
        Self {
            key: registry.shared_queue(key),
            from,
        }
    }
}

impl Step for PushSharedQueueStep {
    fn invoke(&self, session: &mut Session, ctx: &mut StepContext<'_>) -> StepOutcome {
        let value = session.get(self.from).clone();
        ctx.thread_data.push_queue(&self.key, value);
        StepOutcome::Advance
    }
}

/// Pop from a shared queue into a session variable, parking while the queue
/// is empty.
pub struct PollSharedQueueStep {
    key: Arc<str>,
    into: VarIndex,
}

impl PollSharedQueueStep {
    pub fn new(registry: &mut Registry, key: &str, into: VarIndex) -> Self {
        Self {
            key: registry.shared_queue(key),
            into,
        }
    }
}

impl Step for PollSharedQueueStep {
    fn invoke(&self, session: &mut Session, ctx: &mut StepContext<'_>) -> StepOutcome {
        match ctx.thread_data.poll_queue(&self.key) {
            Some(value) => {
                session.set(self.into, value);
                StepOutcome::Advance
            }
            None => StepOutcome::Park,
        }
    }
}

// ── Control flow ───────────────────────────────────────────────────────

/// Instantiate a template sequence on this session.
pub struct NewSequenceStep {
    template: String,
}

impl NewSequenceStep {
    pub fn new(template: &str) -> Self {
        Self {
            template: template.to_string(),
        }
    }
}

impl Step for NewSequenceStep {
    fn invoke(&self, session: &mut Session, ctx: &mut StepContext<'_>) -> StepOutcome {
        // Benchmark validation resolved the reference at build time; this
        // backstop only fires for scenarios assembled outside the builder.
        let Some(sequence) = session
            .scenario()
            .and_then(|s| s.template(&self.template))
            .cloned()
        else {
            return StepOutcome::Fail(SessionError::step(
                "newSequence",
                format!("unknown template sequence '{}'", self.template),
            ));
        };
        session.schedule_sequence(ctx.now_ms, sequence);
        StepOutcome::Advance
    }

    fn template_reference(&self) -> Option<&str> {
        Some(&self.template)
    }
}

/// Fail the owning phase.
pub struct FailStep {
    message: String,
}

impl FailStep {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

impl Step for FailStep {
    fn invoke(&self, _session: &mut Session, _ctx: &mut StepContext<'_>) -> StepOutcome {
        StepOutcome::Fail(SessionError::Explicit(self.message.clone()))
    }
}

/// Drop the session immediately without failing the phase.
pub struct StopStep;

impl Step for StopStep {
    fn invoke(&self, _session: &mut Session, _ctx: &mut StepContext<'_>) -> StepOutcome {
        StepOutcome::TerminateSession
    }
}

// ── HTTP ───────────────────────────────────────────────────────────────

/// Marker stored in the status variable while a request is in flight.
const IN_FLIGHT: i64 = -1;

/// Status value reported for transport-level failures.
const TRANSPORT_ERROR: i64 = 0;

/// Submit an HTTP request and park until the response arrives.
///
/// The response status lands in the configured variable (0 for transport
/// errors, which fail the session), so later steps can branch on it. The
/// completion callback runs on a transport thread and re-enters the executor
/// through the task queue; a generation check drops completions for sessions
/// that were recycled in the meantime.
pub struct HttpRequestStep {
    method: String,
    url: String,
    headers: Vec<(String, String)>,
    body: Option<String>,
    status_var: VarIndex,
}

impl HttpRequestStep {
    pub fn new(registry: &mut Registry, method: &str, url: &str, status_var: &str) -> Self {
        Self {
            method: method.to_string(),
            url: url.to_string(),
            headers: Vec::new(),
            body: None,
            status_var: registry.var(status_var),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.body = Some(body.to_string());
        self
    }

    fn request(&self) -> HttpRequest {
        HttpRequest {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

impl Step for HttpRequestStep {
    fn invoke(&self, session: &mut Session, ctx: &mut StepContext<'_>) -> StepOutcome {
        match session.get_int(self.status_var) {
            None => {
                let Some(client) = ctx.client else {
                    return StepOutcome::Fail(SessionError::Http(
                        "no client pool attached to the run".to_string(),
                    ));
                };
                session.set_int(self.status_var, IN_FLIGHT);
                let handle = ctx.executor.clone();
                let sid = ctx.session_id;
                let generation = session.generation();
                let var = self.status_var;
                client.submit(
                    self.request(),
                    Box::new(move |result: Result<HttpResponse, String>| {
                        let status = match result {
                            Ok(response) => response.status as i64,
                            Err(_) => TRANSPORT_ERROR,
                        };
                        handle.run_on_executor(move |core| {
                            core.complete_session_int(sid, generation, var, status);
                        });
                    }),
                );
                StepOutcome::Park
            }
            Some(IN_FLIGHT) => StepOutcome::Park,
            Some(TRANSPORT_ERROR) => StepOutcome::Fail(SessionError::Http(format!(
                "transport error for {} {}",
                self.method, self.url
            ))),
            Some(_status) => StepOutcome::Advance,
        }
    }
}
