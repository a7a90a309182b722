//! Per-virtual-user execution context and the step interpreter.
//!
//! A [`Session`] is one virtual user: a typed variable table, one or more
//! concurrently running sequence instances each with its own program counter,
//! and a min-heap of scheduled actions keyed by absolute time. Sessions are
//! pre-allocated by the pool and recycled: [`Session::reset`] wipes them back
//! to a pristine state and bumps a generation counter so that stale external
//! callbacks (an HTTP response arriving after the session was recycled) can be
//! detected and dropped.
//!
//! The interpreter lives in [`Session::tick`]: on every tick it drains ripe
//! scheduled actions, then walks each unfinished sequence run, invoking steps
//! until one parks. Steps communicate through their return value only; a
//! parked session is re-ticked by the executor when a wake condition holds.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::errors::SessionError;
use crate::scenario::{Scenario, Sequence, StepContext, StepOutcome, VarIndex};

/// Stable identity of a pooled session within one executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub usize);

/// A typed session variable slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum VarValue {
    #[default]
    Unset,
    Int(i64),
    Text(Arc<str>),
}

/// One running instance of a sequence on a session.
#[derive(Debug)]
struct SequenceRun {
    sequence: Arc<Sequence>,
    pc: usize,
    done: bool,
}

/// What a scheduled action does when its time arrives.
#[derive(Debug)]
pub enum ScheduledKind {
    /// Pure wake-up: the tick itself is the effect.
    Wake,

    /// Instantiate a template sequence on the session.
    StartSequence(Arc<Sequence>),
}

#[derive(Debug)]
struct ScheduledAction {
    at_ms: u64,
    seq: u64,
    kind: ScheduledKind,
}

// Min-heap order: earliest deadline first, insertion order as tie-break.
impl Ord for ScheduledAction {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at_ms
            .cmp(&self.at_ms)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ScheduledAction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ScheduledAction {
    fn eq(&self, other: &Self) -> bool {
        self.at_ms == other.at_ms && self.seq == other.seq
    }
}

impl Eq for ScheduledAction {}

/// Result of one interpreter tick.
#[derive(Debug)]
pub enum TickResult {
    /// Every sequence run on the session is done.
    Complete,

    /// At least one run is parked. `progressed` reports whether any step
    /// advanced during this tick.
    Parked { progressed: bool },

    /// A step failed; the error must be recorded on the owning phase.
    Failed(SessionError),

    /// A step requested immediate session termination.
    Terminated,
}

/// One virtual user's execution context.
pub struct Session {
    id: SessionId,
    generation: u64,
    vars: Vec<VarValue>,
    runs: Vec<SequenceRun>,
    actions: BinaryHeap<ScheduledAction>,
    action_seq: u64,
    scenario: Option<Arc<Scenario>>,
    phase: Option<usize>,
    started_at_ms: u64,
    current_run: Option<usize>,
    armed_wake: Option<u64>,
}

impl Session {
    pub fn new(id: SessionId, var_count: usize) -> Self {
        Self {
            id,
            generation: 0,
            vars: vec![VarValue::Unset; var_count],
            runs: Vec::new(),
            actions: BinaryHeap::new(),
            action_seq: 0,
            scenario: None,
            phase: None,
            started_at_ms: 0,
            current_run: None,
            armed_wake: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Incremented on every [`reset`](Self::reset); external callbacks capture
    /// the generation they were issued under and are dropped on mismatch.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn phase(&self) -> Option<usize> {
        self.phase
    }

    pub fn started_at_ms(&self) -> u64 {
        self.started_at_ms
    }

    pub fn scenario(&self) -> Option<&Arc<Scenario>> {
        self.scenario.as_ref()
    }

    /// Name of the sequence whose step is currently being invoked.
    pub fn current_sequence(&self) -> Option<&str> {
        self.current_run
            .and_then(|i| self.runs.get(i))
            .map(|r| r.sequence.name())
    }

    // ── Variable table ─────────────────────────────────────────────────

    pub fn is_set(&self, var: VarIndex) -> bool {
        !matches!(self.vars[var.0], VarValue::Unset)
    }

    pub fn unset(&mut self, var: VarIndex) {
        self.vars[var.0] = VarValue::Unset;
    }

    pub fn get(&self, var: VarIndex) -> &VarValue {
        &self.vars[var.0]
    }

    pub fn set(&mut self, var: VarIndex, value: VarValue) {
        self.vars[var.0] = value;
    }

    /// Int-specialized read; `None` when unset or holding text.
    pub fn get_int(&self, var: VarIndex) -> Option<i64> {
        match self.vars[var.0] {
            VarValue::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn set_int(&mut self, var: VarIndex, value: i64) {
        self.vars[var.0] = VarValue::Int(value);
    }

    /// Add to an int variable, treating an unset slot as zero.
    pub fn add_int(&mut self, var: VarIndex, delta: i64) -> i64 {
        let next = self.get_int(var).unwrap_or(0) + delta;
        self.set_int(var, next);
        next
    }

    // ── Scheduled actions ──────────────────────────────────────────────

    /// Enqueue a pure wake-up at an absolute time.
    pub fn schedule_wake(&mut self, at_ms: u64) {
        self.schedule(at_ms, ScheduledKind::Wake);
    }

    /// Enqueue a template-sequence instantiation at an absolute time.
    pub fn schedule_sequence(&mut self, at_ms: u64, sequence: Arc<Sequence>) {
        self.schedule(at_ms, ScheduledKind::StartSequence(sequence));
    }

    fn schedule(&mut self, at_ms: u64, kind: ScheduledKind) {
        self.action_seq += 1;
        self.actions.push(ScheduledAction {
            at_ms,
            seq: self.action_seq,
            kind,
        });
    }

    /// Earliest pending scheduled-action deadline, if any.
    pub fn next_wake(&self) -> Option<u64> {
        self.actions.peek().map(|a| a.at_ms)
    }

    pub(crate) fn armed_wake(&self) -> Option<u64> {
        self.armed_wake
    }

    pub(crate) fn set_armed_wake(&mut self, at_ms: Option<u64>) {
        self.armed_wake = at_ms;
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Attach the session to a phase and activate the scenario's initial
    /// sequences. Must be called on a pristine (fresh or reset) session.
    pub fn activate(&mut self, phase: usize, scenario: Arc<Scenario>, now_ms: u64) {
        debug_assert!(self.runs.is_empty() && self.actions.is_empty());
        self.runs = scenario
            .initial_sequences()
            .iter()
            .map(|seq| SequenceRun {
                sequence: seq.clone(),
                pc: 0,
                done: false,
            })
            .collect();
        self.scenario = Some(scenario);
        self.phase = Some(phase);
        self.started_at_ms = now_ms;
    }

    /// Wipe the session back to a pristine state for reuse.
    pub fn reset(&mut self) {
        self.generation += 1;
        for slot in &mut self.vars {
            *slot = VarValue::Unset;
        }
        self.runs.clear();
        self.actions.clear();
        self.scenario = None;
        self.phase = None;
        self.current_run = None;
        self.armed_wake = None;
    }

    /// True when the variable table and the scheduled-action heap are empty,
    /// which must hold for every session returned to the pool.
    pub fn is_pristine(&self) -> bool {
        self.runs.is_empty()
            && self.actions.is_empty()
            && self.vars.iter().all(|v| matches!(v, VarValue::Unset))
    }

    // ── Interpreter ────────────────────────────────────────────────────

    /// Run one interpreter tick.
    ///
    /// Drains ripe scheduled actions, then repeatedly walks every unfinished
    /// sequence run, invoking steps until each parks or completes. Passes
    /// repeat as long as any step advanced, because a step in one sequence
    /// may satisfy the park condition of another on the same session.
    pub fn tick(&mut self, ctx: &mut StepContext<'_>) -> TickResult {
        let mut progressed = self.drain_ripe(ctx.now_ms);
        loop {
            let mut advanced = false;
            let mut i = 0;
            while i < self.runs.len() {
                if self.runs[i].done {
                    i += 1;
                    continue;
                }
                self.current_run = Some(i);
                loop {
                    let run = &self.runs[i];
                    if run.pc >= run.sequence.len() {
                        self.runs[i].done = true;
                        break;
                    }
                    let step = run.sequence.steps()[run.pc].clone();
                    match step.invoke(self, ctx) {
                        StepOutcome::Advance => {
                            advanced = true;
                            let run = &mut self.runs[i];
                            run.pc += 1;
                            if run.pc >= run.sequence.len() {
                                run.done = true;
                                break;
                            }
                        }
                        StepOutcome::Park => break,
                        StepOutcome::Fail(error) => {
                            self.current_run = None;
                            return TickResult::Failed(error);
                        }
                        StepOutcome::TerminateSession => {
                            self.current_run = None;
                            return TickResult::Terminated;
                        }
                    }
                }
                i += 1;
            }
            self.current_run = None;
            advanced |= self.drain_ripe(ctx.now_ms);
            progressed |= advanced;
            if !advanced {
                break;
            }
        }

        if self.runs.iter().all(|r| r.done) {
            TickResult::Complete
        } else {
            TickResult::Parked { progressed }
        }
    }

    /// Pop scheduled actions whose time has come, in non-decreasing time
    /// order. Returns true when a new sequence run was started.
    fn drain_ripe(&mut self, now_ms: u64) -> bool {
        let mut started = false;
        while self
            .actions
            .peek()
            .map(|a| a.at_ms <= now_ms)
            .unwrap_or(false)
        {
            let action = self.actions.pop().unwrap();
            match action.kind {
                ScheduledKind::Wake => {}
                ScheduledKind::StartSequence(sequence) => {
                    self.runs.push(SequenceRun {
                        sequence,
                        pc: 0,
                        done: false,
                    });
                    started = true;
                }
            }
        }
        started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorHandle;
    use crate::scenario::Step;
    use crate::thread_data::ThreadData;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    /// Step that advances after being invoked `parks` times.
    struct CountdownStep {
        parks: AtomicUsize,
    }

    impl Step for CountdownStep {
        fn invoke(&self, _session: &mut Session, _ctx: &mut StepContext<'_>) -> StepOutcome {
            if self.parks.load(AtomicOrdering::Relaxed) == 0 {
                StepOutcome::Advance
            } else {
                self.parks.fetch_sub(1, AtomicOrdering::Relaxed);
                StepOutcome::Park
            }
        }
    }

    struct AdvanceStep;

    impl Step for AdvanceStep {
        fn invoke(&self, _session: &mut Session, _ctx: &mut StepContext<'_>) -> StepOutcome {
            StepOutcome::Advance
        }
    }

    fn tick_once(session: &mut Session, now_ms: u64) -> TickResult {
        let handle = ExecutorHandle::detached();
        let mut thread_data = ThreadData::new();
        let mut ctx = StepContext {
            now_ms,
            session_id: session.id(),
            thread_data: &mut thread_data,
            executor: &handle,
            client: None,
        };
        session.tick(&mut ctx)
    }

    fn scenario_of(steps: Vec<Arc<dyn Step>>) -> Arc<Scenario> {
        Arc::new(Scenario::new("test", vec![Sequence::new("main", steps)]))
    }

    #[test]
    fn test_all_advancing_steps_complete_in_one_tick() {
        let mut session = Session::new(SessionId(0), 0);
        session.activate(0, scenario_of(vec![Arc::new(AdvanceStep), Arc::new(AdvanceStep)]), 0);

        assert!(matches!(tick_once(&mut session, 0), TickResult::Complete));
    }

    #[test]
    fn test_parked_step_leaves_program_counter_in_place() {
        let mut session = Session::new(SessionId(0), 0);
        session.activate(
            0,
            scenario_of(vec![Arc::new(CountdownStep {
                parks: AtomicUsize::new(2),
            })]),
            0,
        );

        assert!(matches!(
            tick_once(&mut session, 0),
            TickResult::Parked { .. }
        ));
        assert!(matches!(
            tick_once(&mut session, 1),
            TickResult::Parked { .. }
        ));
        assert!(matches!(tick_once(&mut session, 2), TickResult::Complete));
    }

    #[test]
    fn test_reset_restores_pristine_state() {
        let mut session = Session::new(SessionId(3), 2);
        session.activate(1, scenario_of(vec![Arc::new(AdvanceStep)]), 10);
        session.set_int(VarIndex(0), 42);
        session.schedule_wake(100);
        let generation = session.generation();

        session.reset();

        assert!(session.is_pristine());
        assert_eq!(session.phase(), None);
        assert_eq!(session.generation(), generation + 1);
    }

    #[test]
    fn test_scheduled_actions_drain_in_time_order() {
        let mut session = Session::new(SessionId(0), 0);
        let late = Arc::new(Sequence::new("late", vec![Arc::new(AdvanceStep) as Arc<dyn Step>]));
        session.activate(0, scenario_of(vec![Arc::new(CountdownStep {
            parks: AtomicUsize::new(usize::MAX),
        })]), 0);

        session.schedule_sequence(50, late);
        session.schedule_wake(10);

        assert_eq!(session.next_wake(), Some(10));
        // At t=20 only the wake is ripe; the template stays queued.
        assert!(matches!(tick_once(&mut session, 20), TickResult::Parked { .. }));
        assert_eq!(session.next_wake(), Some(50));
        // At t=60 the template is instantiated and runs to completion.
        assert!(matches!(tick_once(&mut session, 60), TickResult::Parked { progressed: true }));
    }

    #[test]
    fn test_int_accessors() {
        let mut session = Session::new(SessionId(0), 1);
        let var = VarIndex(0);

        assert!(!session.is_set(var));
        assert_eq!(session.get_int(var), None);

        assert_eq!(session.add_int(var, 5), 5);
        assert_eq!(session.add_int(var, -2), 3);
        assert_eq!(session.get_int(var), Some(3));

        session.unset(var);
        assert!(!session.is_set(var));
    }
}
