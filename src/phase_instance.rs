//! Runtime state of one phase: the status machine, the active-session
//! sentinel, and the arrival processes.
//!
//! A [`PhaseInstance`] is the cross-thread face of a running phase: the
//! scheduler thread drives `finish`/`terminate` against it while the
//! executor's arrival loop starts sessions through it. The only
//! synchronization point between the two is the `active_sessions` atomic: on
//! the first transition into a finishing state with zero active sessions it
//! is swapped to `i64::MIN`, publishing "no new starts" — a racing starter
//! observes the negative value and aborts without dispatching.
//!
//! The arrival-process state itself ([`ArrivalProcess`]) is executor-local
//! and never crosses threads; only the status and counter atomics do.

use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::errors::SessionError;
use crate::phase::{ArrivalSpec, Phase};
use crate::stats::StatsSink;
use crate::utils::ceil_div;

/// Sentinel stored in `active_sessions` once a finishing phase has no live
/// sessions; any later increment stays negative and the starter backs off.
pub const NO_MORE_STARTS: i64 = i64::MIN;

/// Phase lifecycle states. Transitions are monotone: a phase never moves
/// backwards, and TERMINATED is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PhaseStatus {
    NotStarted = 0,
    Starting = 1,
    Running = 2,
    Finished = 3,
    Terminating = 4,
    Terminated = 5,
}

impl PhaseStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PhaseStatus::NotStarted,
            1 => PhaseStatus::Starting,
            2 => PhaseStatus::Running,
            3 => PhaseStatus::Finished,
            4 => PhaseStatus::Terminating,
            _ => PhaseStatus::Terminated,
        }
    }

    /// True for FINISHED, TERMINATING, and TERMINATED: no new sessions may be
    /// dispatched.
    pub fn is_finished(self) -> bool {
        self >= PhaseStatus::Finished
    }

    pub fn is_terminated(self) -> bool {
        self == PhaseStatus::Terminated
    }
}

/// Condition variable shared by all phase instances of a benchmark; the
/// scheduler sleeps on it between deadlines and every status transition
/// signals it.
pub struct StatusSignal {
    generation: Mutex<u64>,
    condvar: Condvar,
}

impl StatusSignal {
    pub fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        *self.generation.lock().unwrap()
    }

    pub fn notify(&self) {
        let mut generation = self.generation.lock().unwrap();
        *generation += 1;
        self.condvar.notify_all();
    }

    /// Block until the generation moves past `seen` or the timeout elapses.
    /// With no timeout, waits until signalled.
    pub fn wait_past(&self, seen: u64, timeout: Option<Duration>) {
        let mut generation = self.generation.lock().unwrap();
        match timeout {
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while *generation <= seen {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return;
                    }
                    let (guard, result) = self.condvar.wait_timeout(generation, remaining).unwrap();
                    generation = guard;
                    if result.timed_out() {
                        return;
                    }
                }
            }
            None => {
                while *generation <= seen {
                    generation = self.condvar.wait(generation).unwrap();
                }
            }
        }
    }
}

impl Default for StatusSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Cross-thread runtime state of one phase.
pub struct PhaseInstance {
    def: Arc<Phase>,
    index: usize,
    status: AtomicU8,
    absolute_start_ms: AtomicU64,
    active_sessions: AtomicI64,
    error: Mutex<Option<SessionError>>,
    signal: Arc<StatusSignal>,
    stats: Arc<dyn StatsSink>,
    epoch: Instant,
}

impl PhaseInstance {
    pub fn new(
        def: Arc<Phase>,
        index: usize,
        signal: Arc<StatusSignal>,
        stats: Arc<dyn StatsSink>,
        epoch: Instant,
    ) -> Self {
        Self {
            def,
            index,
            status: AtomicU8::new(PhaseStatus::NotStarted as u8),
            absolute_start_ms: AtomicU64::new(u64::MAX),
            active_sessions: AtomicI64::new(0),
            error: Mutex::new(None),
            signal,
            stats,
            epoch,
        }
    }

    pub fn def(&self) -> &Arc<Phase> {
        &self.def
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn status(&self) -> PhaseStatus {
        PhaseStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Wall time (ms since benchmark start) the phase started, if it has.
    pub fn absolute_start_ms(&self) -> Option<u64> {
        match self.absolute_start_ms.load(Ordering::Acquire) {
            u64::MAX => None,
            value => Some(value),
        }
    }

    /// Raw active-session counter; negative once no further starts are
    /// accepted.
    pub fn active_sessions(&self) -> i64 {
        self.active_sessions.load(Ordering::Acquire)
    }

    pub fn error(&self) -> Option<SessionError> {
        self.error.lock().unwrap().clone()
    }

    fn wall_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// CAS-transition to `to` if the current status is exactly `from`.
    fn transition(&self, from: PhaseStatus, to: PhaseStatus) -> bool {
        let swapped = self
            .status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            debug!(phase = %self.def.name, from = ?from, to = ?to, "Phase status changed");
            self.stats
                .phase_status_changed(&self.def.name, from, to, self.wall_ms());
            self.signal.notify();
        }
        swapped
    }

    /// Scheduler-side: claim the phase for dispatch.
    pub fn mark_starting(&self) -> bool {
        self.transition(PhaseStatus::NotStarted, PhaseStatus::Starting)
    }

    /// Executor-side: the phase is now running; record its start time.
    pub fn start(&self, now_ms: u64) {
        self.absolute_start_ms.store(now_ms, Ordering::Release);
        if !self.transition(PhaseStatus::Starting, PhaseStatus::Running) {
            // Direct start without scheduler dispatch (tests, single-phase runs).
            self.transition(PhaseStatus::NotStarted, PhaseStatus::Running);
        }
    }

    /// End the RUNNING window. In-flight sessions keep running; when none
    /// remain the phase seals itself TERMINATED.
    pub fn finish(&self) {
        if self.transition(PhaseStatus::Running, PhaseStatus::Finished) {
            self.try_seal();
        }
    }

    /// Hard stop: no new sessions, tear down when the active count drains.
    /// Idempotent; calling it any number of times equals calling it once.
    pub fn terminate(&self) {
        loop {
            let current = self.status();
            if current >= PhaseStatus::Terminating {
                return;
            }
            if self.transition(current, PhaseStatus::Terminating) {
                self.try_seal();
                return;
            }
        }
    }

    /// Record a session failure and terminate the phase. The first error
    /// wins; later failures of the same phase are logged by the caller only.
    pub fn fail(&self, error: SessionError) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(error);
        }
        drop(slot);
        self.terminate();
    }

    /// Publish "no more starts" if no session is active, sealing the phase
    /// TERMINATED. This is the single synchronization point between the
    /// arrival loop and the scheduler.
    fn try_seal(&self) {
        if self
            .active_sessions
            .compare_exchange(0, NO_MORE_STARTS, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.set_terminated();
        }
    }

    fn set_terminated(&self) {
        loop {
            let current = self.status();
            if current == PhaseStatus::Terminated {
                return;
            }
            if !current.is_finished() {
                return;
            }
            if self.transition(current, PhaseStatus::Terminated) {
                return;
            }
        }
    }

    /// Arrival-side: reserve a slot for one new session. Returns false when
    /// the phase finished between arrival ticks; the caller must abort
    /// without dispatching.
    pub fn try_start_session(&self) -> bool {
        let active = self.active_sessions.fetch_add(1, Ordering::AcqRel) + 1;
        if active < 0 {
            return false;
        }
        trace!(phase = %self.def.name, active, "Session slot reserved");
        true
    }

    /// Burst models set the active count in one shot before dispatching.
    pub fn set_active_sessions(&self, count: i64) {
        debug_assert_eq!(self.active_sessions.load(Ordering::Acquire), 0);
        self.active_sessions.store(count, Ordering::Release);
    }

    /// One session stopped driving work (finished, failed, or its arrival
    /// slot was never filled due to saturation). Seals the phase when the
    /// count drains to zero in a finishing state. Returns the new count.
    pub fn session_done(&self) -> i64 {
        let active = self.active_sessions.fetch_sub(1, Ordering::AcqRel) - 1;
        trace!(phase = %self.def.name, active, "Active sessions decremented");
        if active == 0 && self.status().is_finished() {
            self.set_terminated();
        }
        active
    }
}

// ── Arrival processes ──────────────────────────────────────────────────

/// Executor-local state of a phase's arrival process.
///
/// The variants mirror [`ArrivalSpec`]; the extra fields are the mutable
/// bookkeeping the arrival loop keeps between its self-scheduled ticks.
#[derive(Debug, Clone, Copy)]
pub enum ArrivalProcess {
    AtOnce {
        users: u64,
    },
    Always {
        users: u64,
    },
    ConstantPerSec {
        users_per_sec: u64,
        started_users: u64,
    },
    RampPerSec {
        initial_users_per_sec: u64,
        target_users_per_sec: u64,
        duration: u64,
        started_users: u64,
    },
    Sequentially {
        repeats: u64,
        completed: u64,
    },
}

/// What the executor should do with a session that just completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Closed-loop replacement: reset the same session and drive it again
    /// without releasing it.
    Redrive,

    /// Return the session to the pool, then apply the phase-end action.
    Release(PhaseEnd),
}

/// Phase-end action accompanying a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEnd {
    /// Nothing beyond the usual active-count decrement.
    None,

    /// Natural completion: when the decrement drains the count to zero while
    /// still RUNNING, finish the phase.
    FinishWhenIdle,

    /// Natural termination (sequential repeats exhausted): terminate before
    /// decrementing.
    Terminate,
}

impl ArrivalProcess {
    pub fn for_phase(def: &Phase) -> Self {
        match def.arrival {
            ArrivalSpec::AtOnce { users } => ArrivalProcess::AtOnce { users },
            ArrivalSpec::Always { users } => ArrivalProcess::Always { users },
            ArrivalSpec::ConstantPerSec { users_per_sec, .. } => ArrivalProcess::ConstantPerSec {
                users_per_sec,
                started_users: 0,
            },
            ArrivalSpec::RampPerSec {
                initial_users_per_sec,
                target_users_per_sec,
                ..
            } => ArrivalProcess::RampPerSec {
                initial_users_per_sec,
                target_users_per_sec,
                duration: def.duration,
                started_users: 0,
            },
            ArrivalSpec::Sequentially { repeats } => ArrivalProcess::Sequentially {
                repeats,
                completed: 0,
            },
        }
    }

    /// Decide the fate of a completed session, updating local bookkeeping.
    pub fn on_session_complete(&mut self, status: PhaseStatus) -> Completion {
        match self {
            ArrivalProcess::AtOnce { .. } => Completion::Release(PhaseEnd::FinishWhenIdle),
            ArrivalProcess::Always { .. } => {
                if status.is_finished() {
                    Completion::Release(PhaseEnd::None)
                } else {
                    Completion::Redrive
                }
            }
            ArrivalProcess::ConstantPerSec { .. } | ArrivalProcess::RampPerSec { .. } => {
                Completion::Release(PhaseEnd::None)
            }
            ArrivalProcess::Sequentially { repeats, completed } => {
                *completed += 1;
                if *completed < *repeats && !status.is_finished() {
                    Completion::Redrive
                } else {
                    Completion::Release(PhaseEnd::Terminate)
                }
            }
        }
    }
}

// ── Rate math ──────────────────────────────────────────────────────────
//
// The arrival loops recompute the cumulative required user count from the
// actual elapsed time on every tick, so a late timer catches up instead of
// drifting. Deadlines round up, never down, so a tick is never scheduled
// before its user is actually due.

/// Users required by a constant-rate phase after `delta_ms`.
pub fn constant_required(delta_ms: u64, users_per_sec: u64) -> u64 {
    ((delta_ms as u128 * users_per_sec as u128) / 1000) as u64
}

/// Earliest `delta_ms` at which a constant-rate phase owes `started + 1`
/// users.
pub fn constant_next_delta(started: u64, users_per_sec: u64) -> u64 {
    ceil_div(1000 * (started as u128 + 1), users_per_sec as u128)
}

/// Users required by a linear ramp after `delta_ms`, from the closed-form
/// integral `λ₀·t + (λ₁−λ₀)·t²/(2D)` scaled to users.
pub fn ramp_required(delta_ms: u64, initial: u64, target: u64, duration: u64) -> u64 {
    if duration == 0 {
        return 0;
    }
    let delta = delta_ms.min(duration) as i128;
    let initial = initial as i128;
    let target = target as i128;
    let span = duration as i128;
    // Single floor over the exact rational keeps the count within 1 of the
    // real-valued integral at every instant.
    let numerator = 2 * span * delta * initial + (target - initial) * delta * delta;
    (numerator / (2 * span * 1000)).max(0) as u64
}

/// Earliest `delta_ms` at which the ramp owes `started + 1` users, found by
/// bisection over the monotone cumulative count. Returns the phase duration
/// when the ramp never owes another user.
pub fn ramp_next_delta(started: u64, initial: u64, target: u64, duration: u64) -> u64 {
    let needed = started + 1;
    if ramp_required(duration, initial, target, duration) < needed {
        return duration;
    }
    let (mut low, mut high) = (0u64, duration);
    while low < high {
        let mid = low + (high - low) / 2;
        if ramp_required(mid, initial, target, duration) >= needed {
            high = mid;
        } else {
            low = mid + 1;
        }
    }
    low
}
