//! Single-threaded cooperative executor.
//!
//! One executor owns a session pool, the per-executor [`ThreadData`], and the
//! arrival-process state of every phase assigned to it. All sessions bound to
//! the executor run serially on its thread; work never blocks. A step that
//! must wait parks its session, and the executor re-ticks parked sessions
//! when a wake condition can have changed: a timer fired, or any external
//! task (an HTTP completion, a phase dispatch) ran. Timers live in a local
//! min-heap; cross-thread input arrives through a lock-free MPSC queue.
//!
//! The run loop is a current-thread tokio runtime selecting between the task
//! queue and the next timer deadline. Handlers themselves are synchronous —
//! the async layer exists only to sleep efficiently.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeSet, BinaryHeap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace, warn};

use crate::benchmark::Benchmark;
use crate::client::ClientPool;
use crate::phase_instance::{
    constant_next_delta, constant_required, ramp_next_delta, ramp_required, ArrivalProcess,
    Completion, PhaseEnd, PhaseInstance, PhaseStatus,
};
use crate::scenario::{StepContext, VarIndex};
use crate::session::{SessionId, TickResult};
use crate::session_pool::SessionPool;
use crate::stats::StatsSink;
use crate::thread_data::ThreadData;

/// Work posted onto an executor's task queue.
pub enum Task {
    /// Scheduler dispatch: mark the phase RUNNING and run its first arrival
    /// tick.
    StartPhase(usize),

    /// Self-scheduled arrival tick.
    ProceedPhase(usize),

    /// Re-tick a session (external wake source).
    WakeSession(SessionId),

    /// Run an arbitrary callback on the executor thread. Used by transport
    /// completions to re-enter the executor.
    Post(Box<dyn FnOnce(&mut ExecutorCore) + Send>),

    /// Stop the run loop.
    Shutdown,
}

/// Cloneable sending side of an executor's task queue.
#[derive(Clone)]
pub struct ExecutorHandle {
    tx: UnboundedSender<Task>,
}

impl ExecutorHandle {
    pub(crate) fn new(tx: UnboundedSender<Task>) -> Self {
        Self { tx }
    }

    /// Handle with no executor behind it; posted tasks are dropped. Only
    /// useful for unit-testing steps outside a running executor.
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    /// Post a task. Posts after shutdown are silently dropped.
    pub fn post(&self, task: Task) {
        let _ = self.tx.send(task);
    }

    pub fn wake(&self, session: SessionId) {
        self.post(Task::WakeSession(session));
    }

    pub fn run_on_executor(&self, f: impl FnOnce(&mut ExecutorCore) + Send + 'static) {
        self.post(Task::Post(Box::new(f)));
    }
}

#[derive(Debug, Clone, Copy)]
enum TimerTask {
    Proceed(usize),
    Wake(SessionId),
}

#[derive(Debug)]
struct TimerEntry {
    at_ms: u64,
    seq: u64,
    task: TimerTask,
}

// Min-heap: earliest deadline first, insertion order as tie-break.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .at_ms
            .cmp(&self.at_ms)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at_ms == other.at_ms && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

struct PhaseRuntime {
    instance: Arc<PhaseInstance>,
    arrival: ArrivalProcess,
}

/// State owned by the executor thread.
pub struct ExecutorCore {
    epoch: Instant,
    pool: SessionPool,
    thread_data: ThreadData,
    phases: Vec<PhaseRuntime>,
    timers: BinaryHeap<TimerEntry>,
    timer_seq: u64,
    parked: BTreeSet<SessionId>,
    handle: ExecutorHandle,
    client: Option<Arc<dyn ClientPool>>,
    stats: Arc<dyn StatsSink>,
}

impl ExecutorCore {
    pub fn new(
        benchmark: &Benchmark,
        instances: Vec<Arc<PhaseInstance>>,
        epoch: Instant,
        handle: ExecutorHandle,
        client: Option<Arc<dyn ClientPool>>,
        stats: Arc<dyn StatsSink>,
    ) -> Self {
        let mut pool = SessionPool::new();
        pool.reserve(benchmark.sessions_to_reserve() as usize, benchmark.var_count());

        let mut thread_data = ThreadData::new();
        for key in benchmark.counter_keys() {
            thread_data.reserve_counter(key);
        }
        for key in benchmark.queue_keys() {
            thread_data.reserve_queue(key);
        }

        let phases = instances
            .into_iter()
            .map(|instance| {
                let arrival = ArrivalProcess::for_phase(instance.def());
                PhaseRuntime { instance, arrival }
            })
            .collect();

        Self {
            epoch,
            pool,
            thread_data,
            phases,
            timers: BinaryHeap::new(),
            timer_seq: 0,
            parked: BTreeSet::new(),
            handle,
            client,
            stats,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Deliver an external integer completion to a session variable and
    /// re-tick it. Drops the write when the session was recycled since the
    /// completion was issued.
    pub fn complete_session_int(
        &mut self,
        sid: SessionId,
        generation: u64,
        var: VarIndex,
        value: i64,
    ) {
        let Some(session) = self.pool.get_mut(sid) else {
            return;
        };
        if session.generation() != generation || session.phase().is_none() {
            trace!(session = ?sid, "Dropping stale completion");
            return;
        }
        session.set_int(var, value);
        self.tick_session(sid);
    }

    fn handle_task(&mut self, task: Task) {
        match task {
            Task::StartPhase(idx) => self.start_phase(idx),
            Task::ProceedPhase(idx) => self.proceed_phase(idx),
            Task::WakeSession(sid) => {
                self.tick_session(sid);
            }
            Task::Post(f) => f(self),
            Task::Shutdown => {}
        }
    }

    fn start_phase(&mut self, idx: usize) {
        let instance = self.phases[idx].instance.clone();
        debug!(phase = %instance.name(), "Starting phase on executor");
        instance.start(self.now_ms());
        self.proceed_phase(idx);
    }

    /// One arrival tick. Open models self-schedule the next tick; burst
    /// models run once.
    fn proceed_phase(&mut self, idx: usize) {
        let instance = self.phases[idx].instance.clone();
        if instance.status().is_finished() {
            return;
        }
        let Some(start_ms) = instance.absolute_start_ms() else {
            return;
        };

        let arrival = self.phases[idx].arrival;
        match arrival {
            ArrivalProcess::AtOnce { users } | ArrivalProcess::Always { users } => {
                self.proceed_burst(idx, users);
            }
            ArrivalProcess::ConstantPerSec {
                users_per_sec,
                started_users,
            } => {
                let delta = self.now_ms().saturating_sub(start_ms);
                let required = constant_required(delta, users_per_sec);
                let Some(started) = self.open_loop_tick(idx, started_users, required) else {
                    return;
                };
                self.phases[idx].arrival = ArrivalProcess::ConstantPerSec {
                    users_per_sec,
                    started_users: started,
                };
                let next_delta = constant_next_delta(started, users_per_sec);
                trace!(
                    phase = %instance.name(),
                    delta,
                    started,
                    next_in_ms = next_delta.saturating_sub(delta),
                    "Arrival tick"
                );
                self.arm_proceed(idx, start_ms + next_delta);
            }
            ArrivalProcess::RampPerSec {
                initial_users_per_sec,
                target_users_per_sec,
                duration,
                started_users,
            } => {
                let delta = self.now_ms().saturating_sub(start_ms);
                let required =
                    ramp_required(delta, initial_users_per_sec, target_users_per_sec, duration);
                let Some(started) = self.open_loop_tick(idx, started_users, required) else {
                    return;
                };
                self.phases[idx].arrival = ArrivalProcess::RampPerSec {
                    initial_users_per_sec,
                    target_users_per_sec,
                    duration,
                    started_users: started,
                };
                let next_delta = ramp_next_delta(
                    started,
                    initial_users_per_sec,
                    target_users_per_sec,
                    duration,
                );
                trace!(
                    phase = %instance.name(),
                    delta,
                    started,
                    next_in_ms = next_delta.saturating_sub(delta),
                    "Arrival tick"
                );
                self.arm_proceed(idx, start_ms + next_delta.max(delta + 1));
            }
            ArrivalProcess::Sequentially { .. } => {
                debug_assert_eq!(instance.active_sessions(), 0);
                if !instance.try_start_session() {
                    return;
                }
                self.acquire_and_start(idx);
            }
        }
    }

    /// Burst start for the closed AtOnce/Always models: claim the whole
    /// population in one shot, then dispatch each session.
    fn proceed_burst(&mut self, idx: usize, users: u64) {
        let instance = self.phases[idx].instance.clone();
        debug_assert_eq!(instance.active_sessions(), 0);
        if users == 0 {
            instance.finish();
            return;
        }
        instance.set_active_sessions(users as i64);
        for _ in 0..users {
            self.acquire_and_start(idx);
        }
    }

    /// Start `required - started` new sessions, counting pool exhaustion as
    /// blocked users. Returns `None` when the phase finished mid-loop and the
    /// arrival must not reschedule itself.
    fn open_loop_tick(&mut self, idx: usize, started: u64, required: u64) -> Option<u64> {
        let instance = self.phases[idx].instance.clone();
        let mut emitted = started;
        while emitted < required {
            if !instance.try_start_session() {
                return None;
            }
            emitted += 1;
            self.acquire_and_start(idx);
        }
        Some(emitted)
    }

    /// Acquire a session for a phase whose active count already includes it,
    /// activate it, and run its first tick. Pool exhaustion is a saturation
    /// event: the virtual user is reported blocked and dropped.
    fn acquire_and_start(&mut self, idx: usize) {
        let instance = self.phases[idx].instance.clone();
        match self.pool.acquire() {
            Some(sid) => {
                let now = self.now_ms();
                let scenario = instance.def().scenario.clone();
                let session = self.pool.get_mut(sid).expect("acquired session exists");
                session.activate(idx, scenario, now);
                self.stats.session_started(instance.name());
                self.tick_session(sid);
            }
            None => {
                warn!(phase = %instance.name(), "Session pool exhausted, dropping virtual user");
                self.stats.session_blocked(instance.name());
                instance.session_done();
            }
        }
    }

    /// Run interpreter ticks for one session until it parks or ends,
    /// handling completion, failure, and closed-loop re-driving. Returns
    /// whether any step made progress.
    fn tick_session(&mut self, sid: SessionId) -> bool {
        let mut progressed = false;
        loop {
            let Some(mut session) = self.pool.take(sid) else {
                return progressed;
            };
            let Some(idx) = session.phase() else {
                // Stale wake for a session already back in the pool.
                self.pool.restore(sid, session);
                return progressed;
            };
            let instance = self.phases[idx].instance.clone();

            let now = self.now_ms();
            let result = if instance.status() == PhaseStatus::Terminating {
                // Hard stop: the session observes TERMINATING at its next
                // tick boundary and is torn down without running steps.
                TickResult::Terminated
            } else {
                let mut ctx = StepContext {
                    now_ms: now,
                    session_id: sid,
                    thread_data: &mut self.thread_data,
                    executor: &self.handle,
                    client: self.client.as_ref(),
                };
                session.tick(&mut ctx)
            };

            match result {
                TickResult::Parked { progressed: p } => {
                    progressed |= p;
                    if let Some(at) = session.next_wake() {
                        if session.armed_wake().map_or(true, |armed| at < armed) {
                            session.set_armed_wake(Some(at));
                            self.arm_wake(sid, at);
                        }
                    }
                    self.pool.restore(sid, session);
                    self.parked.insert(sid);
                    return progressed;
                }
                TickResult::Complete | TickResult::Terminated => {
                    progressed = true;
                    self.parked.remove(&sid);
                    self.stats
                        .session_finished(instance.name(), now.saturating_sub(session.started_at_ms()));
                    let completion = self.phases[idx].arrival.on_session_complete(instance.status());
                    match completion {
                        Completion::Redrive => {
                            session.reset();
                            session.activate(idx, instance.def().scenario.clone(), now);
                            self.stats.session_started(instance.name());
                            self.pool.restore(sid, session);
                            continue;
                        }
                        Completion::Release(end) => {
                            self.pool.restore(sid, session);
                            self.pool.release(sid);
                            match end {
                                PhaseEnd::Terminate => {
                                    instance.terminate();
                                    instance.session_done();
                                }
                                PhaseEnd::FinishWhenIdle => {
                                    // Natural completion only applies to
                                    // phases without a timed window; with a
                                    // duration set, the scheduler ends the
                                    // phase when the window elapses.
                                    if instance.session_done() == 0
                                        && instance.def().duration == 0
                                        && !instance.status().is_finished()
                                    {
                                        instance.finish();
                                    }
                                }
                                PhaseEnd::None => {
                                    instance.session_done();
                                }
                            }
                            return true;
                        }
                    }
                }
                TickResult::Failed(error) => {
                    self.parked.remove(&sid);
                    warn!(phase = %instance.name(), error = %error, "Session failed");
                    self.stats.session_failed(instance.name(), &error);
                    instance.fail(error);
                    self.pool.restore(sid, session);
                    self.pool.release(sid);
                    instance.session_done();
                    return true;
                }
            }
        }
    }

    /// Re-tick parked sessions until none makes progress. Called after any
    /// external activity, because a task or timer may have satisfied a park
    /// condition (a counter write, an HTTP completion variable).
    fn repoll_parked(&mut self) {
        loop {
            let snapshot: Vec<SessionId> = self.parked.iter().copied().collect();
            let mut any = false;
            for sid in snapshot {
                if self.parked.contains(&sid) {
                    any |= self.tick_session(sid);
                }
            }
            if !any {
                return;
            }
        }
    }

    fn arm_proceed(&mut self, idx: usize, at_ms: u64) {
        self.timer_seq += 1;
        self.timers.push(TimerEntry {
            at_ms,
            seq: self.timer_seq,
            task: TimerTask::Proceed(idx),
        });
    }

    fn arm_wake(&mut self, sid: SessionId, at_ms: u64) {
        self.timer_seq += 1;
        self.timers.push(TimerEntry {
            at_ms,
            seq: self.timer_seq,
            task: TimerTask::Wake(sid),
        });
    }

    /// Fire every ripe timer in deadline order. Returns whether any fired.
    fn fire_ripe_timers(&mut self) -> bool {
        let mut fired = false;
        loop {
            let now = self.now_ms();
            match self.timers.peek() {
                Some(entry) if entry.at_ms <= now => {}
                _ => return fired,
            }
            let entry = self.timers.pop().unwrap();
            fired = true;
            match entry.task {
                TimerTask::Proceed(idx) => self.proceed_phase(idx),
                TimerTask::Wake(sid) => {
                    if let Some(session) = self.pool.get_mut(sid) {
                        if session.armed_wake() == Some(entry.at_ms) {
                            session.set_armed_wake(None);
                        }
                    }
                    self.tick_session(sid);
                }
            }
        }
    }

    fn next_timer_deadline(&self) -> Option<u64> {
        self.timers.peek().map(|entry| entry.at_ms)
    }
}

/// Running executor: the event-loop thread plus its handle.
pub struct Executor {
    handle: ExecutorHandle,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Executor {
    /// Spawn the executor thread for a benchmark's phases.
    pub fn spawn(
        benchmark: &Benchmark,
        instances: Vec<Arc<PhaseInstance>>,
        epoch: Instant,
        client: Option<Arc<dyn ClientPool>>,
        stats: Arc<dyn StatsSink>,
    ) -> std::io::Result<Executor> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ExecutorHandle::new(tx);
        let core = ExecutorCore::new(benchmark, instances, epoch, handle.clone(), client, stats);
        let thread = std::thread::Builder::new()
            .name("volley-executor".to_string())
            .spawn(move || run_loop(core, rx))?;
        Ok(Executor {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> &ExecutorHandle {
        &self.handle
    }

    /// Stop the event loop and join the thread.
    pub fn shutdown(mut self) {
        self.handle.post(Task::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run_loop(mut core: ExecutorCore, mut rx: UnboundedReceiver<Task>) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("executor runtime");

    runtime.block_on(async move {
        loop {
            // Drain everything already queued, then fire ripe timers.
            let mut activity = false;
            loop {
                match rx.try_recv() {
                    Ok(Task::Shutdown) => return,
                    Ok(task) => {
                        core.handle_task(task);
                        activity = true;
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return,
                }
            }
            if core.fire_ripe_timers() {
                activity = true;
            }
            if activity {
                core.repoll_parked();
                continue;
            }

            // Idle: sleep until the next timer deadline or the next task.
            match core.next_timer_deadline() {
                Some(at_ms) => {
                    let deadline = tokio::time::Instant::from_std(
                        core.epoch + Duration::from_millis(at_ms),
                    );
                    tokio::select! {
                        task = rx.recv() => match task {
                            Some(Task::Shutdown) | None => return,
                            Some(task) => {
                                core.handle_task(task);
                                core.repoll_parked();
                            }
                        },
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => match rx.recv().await {
                    Some(Task::Shutdown) | None => return,
                    Some(task) => {
                        core.handle_task(task);
                        core.repoll_parked();
                    }
                },
            }
        }
    });
}
