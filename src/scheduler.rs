//! Global phase scheduler.
//!
//! The scheduler owns every phase instance of one benchmark and runs on its
//! own thread. On each pass it starts phases whose dependencies are
//! satisfied, finishes phases whose duration elapsed, terminates phases past
//! their max-duration safety valve, and tears down finished phases whose
//! strict termination dependencies drained. Between passes it sleeps on the
//! shared status condition variable, bounded by the nearest upcoming
//! deadline; every phase status transition signals it. The loop exits when
//! all phases are TERMINATED.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::executor::{ExecutorHandle, Task};
use crate::phase_instance::{PhaseInstance, PhaseStatus, StatusSignal};

pub struct PhaseScheduler {
    instances: Vec<Arc<PhaseInstance>>,
    index_by_name: HashMap<String, usize>,
    executor: ExecutorHandle,
    signal: Arc<StatusSignal>,
    epoch: Instant,
}

impl PhaseScheduler {
    pub fn new(
        instances: Vec<Arc<PhaseInstance>>,
        executor: ExecutorHandle,
        signal: Arc<StatusSignal>,
        epoch: Instant,
    ) -> Self {
        let index_by_name = instances
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name().to_string(), i))
            .collect();
        Self {
            instances,
            index_by_name,
            executor,
            signal,
            epoch,
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Drive all phases to TERMINATED. Blocks the calling thread.
    pub fn run(&self) {
        info!(phases = self.instances.len(), "Phase scheduler starting");
        loop {
            let seen = self.signal.generation();
            let now = self.now_ms();
            let mut next_deadline: Option<u64> = None;
            let mut track = |deadline: u64, slot: &mut Option<u64>| {
                *slot = Some(slot.map_or(deadline, |d| d.min(deadline)));
            };

            for (i, phase) in self.instances.iter().enumerate() {
                let def = phase.def().clone();
                match phase.status() {
                    PhaseStatus::NotStarted => {
                        if self.ready(phase, now) {
                            if phase.mark_starting() {
                                debug!(phase = %phase.name(), "Dispatching phase start");
                                self.executor.post(Task::StartPhase(i));
                            }
                        } else if let Some(start_time) = def.start_time {
                            if start_time > now {
                                track(start_time, &mut next_deadline);
                            }
                        }
                    }
                    PhaseStatus::Starting => {}
                    PhaseStatus::Running => {
                        let Some(start) = phase.absolute_start_ms() else {
                            continue;
                        };
                        if def.duration > 0 {
                            let finish_at = start + def.duration;
                            if now >= finish_at {
                                phase.finish();
                            } else {
                                track(finish_at, &mut next_deadline);
                            }
                        }
                        self.enforce_max_duration(i, phase, start, now, &mut next_deadline, &mut track);
                    }
                    PhaseStatus::Finished => {
                        if !def.terminate_after_strict.is_empty()
                            && self.all_terminated(&def.terminate_after_strict)
                        {
                            self.terminate_phase(i, phase);
                        }
                        // The safety valve still applies to a finished phase
                        // whose sessions never drain.
                        if let Some(start) = phase.absolute_start_ms() {
                            self.enforce_max_duration(i, phase, start, now, &mut next_deadline, &mut track);
                        }
                    }
                    PhaseStatus::Terminating | PhaseStatus::Terminated => {}
                }
            }

            if self
                .instances
                .iter()
                .all(|p| p.status().is_terminated())
            {
                info!("All phases terminated, scheduler exiting");
                return;
            }

            let timeout = next_deadline
                .map(|d| Duration::from_millis(d.saturating_sub(self.now_ms()).max(1)));
            self.signal.wait_past(seen, timeout);
        }
    }

    fn enforce_max_duration(
        &self,
        index: usize,
        phase: &Arc<PhaseInstance>,
        start: u64,
        now: u64,
        next_deadline: &mut Option<u64>,
        track: &mut impl FnMut(u64, &mut Option<u64>),
    ) {
        let Some(max_duration) = phase.def().max_duration else {
            return;
        };
        let terminate_at = start + max_duration;
        if now >= terminate_at {
            debug!(phase = %phase.name(), "Max duration exceeded");
            self.terminate_phase(index, phase);
        } else {
            track(terminate_at, next_deadline);
        }
    }

    /// Terminate a phase and nudge its executor so parked sessions observe
    /// TERMINATING and are torn down promptly.
    fn terminate_phase(&self, index: usize, phase: &Arc<PhaseInstance>) {
        phase.terminate();
        self.executor.post(Task::ProceedPhase(index));
    }

    /// A NOT_STARTED phase is ready once every `start_after` dependency is at
    /// least FINISHED, every `start_after_strict` dependency is TERMINATED,
    /// and its absolute start time has passed.
    fn ready(&self, phase: &PhaseInstance, now: u64) -> bool {
        let def = phase.def();
        if let Some(start_time) = def.start_time {
            if now < start_time {
                return false;
            }
        }
        for dep in &def.start_after {
            if !self.status_of(dep).is_finished() {
                return false;
            }
        }
        for dep in &def.start_after_strict {
            if !self.status_of(dep).is_terminated() {
                return false;
            }
        }
        true
    }

    fn all_terminated(&self, names: &[String]) -> bool {
        names.iter().all(|n| self.status_of(n).is_terminated())
    }

    fn status_of(&self, name: &str) -> PhaseStatus {
        // Dependency names were validated at build time.
        self.instances[self.index_by_name[name]].status()
    }
}
