//! Inter-phase dependency handling: start-after ordering, strict
//! termination dependencies, and absolute start times.

use std::sync::Arc;
use std::time::Duration;

use volley::phase::{ArrivalSpec, Phase};
use volley::phase_instance::PhaseStatus;
use volley::scenario::{Registry, Scenario, Sequence};
use volley::steps::{AddSharedCounterStep, AwaitIntStep, DelayStep, DelayTime};
use volley::{Benchmark, BenchmarkOutcome, BenchmarkRunner};

fn delay_then_count(registry: &mut Registry, delay_ms: u64, counter: &str) -> Arc<Scenario> {
    Arc::new(Scenario::new(
        "delayed",
        vec![Sequence::new(
            "main",
            vec![
                Arc::new(DelayStep::new(
                    registry,
                    DelayTime::Fixed(Duration::from_millis(delay_ms)),
                )),
                Arc::new(AddSharedCounterStep::new(registry, counter, 1)),
            ],
        )],
    ))
}

#[test]
fn test_start_after_waits_for_finished_dependency() {
    let mut registry = Registry::new();
    let first = delay_then_count(&mut registry, 30, "first-done");
    let second = delay_then_count(&mut registry, 5, "second-done");
    let benchmark = Benchmark::builder("ordered")
        .phase(
            Phase::new("first", first, ArrivalSpec::AtOnce { users: 1 }).with_duration(60),
        )
        .phase(
            Phase::new("second", second, ArrivalSpec::AtOnce { users: 1 })
                .with_start_after("first"),
        )
        .build(registry)
        .unwrap();

    let report = BenchmarkRunner::new(benchmark).run().unwrap();

    assert_eq!(report.outcome, BenchmarkOutcome::Completed);

    let first_finished = report.stats.status_times("first", PhaseStatus::Finished)[0];
    let second_running = report.stats.status_times("second", PhaseStatus::Running)[0];
    assert!(
        second_running >= first_finished,
        "second started at {second_running}ms before first finished at {first_finished}ms"
    );
}

#[test]
fn test_start_after_strict_waits_for_terminated_dependency() {
    let mut registry = Registry::new();
    // Always keeps re-driving 10ms sessions; at the 60ms window end the
    // in-flight session still has to drain before TERMINATED.
    let first = delay_then_count(&mut registry, 10, "first-done");
    let second = delay_then_count(&mut registry, 5, "second-done");
    let benchmark = Benchmark::builder("strict")
        .phase(
            Phase::new("first", first, ArrivalSpec::Always { users: 1 }).with_duration(60),
        )
        .phase(
            Phase::new("second", second, ArrivalSpec::AtOnce { users: 1 })
                .with_start_after_strict("first"),
        )
        .build(registry)
        .unwrap();

    let report = BenchmarkRunner::new(benchmark).run().unwrap();

    assert_eq!(report.outcome, BenchmarkOutcome::Completed);

    let first_terminated = report.stats.status_times("first", PhaseStatus::Terminated)[0];
    let second_running = report.stats.status_times("second", PhaseStatus::Running)[0];
    assert!(
        second_running >= first_terminated,
        "strict dependent started at {second_running}ms before dependency terminated at {first_terminated}ms"
    );
}

#[test]
fn test_start_time_holds_phase_back() {
    let mut registry = Registry::new();
    let scenario = delay_then_count(&mut registry, 1, "done");
    let benchmark = Benchmark::builder("offset")
        .phase(
            Phase::new("late", scenario, ArrivalSpec::AtOnce { users: 1 }).with_start_time(80),
        )
        .build(registry)
        .unwrap();

    let report = BenchmarkRunner::new(benchmark).run().unwrap();

    let running_at = report.stats.status_times("late", PhaseStatus::Running)[0];
    assert!(
        running_at >= 80,
        "phase started at {running_at}ms despite a startTime of 80ms"
    );
}

#[test]
fn test_terminate_after_strict_tears_down_finished_phase() {
    let mut registry = Registry::new();
    // "lingering" finishes its window with a parked session that would never
    // complete on its own; it is torn down once "quick" terminates.
    let never = registry.var("never-set");
    let lingering = Arc::new(Scenario::new(
        "lingering",
        vec![Sequence::new(
            "main",
            vec![Arc::new(AwaitIntStep::new(never, None))],
        )],
    ));
    let quick = delay_then_count(&mut registry, 20, "quick-done");

    let benchmark = Benchmark::builder("teardown")
        .phase(
            Phase::new("lingering", lingering, ArrivalSpec::AtOnce { users: 1 })
                .with_duration(30)
                .with_terminate_after_strict("quick"),
        )
        .phase(Phase::new("quick", quick, ArrivalSpec::AtOnce { users: 1 }))
        .build(registry)
        .unwrap();

    let report = BenchmarkRunner::new(benchmark).run().unwrap();

    assert_eq!(report.outcome, BenchmarkOutcome::Completed);

    let quick_terminated = report.stats.status_times("quick", PhaseStatus::Terminated)[0];
    let lingering_terminated = report.stats.status_times("lingering", PhaseStatus::Terminated)[0];
    assert!(
        lingering_terminated >= quick_terminated,
        "lingering terminated at {lingering_terminated}ms before quick at {quick_terminated}ms"
    );
    // The parked session was swept, not completed by its own steps.
    assert_eq!(report.stats.finished_count("lingering"), 1);
}

#[test]
fn test_wall_times_increase_monotonically_across_dependent_phases() {
    let mut registry = Registry::new();
    let a = delay_then_count(&mut registry, 10, "a-done");
    let b = delay_then_count(&mut registry, 10, "b-done");
    let c = delay_then_count(&mut registry, 10, "c-done");
    let benchmark = Benchmark::builder("chain")
        .phase(Phase::new("a", a, ArrivalSpec::AtOnce { users: 1 }))
        .phase(Phase::new("b", b, ArrivalSpec::AtOnce { users: 1 }).with_start_after("a"))
        .phase(Phase::new("c", c, ArrivalSpec::AtOnce { users: 1 }).with_start_after("b"))
        .build(registry)
        .unwrap();

    let report = BenchmarkRunner::new(benchmark).run().unwrap();

    assert_eq!(report.outcome, BenchmarkOutcome::Completed);
    let a_finished = report.stats.status_times("a", PhaseStatus::Finished)[0];
    let b_running = report.stats.status_times("b", PhaseStatus::Running)[0];
    let b_finished = report.stats.status_times("b", PhaseStatus::Finished)[0];
    let c_running = report.stats.status_times("c", PhaseStatus::Running)[0];

    assert!(a_finished <= b_running);
    assert!(b_running <= b_finished);
    assert!(b_finished <= c_running);
}
