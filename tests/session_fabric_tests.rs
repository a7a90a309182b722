//! Shared-state fabric and session wake behavior: counters crossing
//! co-located phases, template sequences, and HTTP completions re-entering
//! the executor.

use std::sync::Arc;
use std::time::Duration;

use volley::client::{ClientPool, HttpRequest, HttpResponse, ResponseCallback};
use volley::phase::{ArrivalSpec, Phase};
use volley::scenario::{Registry, Scenario, Sequence};
use volley::steps::{
    AddSharedCounterStep, AwaitSharedCounterStep, DelayStep, DelayTime, HttpRequestStep,
    IntCondition, IntSource, NewSequenceStep, PollSharedQueueStep, PushSharedQueueStep,
    SetIntStep, SetSharedCounterStep,
};
use volley::{Benchmark, BenchmarkOutcome, BenchmarkRunner};

#[test]
fn test_counter_write_wakes_parked_session_in_other_phase() {
    let mut registry = Registry::new();

    // "setter" waits 30ms, then opens the gate.
    let setter = Arc::new(Scenario::new(
        "setter",
        vec![Sequence::new(
            "main",
            vec![
                Arc::new(DelayStep::new(
                    &mut registry,
                    DelayTime::Fixed(Duration::from_millis(30)),
                )),
                Arc::new(SetSharedCounterStep::new(
                    &mut registry,
                    "gate",
                    IntSource::Value(1),
                )),
            ],
        )],
    ));

    // "waiter" parks on the gate, then bumps a completion counter.
    let waiter = Arc::new(Scenario::new(
        "waiter",
        vec![Sequence::new(
            "main",
            vec![
                Arc::new(AwaitSharedCounterStep::new(
                    &mut registry,
                    "gate",
                    IntCondition::GreaterOrEqualTo(1),
                )),
                Arc::new(AddSharedCounterStep::new(&mut registry, "woken", 1)),
            ],
        )],
    ));

    let benchmark = Benchmark::builder("wake")
        .phase(Phase::new("setter", setter, ArrivalSpec::AtOnce { users: 1 }))
        .phase(Phase::new("waiter", waiter, ArrivalSpec::AtOnce { users: 1 }))
        .build(registry)
        .unwrap();

    let report = BenchmarkRunner::new(benchmark).run().unwrap();

    assert_eq!(report.outcome, BenchmarkOutcome::Completed);
    assert_eq!(report.stats.finished_count("waiter"), 1);
    // The waiter resumed promptly after the gate opened; the whole run is
    // bounded by the 30ms delay plus wake latency.
    assert!(
        report.elapsed_ms < 1000,
        "parked session resumed too slowly: {}ms",
        report.elapsed_ms
    );
}

#[test]
fn test_shared_queue_hands_work_between_sessions() {
    let mut registry = Registry::new();
    let item = registry.var("item");
    let received = registry.var("received");

    let producer = Arc::new(Scenario::new(
        "producer",
        vec![Sequence::new(
            "main",
            vec![
                Arc::new(SetIntStep::new(item, IntSource::Value(7))),
                Arc::new(PushSharedQueueStep::new(&mut registry, "work", item)),
            ],
        )],
    ));

    let consumer = Arc::new(Scenario::new(
        "consumer",
        vec![Sequence::new(
            "main",
            vec![
                Arc::new(PollSharedQueueStep::new(&mut registry, "work", received)),
                Arc::new(AddSharedCounterStep::new(&mut registry, "consumed", 1)),
            ],
        )],
    ));

    let benchmark = Benchmark::builder("queue")
        .phase(Phase::new("consumer", consumer, ArrivalSpec::AtOnce { users: 1 }))
        .phase(Phase::new("producer", producer, ArrivalSpec::AtOnce { users: 1 }))
        .build(registry)
        .unwrap();

    let report = BenchmarkRunner::new(benchmark).run().unwrap();

    assert_eq!(report.outcome, BenchmarkOutcome::Completed);
    assert_eq!(report.stats.finished_count("consumer"), 1);
    assert_eq!(report.stats.finished_count("producer"), 1);
}

#[test]
fn test_template_sequence_runs_on_same_session() {
    let mut registry = Registry::new();

    let main = Sequence::new(
        "main",
        vec![
            Arc::new(NewSequenceStep::new("side")),
            // The template runs on this session, so its counter write is
            // visible before the phase can complete.
            Arc::new(AwaitSharedCounterStep::new(
                &mut registry,
                "side-done",
                IntCondition::EqualTo(1),
            )),
        ],
    );
    let side = Sequence::new(
        "side",
        vec![Arc::new(AddSharedCounterStep::new(
            &mut registry,
            "side-done",
            1,
        ))],
    );
    let scenario = Arc::new(Scenario::new("templated", vec![main]).with_template(side));

    let benchmark = Benchmark::builder("templates")
        .phase(Phase::new("templated", scenario, ArrivalSpec::AtOnce { users: 1 }))
        .build(registry)
        .unwrap();

    let report = BenchmarkRunner::new(benchmark).run().unwrap();

    assert_eq!(report.outcome, BenchmarkOutcome::Completed);
    assert_eq!(report.stats.finished_count("templated"), 1);
}

/// Transport stub that answers every request with 200 from a separate
/// thread after a short delay, mimicking a real client pool's callback
/// threading.
struct StubClient;

impl ClientPool for StubClient {
    fn submit(&self, _request: HttpRequest, on_response: ResponseCallback) {
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(15));
            on_response(Ok(HttpResponse {
                status: 200,
                body: "ok".to_string(),
            }));
        });
    }
}

#[test]
fn test_http_completion_posts_back_to_executor() {
    let mut registry = Registry::new();
    let scenario = Arc::new(Scenario::new(
        "http",
        vec![Sequence::new(
            "main",
            vec![
                Arc::new(HttpRequestStep::new(
                    &mut registry,
                    "GET",
                    "http://localhost/health",
                    "status",
                )),
                Arc::new(AddSharedCounterStep::new(&mut registry, "responses", 1)),
            ],
        )],
    ));

    let benchmark = Benchmark::builder("http")
        .phase(Phase::new("http", scenario, ArrivalSpec::AtOnce { users: 4 }))
        .build(registry)
        .unwrap();

    let report = BenchmarkRunner::new(benchmark)
        .with_client(Arc::new(StubClient))
        .run()
        .unwrap();

    assert_eq!(report.outcome, BenchmarkOutcome::Completed);
    assert_eq!(report.stats.started_count("http"), 4);
    assert_eq!(report.stats.finished_count("http"), 4);
    assert_eq!(report.stats.failed_count("http"), 0);
}

/// Transport stub that always fails.
struct BrokenClient;

impl ClientPool for BrokenClient {
    fn submit(&self, _request: HttpRequest, on_response: ResponseCallback) {
        std::thread::spawn(move || {
            on_response(Err("connection refused".to_string()));
        });
    }
}

#[test]
fn test_transport_error_fails_the_phase() {
    let mut registry = Registry::new();
    let scenario = Arc::new(Scenario::new(
        "http",
        vec![Sequence::new(
            "main",
            vec![Arc::new(HttpRequestStep::new(
                &mut registry,
                "GET",
                "http://localhost/health",
                "status",
            ))],
        )],
    ));

    let benchmark = Benchmark::builder("broken")
        .phase(Phase::new("http", scenario, ArrivalSpec::AtOnce { users: 1 }))
        .build(registry)
        .unwrap();

    let report = BenchmarkRunner::new(benchmark)
        .with_client(Arc::new(BrokenClient))
        .run()
        .unwrap();

    assert_eq!(report.outcome, BenchmarkOutcome::Failed);
    assert_eq!(report.stats.failed_count("http"), 1);
    assert_eq!(report.phase_errors.len(), 1);
}
