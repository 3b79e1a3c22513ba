mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{primary, throttled, FakeFactory, FakeService, PRIMARY_ENDPOINT, SECONDARY_ENDPOINT};
use hastream::{
    ConsumerLoop, ConsumerSettings, ControllerConfig, CursorState, Error, FailoverController,
    FailoverState, MemoryRegistry, Message, PollOutcome, RecordingSleeper, Role, ShutdownFlag,
    Slot, TargetRef,
};

fn consumer(
    svc: &FakeService,
    registry: &MemoryRegistry,
    sleeper: &RecordingSleeper,
) -> ConsumerLoop<FakeFactory> {
    let controller = FailoverController::new(
        Role::Consumer,
        primary(),
        svc.factory(),
        Arc::new(registry.clone()),
        ControllerConfig::default(),
    )
    .expect("controller")
    .with_sleeper(Arc::new(sleeper.clone()));
    ConsumerLoop::new(controller, ConsumerSettings::default())
        .with_sleeper(Arc::new(sleeper.clone()))
}

fn collect(
    consumer: &mut ConsumerLoop<FakeFactory>,
) -> (hastream::Result<PollOutcome>, Vec<String>) {
    let mut seen = Vec::new();
    let outcome = consumer.poll_once(&mut |_target: &TargetRef, message: &Message| {
        seen.push(String::from_utf8_lossy(&message.value).into_owned());
    });
    (outcome, seen)
}

#[test]
fn emits_messages_in_arrival_order() {
    let svc = FakeService::new();
    for value in ["a", "b", "c"] {
        svc.push_message(&primary(), value);
    }
    let sleeper = RecordingSleeper::new();
    let mut consumer = consumer(&svc, &MemoryRegistry::new(), &sleeper);

    let (outcome, seen) = collect(&mut consumer);
    assert_eq!(outcome.expect("poll"), PollOutcome::Delivered(3));
    assert_eq!(seen, vec!["a", "b", "c"]);

    let opened = svc.calls_of("create_cursor");
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].detail, "0:TrimHorizon");
    assert_eq!(
        consumer.cursor(),
        Some(&CursorState {
            target: primary(),
            cursor: "primary-stream@3".to_string()
        })
    );
}

#[test]
fn single_throttle_is_retried_without_failover() {
    let svc = FakeService::new();
    svc.push_message(&primary(), "a");
    let registry = MemoryRegistry::new();
    let sleeper = RecordingSleeper::new();
    let mut consumer = consumer(&svc, &registry, &sleeper);

    svc.fail_next(PRIMARY_ENDPOINT, "fetch", vec![throttled()]);
    let (outcome, seen) = collect(&mut consumer);

    assert_eq!(outcome.expect("poll"), PollOutcome::Delivered(1));
    assert_eq!(seen, vec!["a"]);
    assert_eq!(sleeper.recorded(), vec![Duration::from_millis(1000)]);
    assert_eq!(consumer.controller().state(), FailoverState::OnPrimary);
    assert!(svc.calls_of("create_target").is_empty());
}

#[test]
fn empty_fetch_is_not_an_error() {
    let svc = FakeService::new();
    let sleeper = RecordingSleeper::new();
    let mut consumer = consumer(&svc, &MemoryRegistry::new(), &sleeper);

    let (outcome, seen) = collect(&mut consumer);
    assert_eq!(outcome.expect("poll"), PollOutcome::Delivered(0));
    assert!(seen.is_empty());
    assert_eq!(
        consumer.cursor().map(|c| c.cursor.as_str()),
        Some("primary-stream@0")
    );

    let (outcome, _) = collect(&mut consumer);
    assert_eq!(outcome.expect("poll"), PollOutcome::Delivered(0));
    assert_eq!(svc.calls_of("create_cursor").len(), 1);
}

#[test]
fn failover_restarts_from_trim_horizon_on_new_target() {
    let svc = FakeService::new();
    let secondary = TargetRef::new("secondary-x", SECONDARY_ENDPOINT);
    svc.add_stream(&secondary);
    svc.push_message(&primary(), "p1");
    svc.push_message(&secondary, "s1");
    svc.push_message(&secondary, "s2");
    let registry = MemoryRegistry::new();
    let sleeper = RecordingSleeper::new();
    let mut consumer = consumer(&svc, &registry, &sleeper);

    let (outcome, _) = collect(&mut consumer);
    assert_eq!(outcome.expect("poll"), PollOutcome::Delivered(1));

    hastream::FailoverRegistry::store(&registry, Slot::Secondary, &secondary).expect("store");
    svc.set_down(PRIMARY_ENDPOINT, true);
    sleeper.clear();

    let (outcome, seen) = collect(&mut consumer);
    assert_eq!(
        outcome.expect("poll"),
        PollOutcome::CursorReset {
            target: secondary.clone()
        }
    );
    assert!(seen.is_empty());
    assert_eq!(consumer.cursor(), None);
    assert_eq!(
        sleeper.recorded(),
        vec![
            Duration::from_millis(1000),
            Duration::from_millis(2000),
            Duration::from_millis(4000)
        ]
    );

    let (outcome, seen) = collect(&mut consumer);
    assert_eq!(outcome.expect("poll"), PollOutcome::Delivered(2));
    assert_eq!(seen, vec!["s1", "s2"]);

    let opened = svc.calls_of("create_cursor");
    let last_open = opened.last().expect("cursor opened");
    assert_eq!(last_open.endpoint, SECONDARY_ENDPOINT);
    assert_eq!(last_open.detail, "0:TrimHorizon");
    let secondary_fetches: Vec<_> = svc
        .calls_of("fetch")
        .into_iter()
        .filter(|c| c.endpoint == SECONDARY_ENDPOINT)
        .collect();
    assert_eq!(secondary_fetches[0].detail, "secondary-x@0");
    assert!(svc.calls_of("create_target").is_empty());
}

#[test]
fn unregistered_secondary_keeps_cursor_on_primary() {
    let svc = FakeService::new();
    svc.push_message(&primary(), "a");
    let sleeper = RecordingSleeper::new();
    let mut consumer = consumer(&svc, &MemoryRegistry::new(), &sleeper);
    collect(&mut consumer).0.expect("first poll");

    svc.set_down(PRIMARY_ENDPOINT, true);
    let (outcome, _) = collect(&mut consumer);
    assert!(matches!(outcome, Err(Error::Resolution(_))));
    assert_eq!(
        consumer.cursor().map(|c| c.cursor.as_str()),
        Some("primary-stream@1")
    );

    svc.set_down(PRIMARY_ENDPOINT, false);
    svc.push_message(&primary(), "b");
    let (outcome, seen) = collect(&mut consumer);
    assert_eq!(outcome.expect("poll"), PollOutcome::Delivered(1));
    assert_eq!(seen, vec!["b"]);
    assert_eq!(svc.calls_of("create_cursor").len(), 1);
}

#[test]
fn run_stops_after_current_iteration() {
    let svc = FakeService::new();
    svc.push_message(&primary(), "only");
    let sleeper = RecordingSleeper::new();
    let mut consumer = consumer(&svc, &MemoryRegistry::new(), &sleeper);
    let shutdown = ShutdownFlag::new();

    let stop = shutdown.clone();
    let mut seen = Vec::new();
    let report = consumer.run(&shutdown, &mut |_target: &TargetRef, message: &Message| {
        seen.push(message.value.clone());
        stop.raise();
    });

    assert_eq!(report.polls, 1);
    assert_eq!(report.delivered, 1);
    assert_eq!(seen, vec![b"only".to_vec()]);
    assert_eq!(sleeper.recorded(), vec![Duration::from_secs(10)]);
}
