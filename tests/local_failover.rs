use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hastream::client::local::{self, LocalAdminClient, LocalClientFactory};
use hastream::{
    AdminClient, ConsumerLoop, ConsumerSettings, ControllerConfig, FailoverController,
    FailoverRegistry, FailoverState, FileRegistry, Message, PollOutcome, ProducerLoop,
    ProducerSettings, RecordingSleeper, RetryPolicy, Role, Slot, TargetRef,
};
use tempfile::tempdir;

fn endpoint(dir: &Path) -> String {
    format!("file://{}", dir.display())
}

fn fast_config() -> ControllerConfig {
    ControllerConfig {
        retry: RetryPolicy::new(2, Duration::from_millis(1)),
        resolve_delay: Duration::from_millis(1),
        ..ControllerConfig::default()
    }
}

#[test]
fn consumer_follows_producer_through_shared_registry() {
    let dir = tempdir().expect("tempdir");
    let primary_dir = dir.path().join("primary");
    let secondary_dir = dir.path().join("secondary");
    fs::create_dir_all(&primary_dir).expect("mkdir");
    fs::create_dir_all(&secondary_dir).expect("mkdir");
    let primary_endpoint = endpoint(&primary_dir);
    let secondary_endpoint = endpoint(&secondary_dir);
    let primary = local::create_stream(&primary_endpoint, "orders", "orders", 1).expect("primary");
    let registry_path = dir.path().join("registry").join("stream.properties");
    let sleeper = RecordingSleeper::new();

    let producer_controller = FailoverController::new(
        Role::Producer,
        primary.clone(),
        LocalClientFactory,
        Arc::new(FileRegistry::new(&registry_path)),
        fast_config(),
    )
    .expect("producer controller")
    .with_admin(LocalAdminClient::new(&secondary_endpoint))
    .with_sleeper(Arc::new(sleeper.clone()));
    let mut producer = ProducerLoop::new(producer_controller, ProducerSettings::default())
        .with_sleeper(Arc::new(sleeper.clone()));

    let consumer_controller = FailoverController::new(
        Role::Consumer,
        primary.clone(),
        LocalClientFactory,
        Arc::new(FileRegistry::new(&registry_path)),
        fast_config(),
    )
    .expect("consumer controller")
    .with_sleeper(Arc::new(sleeper.clone()));
    let mut consumer = ConsumerLoop::new(consumer_controller, ConsumerSettings::default())
        .with_sleeper(Arc::new(sleeper.clone()));

    let mut seen: Vec<String> = Vec::new();
    let mut sink = |_target: &TargetRef, message: &Message| {
        seen.push(String::from_utf8_lossy(&message.value).into_owned());
    };

    assert!(producer.send(b"on-primary").is_delivered());
    assert_eq!(consumer.poll_once(&mut sink).expect("poll"), PollOutcome::Delivered(1));

    local::mark_down(&primary_endpoint).expect("primary down");

    assert!(consumer.poll_once(&mut sink).is_err());
    assert_eq!(consumer.controller().state(), FailoverState::OnPrimary);

    assert!(producer.send(b"on-secondary").is_delivered());
    assert_eq!(producer.controller().state(), FailoverState::OnSecondary);
    let secondary = producer.controller().active_target().clone();
    assert_eq!(secondary.endpoint, secondary_endpoint);

    let registry = FileRegistry::new(&registry_path);
    assert_eq!(
        registry.load(Slot::Secondary).expect("load"),
        Some(secondary.clone())
    );
    let contents = fs::read_to_string(&registry_path).expect("registry file");
    assert!(contents.starts_with('#'));

    assert_eq!(
        consumer.poll_once(&mut sink).expect("poll"),
        PollOutcome::CursorReset {
            target: secondary.clone()
        }
    );
    assert_eq!(consumer.poll_once(&mut sink).expect("poll"), PollOutcome::Delivered(1));
    assert_eq!(seen, vec!["on-primary", "on-secondary"]);
}

#[test]
fn second_producer_reuses_registered_secondary() {
    let dir = tempdir().expect("tempdir");
    let primary_dir = dir.path().join("primary");
    let secondary_dir = dir.path().join("secondary");
    fs::create_dir_all(&secondary_dir).expect("mkdir");
    let primary_endpoint = endpoint(&primary_dir);
    let secondary_endpoint = endpoint(&secondary_dir);
    let primary = local::create_stream(&primary_endpoint, "orders", "orders", 1).expect("primary");
    local::mark_down(&primary_endpoint).expect("primary down");
    let registry_path = dir.path().join("stream.properties");

    let build = || {
        FailoverController::new(
            Role::Producer,
            primary.clone(),
            LocalClientFactory,
            Arc::new(FileRegistry::new(&registry_path)),
            fast_config(),
        )
        .expect("controller")
        .with_admin(LocalAdminClient::new(&secondary_endpoint).omit_identifiers(true))
        .with_sleeper(Arc::new(RecordingSleeper::new()))
    };

    let mut first = ProducerLoop::new(build(), ProducerSettings::default())
        .with_sleeper(Arc::new(RecordingSleeper::new()));
    assert!(first.send(b"one").is_delivered());

    let mut second = ProducerLoop::new(build(), ProducerSettings::default())
        .with_sleeper(Arc::new(RecordingSleeper::new()));
    assert!(second.send(b"two").is_delivered());

    assert_eq!(
        first.controller().active_target(),
        second.controller().active_target()
    );
    let listed = LocalAdminClient::new(&secondary_endpoint)
        .list_targets("OCI-SECONDARY-STREAM")
        .expect("list");
    assert_eq!(listed.len(), 1);
}
