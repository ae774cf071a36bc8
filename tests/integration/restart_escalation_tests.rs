//! Health escalation: crash detection, bounded auto-restart, and the
//! chronic-failure cutoff.
//!
//! Workers run `/bin/true`, which exits immediately, so every probe after
//! a short settle period observes a crash.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;
use tokio::sync::mpsc;

use botfoundry::billing::BillingEngine;
use botfoundry::config::GlobalConfig;
use botfoundry::coordinator::Coordinator;
use botfoundry::locks::InstanceLocks;
use botfoundry::models::instance::{BotInstance, LifecycleState};
use botfoundry::monitor::{HealthEvent, HealthMonitor, MonitorState};
use botfoundry::notify::{NotificationKind, Notifier, RecordingNotifier};
use botfoundry::persistence::{db, instance_repo::InstanceRepo};
use botfoundry::supervisor::{workspace, ProcessSupervisor};

struct Stack {
    coordinator: Arc<Coordinator>,
    supervisor: Arc<ProcessSupervisor>,
    monitor: HealthMonitor,
    events: mpsc::Receiver<HealthEvent>,
    instance_repo: InstanceRepo,
    notifier: Arc<RecordingNotifier>,
    config: Arc<GlobalConfig>,
    _temp: tempfile::TempDir,
}

async fn stack(worker_command: &str, worker_args: &str) -> Stack {
    let temp = tempfile::tempdir().expect("tempdir");
    let toml = format!(
        r#"
storage_root = '{root}'
worker_command = "{worker_command}"
worker_args = [{worker_args}]

[health]
restart_threshold = 1
chronic_window_seconds = 3600
chronic_max_restarts = 3

[supervisor]
stop_timeout_seconds = 1
"#,
        root = temp.path().to_str().expect("utf8"),
    );
    let config = Arc::new(GlobalConfig::from_toml_str(&toml).expect("valid config"));

    let pool = Arc::new(db::connect_memory().await.expect("db connect"));
    let notifier = Arc::new(RecordingNotifier::default());
    let locks = Arc::new(InstanceLocks::default());
    let supervisor = Arc::new(ProcessSupervisor::new(Arc::clone(&config)));
    let monitor_state = Arc::new(MonitorState::default());
    let billing = Arc::new(BillingEngine::new(
        Arc::clone(&pool),
        Arc::clone(&config),
        Arc::clone(&notifier) as Arc<dyn Notifier>,
        Arc::clone(&locks),
    ));
    let coordinator = Arc::new(Coordinator::new(
        Arc::clone(&config),
        Arc::clone(&pool),
        Arc::clone(&supervisor),
        billing,
        Arc::clone(&notifier) as Arc<dyn Notifier>,
        locks,
        Arc::clone(&monitor_state),
    ));

    let (event_tx, events) = mpsc::channel(16);
    let monitor = HealthMonitor::new(
        Arc::clone(&config),
        Arc::clone(&supervisor),
        InstanceRepo::new(Arc::clone(&pool)),
        monitor_state,
        event_tx,
    );

    Stack {
        coordinator,
        supervisor,
        monitor,
        events,
        instance_repo: InstanceRepo::new(pool),
        notifier,
        config,
        _temp: temp,
    }
}

fn active_instance() -> BotInstance {
    let mut instance =
        BotInstance::new("acct-1".into(), "crash-bot".into(), HashMap::new(), 1000);
    instance.state = LifecycleState::Active;
    instance
}

/// Three crashes are absorbed by restarts; the fourth trips the chronic
/// cutoff instead of a further restart.
#[tokio::test]
#[serial]
async fn fourth_crash_in_window_goes_chronic() {
    let mut s = stack("/bin/true", "").await;
    let instance = active_instance();
    s.instance_repo.create(&instance).await.expect("create");
    s.supervisor.start(&instance).await.expect("start");
    tokio::time::sleep(Duration::from_millis(200)).await;

    for round in 1..=3u32 {
        s.monitor.poll_once().await;
        let event = s.events.try_recv().expect("restart event");
        assert_eq!(
            event,
            HealthEvent::RestartNeeded {
                instance_id: instance.id.clone(),
                consecutive_failures: 1,
            }
        );

        s.coordinator
            .handle_health_event(event)
            .await
            .expect("handle restart");

        let loaded = s.instance_repo.load(&instance.id).await.expect("load");
        assert_eq!(loaded.restart_count, round);
        // Let the replacement crash before the next poll.
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    // Fourth observation: three restarts already sit in the window.
    s.monitor.poll_once().await;
    let event = s.events.try_recv().expect("chronic event");
    assert_eq!(
        event,
        HealthEvent::ChronicFailure {
            instance_id: instance.id.clone(),
            restarts_in_window: 3,
        }
    );

    s.coordinator
        .handle_health_event(event)
        .await
        .expect("handle chronic");

    let loaded = s.instance_repo.load(&instance.id).await.expect("load");
    assert_eq!(loaded.state, LifecycleState::ChronicFailure);
    assert_eq!(loaded.restart_count, 3, "no fourth restart");
    assert!(s.supervisor.handle(&instance.id).await.is_none());

    let sent = s.notifier.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, NotificationKind::ChronicFailure);

    // A chronic instance leaves the poll set entirely.
    s.monitor.poll_once().await;
    assert!(s.events.try_recv().is_err());
}

/// A provisioning instance activates on its first healthy probe, starting
/// the billing clock.
#[tokio::test]
#[serial]
async fn first_healthy_probe_activates_provisioning_instance() {
    let mut s = stack("/bin/sleep", "\"300\"").await;
    let instance = BotInstance::new(
        "acct-1".into(),
        "faq-bot".into(),
        HashMap::new(),
        1000,
    );
    s.instance_repo.create(&instance).await.expect("create");
    s.supervisor.start(&instance).await.expect("start");

    let paths = workspace::paths(&s.config, &instance.id);
    std::fs::write(&paths.heartbeat_file, b"").expect("touch heartbeat");

    s.monitor.poll_once().await;
    let event = s.events.try_recv().expect("first healthy event");
    assert_eq!(
        event,
        HealthEvent::FirstHealthy {
            instance_id: instance.id.clone(),
        }
    );

    s.coordinator
        .handle_health_event(event)
        .await
        .expect("handle first healthy");

    let loaded = s.instance_repo.load(&instance.id).await.expect("load");
    assert_eq!(loaded.state, LifecycleState::Active);
    assert!(loaded.last_debit_at.is_some(), "billing clock starts here");
    assert!(loaded.last_health_at.is_some());

    // Repeat healthy probes do not re-emit activation events.
    s.monitor.poll_once().await;
    assert!(s.events.try_recv().is_err());

    s.supervisor.stop_all(Duration::from_secs(1)).await;
}

/// A restart request against an instance that has since left a running
/// state is dropped without touching the process registry.
#[tokio::test]
#[serial]
async fn stale_restart_event_is_dropped_after_suspension() {
    let mut s = stack("/bin/true", "").await;
    let instance = active_instance();
    s.instance_repo.create(&instance).await.expect("create");
    s.supervisor.start(&instance).await.expect("start");
    tokio::time::sleep(Duration::from_millis(200)).await;

    s.monitor.poll_once().await;
    let event = s.events.try_recv().expect("restart event");

    // Billing suspends the instance before the event is handled.
    s.instance_repo
        .set_state(&instance.id, LifecycleState::Suspended)
        .await
        .expect("suspend");

    s.coordinator
        .handle_health_event(event)
        .await
        .expect("handle stale event");

    let loaded = s.instance_repo.load(&instance.id).await.expect("load");
    assert_eq!(loaded.state, LifecycleState::Suspended);
    assert_eq!(loaded.restart_count, 0, "no restart for a suspended instance");
}
