//! Cleanup sweep tests: grace expiry, resource reclamation, idempotence.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serial_test::serial;

use botfoundry::cleanup::CleanupService;
use botfoundry::config::GlobalConfig;
use botfoundry::locks::InstanceLocks;
use botfoundry::models::instance::{BotInstance, LifecycleState};
use botfoundry::persistence::{db, instance_repo::InstanceRepo};
use botfoundry::supervisor::{workspace, ProcessSupervisor};

struct Stack {
    cleanup: Arc<CleanupService>,
    instance_repo: InstanceRepo,
    config: Arc<GlobalConfig>,
    _temp: tempfile::TempDir,
}

async fn stack() -> Stack {
    let temp = tempfile::tempdir().expect("tempdir");
    let toml = format!(
        r#"
storage_root = '{root}'
worker_command = "/bin/sleep"
worker_args = ["300"]

[cleanup]
grace_retention_seconds = 600

[supervisor]
stop_timeout_seconds = 1
"#,
        root = temp.path().to_str().expect("utf8"),
    );
    let config = Arc::new(GlobalConfig::from_toml_str(&toml).expect("valid config"));

    let pool = Arc::new(db::connect_memory().await.expect("db connect"));
    let supervisor = Arc::new(ProcessSupervisor::new(Arc::clone(&config)));
    let cleanup = Arc::new(CleanupService::new(
        Arc::clone(&config),
        Arc::clone(&pool),
        supervisor,
        Arc::new(InstanceLocks::default()),
    ));

    Stack {
        cleanup,
        instance_repo: InstanceRepo::new(pool),
        config,
        _temp: temp,
    }
}

fn suspended_instance(age_seconds: i64) -> BotInstance {
    let mut instance =
        BotInstance::new("acct-1".into(), "faq-bot".into(), HashMap::new(), 1000);
    instance.state = LifecycleState::Suspended;
    instance.suspended_at = Some(Utc::now() - Duration::seconds(age_seconds));
    instance
}

#[tokio::test]
#[serial]
async fn expired_grace_window_reclaims_everything() {
    let s = stack().await;
    let instance = suspended_instance(700);
    s.instance_repo.create(&instance).await.expect("create");

    let paths = workspace::prepare(&s.config, &instance.id).expect("prepare");
    std::fs::write(&paths.data_file, r#"{"conversations": 3}"#).expect("write state");
    assert!(paths.dir.exists());

    s.cleanup.run_sweep().await;

    let loaded = s.instance_repo.load(&instance.id).await.expect("load");
    assert_eq!(loaded.state, LifecycleState::Deleted);
    assert!(loaded.deleted_at.is_some());
    assert!(loaded.resources_cleared);
    assert!(!paths.dir.exists(), "working directory removed");
    assert!(!paths.data_file.exists(), "data file removed");
}

#[tokio::test]
#[serial]
async fn grace_window_still_open_leaves_instance_alone() {
    let s = stack().await;
    let instance = suspended_instance(100);
    s.instance_repo.create(&instance).await.expect("create");

    let paths = workspace::prepare(&s.config, &instance.id).expect("prepare");

    s.cleanup.run_sweep().await;

    let loaded = s.instance_repo.load(&instance.id).await.expect("load");
    assert_eq!(
        loaded.state,
        LifecycleState::Suspended,
        "instance can still be resumed inside the grace window"
    );
    assert!(!loaded.resources_cleared);
    assert!(paths.dir.exists(), "resources retained for resume");
}

#[tokio::test]
#[serial]
async fn deleted_instances_get_their_resources_cleared() {
    let s = stack().await;
    let mut instance =
        BotInstance::new("acct-1".into(), "faq-bot".into(), HashMap::new(), 1000);
    instance.state = LifecycleState::Deleted;
    instance.deleted_at = Some(Utc::now());
    s.instance_repo.create(&instance).await.expect("create");

    let paths = workspace::prepare(&s.config, &instance.id).expect("prepare");

    s.cleanup.run_sweep().await;

    let loaded = s.instance_repo.load(&instance.id).await.expect("load");
    assert!(loaded.resources_cleared);
    assert!(!paths.dir.exists());

    // A second sweep finds nothing left to do.
    s.cleanup.run_sweep().await;
    let again = s.instance_repo.load(&instance.id).await.expect("load");
    assert_eq!(again.state, LifecycleState::Deleted);
}

#[tokio::test]
#[serial]
async fn reclaim_can_be_re_run_after_interruption() {
    let s = stack().await;
    let instance = suspended_instance(700);
    s.instance_repo.create(&instance).await.expect("create");
    workspace::prepare(&s.config, &instance.id).expect("prepare");

    s.cleanup
        .reclaim(&instance.id, true)
        .await
        .expect("first reclaim");
    // Re-running after a simulated interruption must not fail on the
    // already-removed resources.
    s.cleanup
        .reclaim(&instance.id, true)
        .await
        .expect("second reclaim");

    let loaded = s.instance_repo.load(&instance.id).await.expect("load");
    assert_eq!(loaded.state, LifecycleState::Deleted);
    assert!(loaded.resources_cleared);
}
