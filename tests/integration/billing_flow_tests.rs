//! End-to-end billing lifecycle: debit, warn, suspend, top-up resume,
//! with the reconciliation loop converging the process side.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serial_test::serial;

use botfoundry::billing::BillingEngine;
use botfoundry::config::GlobalConfig;
use botfoundry::coordinator::Coordinator;
use botfoundry::locks::InstanceLocks;
use botfoundry::models::account::Account;
use botfoundry::models::instance::{BotInstance, LifecycleState, WarnTier};
use botfoundry::monitor::MonitorState;
use botfoundry::notify::{NotificationKind, Notifier, RecordingNotifier};
use botfoundry::persistence::{account_repo::AccountRepo, db, instance_repo::InstanceRepo};
use botfoundry::supervisor::ProcessSupervisor;

struct Stack {
    coordinator: Arc<Coordinator>,
    supervisor: Arc<ProcessSupervisor>,
    billing: Arc<BillingEngine>,
    instance_repo: InstanceRepo,
    account_repo: AccountRepo,
    notifier: Arc<RecordingNotifier>,
    _temp: tempfile::TempDir,
}

async fn stack() -> Stack {
    let temp = tempfile::tempdir().expect("tempdir");
    let toml = format!(
        r#"
storage_root = '{root}'
worker_command = "/bin/sleep"
worker_args = ["300"]

[billing]
period_seconds = 60
final_warning_after_seconds = 100
suspend_after_seconds = 200

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
        Arc::clone(&billing),
        Arc::clone(&notifier) as Arc<dyn Notifier>,
        locks,
        Arc::new(MonitorState::default()),
    ));

    Stack {
        coordinator,
        supervisor,
        billing,
        instance_repo: InstanceRepo::new(Arc::clone(&pool)),
        account_repo: AccountRepo::new(pool),
        notifier,
        _temp: temp,
    }
}

/// Walks one instance through the whole payment arc: active and billed,
/// warned on a short balance, suspended after the warning period, stopped
/// by reconciliation, then resumed by a top-up and restarted.
#[tokio::test]
#[serial]
async fn payment_arc_from_active_to_suspended_and_back() {
    let s = stack().await;

    let account = Account::new(1000);
    s.account_repo.create(&account).await.expect("create account");

    let mut instance =
        BotInstance::new(account.id.clone(), "faq-bot".into(), HashMap::new(), 1000);
    instance.state = LifecycleState::Active;
    s.instance_repo.create(&instance).await.expect("create");

    // Reconcile brings the worker up.
    assert_eq!(s.coordinator.reconcile_once().await, 1);
    assert!(s.supervisor.handle(&instance.id).await.is_some());

    // First sweep collects the fee and drains the balance to zero.
    s.billing.run_sweep().await;
    let acct = s.account_repo.load(&account.id).await.expect("load account");
    assert_eq!(acct.balance, 0);
    let loaded = s.instance_repo.load(&instance.id).await.expect("load");
    assert_eq!(loaded.state, LifecycleState::Active);

    // Next period comes due with nothing left: warning, worker untouched.
    let mut due = loaded;
    due.last_debit_at = Some(Utc::now() - Duration::seconds(120));
    s.instance_repo.save(&due).await.expect("save");
    s.billing.run_sweep().await;

    let warned = s.instance_repo.load(&instance.id).await.expect("load");
    assert_eq!(warned.state, LifecycleState::PaymentWarned);
    assert_eq!(warned.warn_tier, WarnTier::First);
    assert!(s.supervisor.handle(&instance.id).await.is_some());
    assert_eq!(s.coordinator.reconcile_once().await, 0);

    // The warning period runs out: suspension, then reconcile stops the
    // worker.
    let mut overdue = warned;
    overdue.warned_at = Some(Utc::now() - Duration::seconds(250));
    s.instance_repo.save(&overdue).await.expect("save");
    s.billing.run_sweep().await;

    let suspended = s.instance_repo.load(&instance.id).await.expect("load");
    assert_eq!(suspended.state, LifecycleState::Suspended);
    assert!(suspended.suspended_at.is_some());
    assert_eq!(s.coordinator.reconcile_once().await, 1);
    assert!(s.supervisor.handle(&instance.id).await.is_none());

    // Top-up covers the fee: resume, then reconcile restarts the worker.
    let resumed = s
        .coordinator
        .top_up_balance(&account.id, 1500)
        .await
        .expect("top up");
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].state, LifecycleState::Active);

    let back = s.instance_repo.load(&instance.id).await.expect("load");
    assert_eq!(back.state, LifecycleState::Active);
    assert!(back.suspended_at.is_none());
    assert_eq!(back.warn_tier, WarnTier::None);

    assert_eq!(s.coordinator.reconcile_once().await, 1);
    assert!(s.supervisor.handle(&instance.id).await.is_some());

    let acct = s.account_repo.load(&account.id).await.expect("load account");
    assert_eq!(acct.balance, 500);
    assert_eq!(acct.total_spent, 2000, "two periods collected in total");

    let kinds: Vec<_> = s
        .notifier
        .sent()
        .await
        .into_iter()
        .map(|(_, kind, _)| kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            NotificationKind::PaymentWarning { tier: 1 },
            NotificationKind::Suspended,
            NotificationKind::Resumed,
        ]
    );

    s.supervisor
        .stop_all(std::time::Duration::from_secs(1))
        .await;
}

/// Paying during the warning period returns the instance to `Active`
/// without ever stopping the worker.
#[tokio::test]
#[serial]
async fn top_up_during_warning_avoids_suspension() {
    let s = stack().await;

    let account = Account::new(0);
    s.account_repo.create(&account).await.expect("create account");

    let mut instance =
        BotInstance::new(account.id.clone(), "faq-bot".into(), HashMap::new(), 1000);
    instance.state = LifecycleState::PaymentWarned;
    instance.warned_at = Some(Utc::now());
    instance.warn_tier = WarnTier::First;
    s.instance_repo.create(&instance).await.expect("create");

    assert_eq!(s.coordinator.reconcile_once().await, 1);
    assert!(s.supervisor.handle(&instance.id).await.is_some());

    let resumed = s
        .coordinator
        .top_up_balance(&account.id, 1000)
        .await
        .expect("top up");
    assert_eq!(resumed.len(), 1);

    let back = s.instance_repo.load(&instance.id).await.expect("load");
    assert_eq!(back.state, LifecycleState::Active);
    assert!(back.warned_at.is_none(), "warning episode cleared");

    // The worker never went away, so reconcile has nothing to do.
    assert_eq!(s.coordinator.reconcile_once().await, 0);
    assert!(s.supervisor.handle(&instance.id).await.is_some());

    s.supervisor
        .stop_all(std::time::Duration::from_secs(1))
        .await;
}
