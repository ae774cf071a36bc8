//! Orchestration coordinator — reconciles desired vs. observed state.
//!
//! Desired state comes from the billing state machine and user commands
//! persisted in the instance store; observed state comes from the process
//! supervisor and health monitor. The reconciliation loop emits the
//! minimal diff of start/stop commands and is idempotent: two passes with
//! no external change issue zero commands the second time.

pub mod api;
pub mod events;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn};

use crate::billing::BillingEngine;
use crate::config::GlobalConfig;
use crate::locks::InstanceLocks;
use crate::models::instance::{BotInstance, LifecycleState};
use crate::monitor::MonitorState;
use crate::notify::{NotificationKind, SharedNotifier};
use crate::persistence::account_repo::AccountRepo;
use crate::persistence::instance_repo::InstanceRepo;
use crate::supervisor::ProcessSupervisor;
use crate::{AppError, Result};

/// In-memory launch retry bookkeeping for one instance.
#[derive(Debug, Clone, Copy)]
struct RetryState {
    attempts: u32,
    next_attempt_at: DateTime<Utc>,
}

/// Coordinator owning the reconcile loop and the inbound control API.
pub struct Coordinator {
    config: Arc<GlobalConfig>,
    supervisor: Arc<ProcessSupervisor>,
    billing: Arc<BillingEngine>,
    instance_repo: InstanceRepo,
    account_repo: AccountRepo,
    notifier: SharedNotifier,
    locks: Arc<InstanceLocks>,
    monitor_state: Arc<MonitorState>,
    retries: Mutex<HashMap<String, RetryState>>,
}

impl Coordinator {
    /// Wire up a coordinator over the shared components.
    #[must_use]
    #[allow(clippy::too_many_arguments)] // Construction wiring in main; not API width.
    pub fn new(
        config: Arc<GlobalConfig>,
        db: Arc<sqlx::SqlitePool>,
        supervisor: Arc<ProcessSupervisor>,
        billing: Arc<BillingEngine>,
        notifier: SharedNotifier,
        locks: Arc<InstanceLocks>,
        monitor_state: Arc<MonitorState>,
    ) -> Self {
        Self {
            config,
            supervisor,
            billing,
            instance_repo: InstanceRepo::new(Arc::clone(&db)),
            account_repo: AccountRepo::new(db),
            notifier,
            locks,
            monitor_state,
            retries: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the periodic reconciliation task.
    #[must_use]
    pub fn spawn_reconciler(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let interval =
            std::time::Duration::from_secs(self.config.reconcile_interval_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("reconciler shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.reconcile_once().await;
                    }
                }
            }
        })
    }

    /// Run one reconciliation pass over every instance.
    ///
    /// Returns the number of commands issued; zero means desired and
    /// observed state already agree. One instance's failure never aborts
    /// the pass for the rest.
    pub async fn reconcile_once(&self) -> usize {
        let span = info_span!("reconcile");
        let _guard = span.enter();

        let mut commands = 0usize;

        for state in [
            LifecycleState::Provisioning,
            LifecycleState::Active,
            LifecycleState::PaymentWarned,
        ] {
            let instances = match self.instance_repo.list_by_state(state).await {
                Ok(batch) => batch,
                Err(err) => {
                    error!(%err, state = ?state, "failed to list instances for reconcile");
                    continue;
                }
            };
            for instance in instances {
                let _lock = self.locks.acquire(&instance.id).await;
                match self.ensure_running(&instance).await {
                    Ok(issued) => commands += usize::from(issued),
                    Err(err) => {
                        error!(instance_id = %instance.id, %err, "reconcile start path failed");
                    }
                }
            }
        }

        for state in [
            LifecycleState::Suspended,
            LifecycleState::LaunchFailed,
            LifecycleState::ChronicFailure,
            LifecycleState::Deleted,
        ] {
            let instances = match self.instance_repo.list_by_state(state).await {
                Ok(batch) => batch,
                Err(err) => {
                    error!(%err, state = ?state, "failed to list instances for reconcile");
                    continue;
                }
            };
            for instance in instances {
                let _lock = self.locks.acquire(&instance.id).await;
                match self.ensure_stopped(&instance.id).await {
                    Ok(issued) => commands += usize::from(issued),
                    Err(err) => {
                        error!(instance_id = %instance.id, %err, "reconcile stop path failed");
                    }
                }
            }
        }

        commands
    }

    /// Start the instance's worker when no handle is registered.
    ///
    /// Launch failures are retried with exponential backoff; once the
    /// attempt budget is spent the instance is marked `LaunchFailed` and
    /// left for manual intervention.
    async fn ensure_running(&self, instance: &BotInstance) -> Result<bool> {
        if self.supervisor.handle(&instance.id).await.is_some() {
            // Observed running. Crashed-but-registered workers belong to
            // the health monitor's escalation, not the reconciler.
            return Ok(false);
        }

        let now = Utc::now();
        if let Some(retry) = self.retries.lock().await.get(&instance.id) {
            if now < retry.next_attempt_at {
                return Ok(false);
            }
        }

        match self.supervisor.start(instance).await {
            Ok(handle) => {
                self.retries.lock().await.remove(&instance.id);
                info!(
                    instance_id = %instance.id,
                    pid = handle.pid.unwrap_or(0),
                    "reconcile started worker"
                );
                Ok(true)
            }
            Err(err) => {
                self.record_launch_failure(instance, &err, now).await?;
                Err(err)
            }
        }
    }

    async fn record_launch_failure(
        &self,
        instance: &BotInstance,
        err: &AppError,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let attempts = {
            let mut retries = self.retries.lock().await;
            let entry = retries.entry(instance.id.clone()).or_insert(RetryState {
                attempts: 0,
                next_attempt_at: now,
            });
            entry.attempts = entry.attempts.saturating_add(1);
            let backoff_secs = self
                .config
                .launch
                .retry_base_seconds
                .saturating_mul(1u64 << entry.attempts.saturating_sub(1).min(16));
            entry.next_attempt_at = now
                + chrono::Duration::seconds(i64::try_from(backoff_secs).unwrap_or(i64::MAX));
            entry.attempts
        };

        warn!(
            instance_id = %instance.id,
            attempts,
            %err,
            "worker launch failed, will retry with backoff"
        );

        if attempts < self.config.launch.retry_max_attempts {
            return Ok(());
        }

        self.retries.lock().await.remove(&instance.id);
        self.instance_repo
            .set_state(&instance.id, LifecycleState::LaunchFailed)
            .await?;
        error!(
            instance_id = %instance.id,
            attempts, "launch retries exhausted, marked for manual intervention"
        );
        self.notifier.notify(
            &instance.account_id,
            NotificationKind::LaunchFailed,
            &serde_json::json!({
                "instance_id": instance.id,
                "attempts": attempts,
                "last_error": err.to_string(),
            })
            .to_string(),
        );
        Ok(())
    }

    /// Stop the instance's worker when a handle is still registered.
    async fn ensure_stopped(&self, instance_id: &str) -> Result<bool> {
        if self.supervisor.handle(instance_id).await.is_none() {
            return Ok(false);
        }

        let ack = self
            .supervisor
            .stop(instance_id, self.config.stop_timeout())
            .await?;
        info!(instance_id, forced = ack.forced, "reconcile stopped worker");
        Ok(true)
    }

    /// Clear every trace of automatic-failure bookkeeping for an instance
    /// that resumed deliberately.
    async fn clear_failure_history(&self, instance_id: &str) {
        self.monitor_state.clear(instance_id).await;
        self.retries.lock().await.remove(instance_id);
        self.supervisor.reset_restart_counter(instance_id).await;
    }
}
