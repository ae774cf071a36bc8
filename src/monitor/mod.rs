//! Health monitor — polls live workers and reports, never mutates.
//!
//! Runs on a fixed interval over workers whose instances are expected to
//! be running. Classification and escalation results are delivered to the
//! orchestration coordinator over an `mpsc` channel; the monitor itself
//! never restarts a process or writes lifecycle state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GlobalConfig;
use crate::models::health::{HealthOutcome, HealthRecord};
use crate::models::instance::LifecycleState;
use crate::persistence::instance_repo::InstanceRepo;
use crate::supervisor::ProcessSupervisor;

/// Events emitted by the health monitor for coordinator handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    /// A provisioning instance answered its first successful probe.
    FirstHealthy {
        /// Instance that came up healthy.
        instance_id: String,
    },
    /// Consecutive failures crossed the restart threshold.
    RestartNeeded {
        /// Instance whose worker needs a restart.
        instance_id: String,
        /// Failure count that tripped the threshold.
        consecutive_failures: u32,
    },
    /// Restart requests within the rolling window exceeded policy; the
    /// worker must not be auto-restarted again.
    ChronicFailure {
        /// Instance caught in a restart storm.
        instance_id: String,
        /// Restart requests inside the rolling window.
        restarts_in_window: u32,
    },
}

/// Ephemeral per-worker bookkeeping, rebuilt across poll cycles.
///
/// Shared with the coordinator so a deliberate Suspended→Active resume can
/// clear an instance's failure history.
#[derive(Debug, Default)]
pub struct MonitorState {
    consecutive_failures: Mutex<HashMap<String, u32>>,
    restart_requests: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
}

impl MonitorState {
    /// Forget all failure bookkeeping for an instance.
    pub async fn clear(&self, instance_id: &str) {
        self.consecutive_failures.lock().await.remove(instance_id);
        self.restart_requests.lock().await.remove(instance_id);
    }

    /// Restart requests recorded inside the rolling window.
    async fn requests_in_window(&self, instance_id: &str, window: Duration, now: DateTime<Utc>) -> u32 {
        let mut requests = self.restart_requests.lock().await;
        let Some(entries) = requests.get_mut(instance_id) else {
            return 0;
        };
        let cutoff = now
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::hours(1));
        entries.retain(|t| *t >= cutoff);
        u32::try_from(entries.len()).unwrap_or(u32::MAX)
    }

    async fn record_request(&self, instance_id: &str, now: DateTime<Utc>) {
        self.restart_requests
            .lock()
            .await
            .entry(instance_id.to_owned())
            .or_default()
            .push(now);
    }
}

/// Health monitor polling workers and emitting [`HealthEvent`]s.
pub struct HealthMonitor {
    config: Arc<GlobalConfig>,
    supervisor: Arc<ProcessSupervisor>,
    instance_repo: InstanceRepo,
    state: Arc<MonitorState>,
    event_tx: mpsc::Sender<HealthEvent>,
}

impl HealthMonitor {
    /// Construct a monitor (does not start the poll task yet).
    #[must_use]
    pub fn new(
        config: Arc<GlobalConfig>,
        supervisor: Arc<ProcessSupervisor>,
        instance_repo: InstanceRepo,
        state: Arc<MonitorState>,
        event_tx: mpsc::Sender<HealthEvent>,
    ) -> Self {
        Self {
            config,
            supervisor,
            instance_repo,
            state,
            event_tx,
        }
    }

    /// Spawn the background poll task.
    ///
    /// Polls every `health.poll_interval_seconds` until the
    /// `CancellationToken` fires.
    #[must_use]
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.health.poll_interval_seconds);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("health monitor shutting down");
                        break;
                    }
                    () = tokio::time::sleep(interval) => {}
                }
                self.poll_once().await;
            }
        })
    }

    /// Run one poll cycle over every instance expected to be running.
    ///
    /// Per-instance failures never abort the cycle for other instances.
    pub async fn poll_once(&self) {
        let mut instances = Vec::new();
        for state in [
            LifecycleState::Provisioning,
            LifecycleState::Active,
            LifecycleState::PaymentWarned,
        ] {
            match self.instance_repo.list_by_state(state).await {
                Ok(mut batch) => instances.append(&mut batch),
                Err(err) => {
                    warn!(%err, state = ?state, "failed to list instances for health poll");
                }
            }
        }

        for instance in instances {
            let Some(outcome) = self.supervisor.probe(&instance.id).await else {
                // No live worker: the reconciliation loop owns starts.
                continue;
            };
            self.classify(&instance.id, instance.state, outcome).await;
        }
    }

    /// Apply the escalation policy to one probe outcome.
    async fn classify(&self, instance_id: &str, state: LifecycleState, outcome: HealthOutcome) {
        let now = Utc::now();

        if outcome == HealthOutcome::Healthy {
            self.state
                .consecutive_failures
                .lock()
                .await
                .remove(instance_id);

            if let Err(err) = self.instance_repo.touch_last_health(instance_id, now).await {
                warn!(instance_id, %err, "failed to stamp last health time");
            }

            if state == LifecycleState::Provisioning {
                let _ = self
                    .event_tx
                    .send(HealthEvent::FirstHealthy {
                        instance_id: instance_id.to_owned(),
                    })
                    .await;
            }
            return;
        }

        let failures = {
            let mut map = self.state.consecutive_failures.lock().await;
            let entry = map.entry(instance_id.to_owned()).or_insert(0);
            *entry = entry.saturating_add(1);
            *entry
        };

        let record = HealthRecord::new(instance_id.to_owned(), outcome, failures);
        debug!(
            instance_id,
            outcome = ?record.outcome,
            consecutive_failures = record.consecutive_failures,
            "worker probe failed"
        );

        if failures < self.config.health.restart_threshold {
            return;
        }

        let window = Duration::from_secs(self.config.health.chronic_window_seconds);
        let in_window = self.state.requests_in_window(instance_id, window, now).await;

        if in_window >= self.config.health.chronic_max_restarts {
            warn!(
                instance_id,
                restarts_in_window = in_window,
                "restart storm detected, reporting chronic failure"
            );
            let _ = self
                .event_tx
                .send(HealthEvent::ChronicFailure {
                    instance_id: instance_id.to_owned(),
                    restarts_in_window: in_window,
                })
                .await;
            return;
        }

        self.state.record_request(instance_id, now).await;
        // Threshold consumed: the next escalation needs fresh failures
        // observed after the restart.
        self.state
            .consecutive_failures
            .lock()
            .await
            .remove(instance_id);

        info!(instance_id, failures, "requesting worker restart");
        let _ = self
            .event_tx
            .send(HealthEvent::RestartNeeded {
                instance_id: instance_id.to_owned(),
                consecutive_failures: failures,
            })
            .await;
    }
}
