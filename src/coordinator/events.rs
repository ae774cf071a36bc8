//! Health event consumer — applies monitor reports to process state.
//!
//! Reads [`HealthEvent`]s from the shared `mpsc` channel. The monitor
//! only reports; every mutation happens here, under the per-instance
//! lock, so a health-triggered restart can never interleave with a
//! billing transition for the same instance.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::models::instance::LifecycleState;
use crate::monitor::HealthEvent;
use crate::notify::NotificationKind;
use crate::{AppError, StopError};

use super::Coordinator;

/// Spawn a background task that consumes health events.
///
/// Runs until the `CancellationToken` fires or the channel closes.
#[must_use]
pub fn spawn_health_event_consumer(
    coordinator: Arc<Coordinator>,
    mut rx: mpsc::Receiver<HealthEvent>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => {
                    info!("health event consumer shutting down");
                    break;
                }
                maybe_event = rx.recv() => {
                    if let Some(e) = maybe_event { e } else {
                        info!("health event channel closed");
                        break;
                    }
                }
            };

            if let Err(err) = coordinator.handle_health_event(event).await {
                error!(%err, "health event handling failed");
            }
        }
    })
}

impl Coordinator {
    /// Apply one health event under the instance's exclusive lock.
    ///
    /// # Errors
    ///
    /// Returns `AppError` on persistence failures; process-level races
    /// (a stop winning against a restart) are absorbed silently.
    pub async fn handle_health_event(&self, event: HealthEvent) -> crate::Result<()> {
        match event {
            HealthEvent::FirstHealthy { instance_id } => {
                self.activate_provisioned(&instance_id).await
            }
            HealthEvent::RestartNeeded {
                instance_id,
                consecutive_failures,
            } => self.restart_worker(&instance_id, consecutive_failures).await,
            HealthEvent::ChronicFailure {
                instance_id,
                restarts_in_window,
            } => self.mark_chronic(&instance_id, restarts_in_window).await,
        }
    }

    /// Provisioning→Active on the first successful health check; the
    /// billing clock starts here (the creation fee covered provisioning).
    async fn activate_provisioned(&self, instance_id: &str) -> crate::Result<()> {
        let _lock = self.locks.acquire(instance_id).await;

        let mut instance = self.instance_repo.load(instance_id).await?;
        if instance.state != LifecycleState::Provisioning {
            return Ok(());
        }

        instance.state = LifecycleState::Active;
        instance.last_debit_at = Some(Utc::now());
        instance.last_health_at = Some(Utc::now());
        self.instance_repo.save(&instance).await?;

        info!(instance_id, "instance activated after first health check");
        Ok(())
    }

    /// Restart a failing worker, bounded by the chronic-failure policy
    /// already applied on the monitor side.
    async fn restart_worker(&self, instance_id: &str, failures: u32) -> crate::Result<()> {
        let _lock = self.locks.acquire(instance_id).await;

        let instance = self.instance_repo.load(instance_id).await?;
        if !instance.state.wants_worker() {
            // A billing or user transition beat the event here; the stop
            // side of reconciliation owns this instance now.
            return Ok(());
        }

        match self.supervisor.restart(&instance).await {
            Ok(handle) => {
                let mut updated = instance;
                updated.restart_count = handle.restart_count;
                self.instance_repo.save(&updated).await?;
                info!(
                    instance_id,
                    failures,
                    restart_count = handle.restart_count,
                    "worker restarted after health escalation"
                );
            }
            Err(AppError::Stop(StopError::NotRunning(_))) => {
                // Stop won the race; nothing to restart.
            }
            Err(err) => {
                warn!(instance_id, %err, "health-triggered restart failed, reconciler will retry");
            }
        }
        Ok(())
    }

    /// Force a restart-storming instance into the human-reviewable state.
    async fn mark_chronic(&self, instance_id: &str, restarts_in_window: u32) -> crate::Result<()> {
        let _lock = self.locks.acquire(instance_id).await;

        let instance = self.instance_repo.load(instance_id).await?;
        if instance.state == LifecycleState::ChronicFailure {
            return Ok(());
        }
        if !instance.state.can_transition_to(LifecycleState::ChronicFailure) {
            return Ok(());
        }

        match self
            .supervisor
            .stop(instance_id, self.config.stop_timeout())
            .await
        {
            Ok(_) | Err(AppError::Stop(StopError::NotRunning(_))) => {}
            Err(err) => {
                warn!(instance_id, %err, "failed to stop chronically failing worker");
            }
        }

        self.instance_repo
            .set_state(instance_id, LifecycleState::ChronicFailure)
            .await?;
        self.monitor_state.clear(instance_id).await;

        warn!(
            instance_id,
            restarts_in_window, "instance marked chronic failure, manual clear required"
        );
        self.notifier.notify(
            &instance.account_id,
            NotificationKind::ChronicFailure,
            &serde_json::json!({
                "instance_id": instance_id,
                "restarts_in_window": restarts_in_window,
            })
            .to_string(),
        );
        Ok(())
    }
}
