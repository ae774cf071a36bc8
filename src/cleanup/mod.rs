//! Cleanup service — reclaims resources for instances past their grace
//! window.
//!
//! Runs as a periodic background sweep. Every resource removal is
//! independently idempotent, so an interrupted sweep can be re-run
//! without error: deleting an already-deleted path is a no-op.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn};

use crate::config::GlobalConfig;
use crate::locks::InstanceLocks;
use crate::models::instance::LifecycleState;
use crate::persistence::instance_repo::InstanceRepo;
use crate::supervisor::{workspace, ProcessSupervisor};
use crate::{AppError, Result, StopError};

/// Cleanup sweeper over suspended-and-expired and deleted instances.
pub struct CleanupService {
    config: Arc<GlobalConfig>,
    supervisor: Arc<ProcessSupervisor>,
    instance_repo: InstanceRepo,
    locks: Arc<InstanceLocks>,
}

impl CleanupService {
    /// Create a cleanup service over the shared components.
    #[must_use]
    pub fn new(
        config: Arc<GlobalConfig>,
        db: Arc<sqlx::SqlitePool>,
        supervisor: Arc<ProcessSupervisor>,
        locks: Arc<InstanceLocks>,
    ) -> Self {
        Self {
            config,
            supervisor,
            instance_repo: InstanceRepo::new(db),
            locks,
        }
    }

    /// Spawn the periodic cleanup sweep task.
    #[must_use]
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.cleanup.sweep_interval_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("cleanup sweep shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.run_sweep().await;
                    }
                }
            }
        })
    }

    /// Run one sweep. Per-instance failures are logged and never abort
    /// the sweep for other instances.
    pub async fn run_sweep(&self) {
        let span = info_span!("cleanup_sweep");
        let _guard = span.enter();

        let now = Utc::now();
        let retention = chrono::Duration::seconds(
            i64::try_from(self.config.cleanup.grace_retention_seconds).unwrap_or(i64::MAX),
        );

        // Suspended instances whose grace window has fully elapsed.
        match self.instance_repo.list_by_state(LifecycleState::Suspended).await {
            Ok(suspended) => {
                for instance in suspended {
                    let expired = instance
                        .suspended_at
                        .is_some_and(|at| now - at >= retention);
                    if !expired {
                        continue;
                    }
                    if let Err(err) = self.reclaim(&instance.id, true).await {
                        error!(instance_id = %instance.id, %err, "grace expiry cleanup failed");
                    }
                }
            }
            Err(err) => error!(%err, "failed to list suspended instances for cleanup"),
        }

        // Deleted instances still holding file-system resources.
        match self.instance_repo.list_by_state(LifecycleState::Deleted).await {
            Ok(deleted) => {
                for instance in deleted {
                    if instance.resources_cleared {
                        continue;
                    }
                    if let Err(err) = self.reclaim(&instance.id, false).await {
                        error!(instance_id = %instance.id, %err, "deleted instance cleanup failed");
                    }
                }
            }
            Err(err) => error!(%err, "failed to list deleted instances for cleanup"),
        }
    }

    /// Release one instance's worker, data file, and working directory,
    /// then mark it deleted with resources cleared.
    ///
    /// Safe to call repeatedly: each step is a no-op once its resource is
    /// gone.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` when a removal fails for a reason other
    /// than absence, or `AppError::Db` on persistence failure.
    pub async fn reclaim(&self, instance_id: &str, from_suspended: bool) -> Result<()> {
        let lock = self.locks.acquire(instance_id).await;

        match self
            .supervisor
            .stop(instance_id, self.config.stop_timeout())
            .await
        {
            Ok(ack) => info!(instance_id, forced = ack.forced, "worker stopped during cleanup"),
            Err(AppError::Stop(StopError::NotRunning(_))) => {}
            Err(err) => warn!(instance_id, %err, "failed to stop worker during cleanup"),
        }

        workspace::remove(&self.config, instance_id)?;

        let mut instance = self.instance_repo.load(instance_id).await?;
        if from_suspended && instance.state == LifecycleState::Suspended {
            instance.state = LifecycleState::Deleted;
            instance.deleted_at = Some(Utc::now());
        }
        instance.resources_cleared = true;
        self.instance_repo.save(&instance).await?;

        drop(lock);
        self.locks.forget(instance_id).await;
        info!(instance_id, "instance resources reclaimed");
        Ok(())
    }
}
