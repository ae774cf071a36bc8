//! Process supervisor — OS-level lifecycle of one worker per instance.
//!
//! Owns the only registry of live child processes, keyed by instance id,
//! which is what enforces the at-most-one-worker-per-instance invariant.
//! Every spawned child has `kill_on_drop(true)` so a supervisor crash
//! cannot leak workers.

pub mod workspace;

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

use crate::config::GlobalConfig;
use crate::models::health::HealthOutcome;
use crate::models::instance::BotInstance;
use crate::models::worker::{StopAck, WorkerHandle};
use crate::{AppError, LaunchError, Result, StopError};

/// One live worker tracked by the supervisor.
struct Worker {
    child: Child,
    handle: WorkerHandle,
    /// Cancelled by `stop` so an in-flight restart aborts cooperatively.
    cancel: CancellationToken,
}

/// Supervisor owning the start/stop/restart lifecycle of worker processes.
pub struct ProcessSupervisor {
    config: Arc<GlobalConfig>,
    workers: Mutex<HashMap<String, Worker>>,
}

impl ProcessSupervisor {
    /// Create a supervisor with an empty worker registry.
    #[must_use]
    pub fn new(config: Arc<GlobalConfig>) -> Self {
        Self {
            config,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn a worker process for the instance.
    ///
    /// Prepares the per-instance working directory and local data file
    /// (preserving any existing data file: restart is not reprovision),
    /// then launches the configured worker runtime with the instance
    /// identity, config blob, and resource ceilings passed through the
    /// environment. The hosting OS enforces the ceilings; the supervisor
    /// only requests them.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Launch` with `AlreadyRunning` when a live handle
    /// exists, `ResourceExhausted` at the live-worker ceiling,
    /// `InvalidTemplate` for an empty template ref, `Workspace` when the
    /// directory cannot be prepared, or `Spawn` when the OS refuses.
    pub async fn start(&self, instance: &BotInstance) -> Result<WorkerHandle> {
        let span = info_span!("start_worker", instance_id = %instance.id);
        let _guard = span.enter();

        if instance.template_ref.is_empty() {
            return Err(LaunchError::InvalidTemplate(format!(
                "instance {} has an empty template ref",
                instance.id
            ))
            .into());
        }

        let mut workers = self.workers.lock().await;

        // Reap a dead entry before judging duplicate starts.
        if let Some(worker) = workers.get_mut(&instance.id) {
            match worker.child.try_wait() {
                Ok(Some(_)) | Err(_) => {
                    workers.remove(&instance.id);
                }
                Ok(None) => {
                    return Err(LaunchError::AlreadyRunning(format!(
                        "instance {} already has a live worker",
                        instance.id
                    ))
                    .into());
                }
            }
        }

        if u32::try_from(workers.len()).map_or(true, |live| live >= self.config.max_live_workers) {
            return Err(LaunchError::ResourceExhausted(format!(
                "live worker ceiling reached ({}/{})",
                workers.len(),
                self.config.max_live_workers
            ))
            .into());
        }

        let paths = workspace::prepare(&self.config, &instance.id)
            .map_err(|err| LaunchError::Workspace(err.to_string()))?;

        let config_blob = serde_json::to_string(&instance.config)
            .map_err(|err| LaunchError::Spawn(format!("config blob not serializable: {err}")))?;

        let mut cmd = Command::new(&self.config.worker_command);
        cmd.args(&self.config.worker_args)
            .env("BOTFOUNDRY_INSTANCE_ID", &instance.id)
            .env("BOTFOUNDRY_TEMPLATE_REF", &instance.template_ref)
            .env("BOTFOUNDRY_CONFIG", &config_blob)
            .env("BOTFOUNDRY_DATA_FILE", &paths.data_file)
            .env("BOTFOUNDRY_HEARTBEAT_FILE", &paths.heartbeat_file)
            .env(
                "BOTFOUNDRY_CPU_LIMIT_PERCENT",
                self.config.supervisor.cpu_limit_percent.to_string(),
            )
            .env(
                "BOTFOUNDRY_MEMORY_LIMIT_MB",
                self.config.supervisor.memory_limit_mb.to_string(),
            )
            .current_dir(&paths.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|err| LaunchError::Spawn(format!("failed to spawn worker: {err}")))?;

        let handle = WorkerHandle::new(instance.id.clone(), child.id(), instance.restart_count);

        info!(
            instance_id = %instance.id,
            pid = handle.pid.unwrap_or(0),
            template = %instance.template_ref,
            "worker process spawned"
        );

        workers.insert(
            instance.id.clone(),
            Worker {
                child,
                handle: handle.clone(),
                cancel: CancellationToken::new(),
            },
        );

        Ok(handle)
    }

    /// Stop the instance's worker: graceful signal, bounded wait, then
    /// force-kill.
    ///
    /// A stop always wins a race against a pending restart for the same
    /// instance: the worker's cancel token fires before the termination
    /// signal is sent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Stop` with `NotRunning` when no live handle
    /// exists, or `Signal` when the process could not be terminated.
    pub async fn stop(&self, instance_id: &str, timeout: Duration) -> Result<StopAck> {
        let span = info_span!("stop_worker", instance_id);
        let _guard = span.enter();

        let worker = {
            let mut workers = self.workers.lock().await;
            workers.remove(instance_id)
        };

        let Some(mut worker) = worker else {
            return Err(StopError::NotRunning(format!(
                "no live worker for instance {instance_id}"
            ))
            .into());
        };

        // Abort any in-flight restart before signalling.
        worker.cancel.cancel();

        send_graceful_signal(&worker.child, instance_id)?;

        match tokio::time::timeout(timeout, worker.child.wait()).await {
            Ok(Ok(exit)) => {
                info!(instance_id, ?exit, "worker exited gracefully");
                Ok(StopAck { forced: false })
            }
            Ok(Err(err)) => Err(StopError::Signal(format!(
                "failed waiting for worker exit: {err}"
            ))
            .into()),
            Err(_) => {
                warn!(instance_id, "worker ignored graceful signal, forcing kill");
                worker
                    .child
                    .kill()
                    .await
                    .map_err(|err| StopError::Signal(format!("force kill failed: {err}")))?;
                Ok(StopAck { forced: true })
            }
        }
    }

    /// Whether the instance currently has a live worker process.
    pub async fn is_alive(&self, instance_id: &str) -> bool {
        let mut workers = self.workers.lock().await;
        match workers.get_mut(instance_id) {
            Some(worker) => matches!(worker.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Restart the instance's worker, preserving its local data file.
    ///
    /// Increments the monotonic restart counter. Aborts between the stop
    /// and start halves when a concurrent `stop` cancelled the worker.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Stop` if the running worker could not be
    /// terminated, or `AppError::Launch` if the replacement fails to spawn.
    pub async fn restart(&self, instance: &BotInstance) -> Result<WorkerHandle> {
        let span = info_span!("restart_worker", instance_id = %instance.id);
        let _guard = span.enter();

        let cancel = {
            let workers = self.workers.lock().await;
            workers.get(&instance.id).map(|w| w.cancel.clone())
        };

        if let Some(ref token) = cancel {
            if token.is_cancelled() {
                return Err(StopError::NotRunning(format!(
                    "restart of {} aborted: stop requested",
                    instance.id
                ))
                .into());
            }
            match self.stop(&instance.id, self.config.stop_timeout()).await {
                Ok(_) | Err(AppError::Stop(StopError::NotRunning(_))) => {}
                Err(err) => return Err(err),
            }
            // Stop wins: bail out before respawning if one raced in.
            if token.is_cancelled() {
                return Err(StopError::NotRunning(format!(
                    "restart of {} aborted after stop half",
                    instance.id
                ))
                .into());
            }
        }

        let mut next = instance.clone();
        next.restart_count = instance.restart_count.saturating_add(1);
        let handle = self.start(&next).await?;
        info!(
            instance_id = %instance.id,
            restart_count = handle.restart_count,
            "worker restarted"
        );
        Ok(handle)
    }

    /// Probe the worker's liveness and responsiveness.
    ///
    /// `Crashed` when the OS process has exited, `Unresponsive` when the
    /// heartbeat file is stale or unreadable within `probe_timeout`,
    /// `Healthy` otherwise. Workers younger than the staleness window get
    /// a startup grace period before a missing heartbeat counts against
    /// them. Probe transport failures classify as `Unresponsive` rather
    /// than propagating.
    pub async fn probe(&self, instance_id: &str) -> Option<HealthOutcome> {
        let (started_at, heartbeat_file) = {
            let mut workers = self.workers.lock().await;
            let worker = workers.get_mut(instance_id)?;
            match worker.child.try_wait() {
                Ok(Some(status)) => {
                    debug!(instance_id, ?status, "worker process exited");
                    return Some(HealthOutcome::Crashed);
                }
                Err(err) => {
                    warn!(instance_id, %err, "failed to poll worker process");
                    return Some(HealthOutcome::Crashed);
                }
                Ok(None) => {}
            }
            worker.handle.last_alive_at = Utc::now();
            (
                worker.handle.started_at,
                workspace::paths(&self.config, instance_id).heartbeat_file,
            )
        };

        let stale = Duration::from_secs(self.config.health.heartbeat_stale_seconds);
        let probe = tokio::time::timeout(
            self.config.probe_timeout(),
            tokio::fs::metadata(&heartbeat_file),
        )
        .await;

        let outcome = match probe {
            Ok(Ok(meta)) => {
                let fresh = meta
                    .modified()
                    .ok()
                    .and_then(|mtime| mtime.elapsed().ok())
                    .is_some_and(|age| age <= stale);
                if fresh {
                    HealthOutcome::Healthy
                } else {
                    HealthOutcome::Unresponsive
                }
            }
            Ok(Err(_)) => {
                // No heartbeat yet: allow startup grace for young workers.
                let age = Utc::now() - started_at;
                if age.to_std().is_ok_and(|a| a <= stale) {
                    HealthOutcome::Healthy
                } else {
                    HealthOutcome::Unresponsive
                }
            }
            Err(_) => {
                warn!(instance_id, "heartbeat probe timed out");
                HealthOutcome::Unresponsive
            }
        };

        Some(outcome)
    }

    /// Snapshot of the worker handle for an instance, if live.
    pub async fn handle(&self, instance_id: &str) -> Option<WorkerHandle> {
        let workers = self.workers.lock().await;
        workers.get(instance_id).map(|w| w.handle.clone())
    }

    /// Instance ids of all currently registered workers.
    pub async fn live_instance_ids(&self) -> Vec<String> {
        let workers = self.workers.lock().await;
        workers.keys().cloned().collect()
    }

    /// Number of currently registered workers.
    pub async fn live_count(&self) -> usize {
        let workers = self.workers.lock().await;
        workers.len()
    }

    /// Reset the live handle's restart counter.
    ///
    /// Used only on the deliberate Suspended→Active resume path; crash
    /// recovery keeps the counter monotonic.
    pub async fn reset_restart_counter(&self, instance_id: &str) {
        let mut workers = self.workers.lock().await;
        if let Some(worker) = workers.get_mut(instance_id) {
            worker.handle.restart_count = 0;
        }
    }

    /// Stop every live worker, used during graceful shutdown.
    pub async fn stop_all(&self, timeout: Duration) {
        let ids = self.live_instance_ids().await;
        for id in ids {
            if let Err(err) = self.stop(&id, timeout).await {
                warn!(instance_id = %id, %err, "failed to stop worker during shutdown");
            }
        }
    }
}

/// Send the platform's graceful termination signal to the worker.
#[cfg(unix)]
fn send_graceful_signal(child: &Child, instance_id: &str) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        // Already reaped; the wait below will return immediately.
        return Ok(());
    };
    let pid = i32::try_from(pid)
        .map_err(|_| AppError::Stop(StopError::Signal(format!("pid {pid} out of range"))))?;

    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::ESRCH) => {
            debug!(instance_id, pid, "worker already gone before SIGTERM");
            Ok(())
        }
        Err(err) => Err(StopError::Signal(format!("SIGTERM failed: {err}")).into()),
    }
}

/// Non-unix platforms have no graceful signal; rely on the bounded wait
/// plus force-kill in the caller.
#[cfg(not(unix))]
fn send_graceful_signal(_child: &Child, _instance_id: &str) -> Result<()> {
    Ok(())
}
