//! Worker handle metadata.

use chrono::{DateTime, Utc};

/// Metadata for one live worker process.
///
/// Owned exclusively by the process supervisor; other components receive
/// cloned snapshots and reference workers by instance id only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    /// Instance this worker executes.
    pub instance_id: String,
    /// OS process id, when the runtime reported one.
    pub pid: Option<u32>,
    /// When the process was spawned.
    pub started_at: DateTime<Utc>,
    /// Restarts since the last deliberate Suspended→Active resume.
    pub restart_count: u32,
    /// When the worker was last observed alive.
    pub last_alive_at: DateTime<Utc>,
}

/// Acknowledgement returned by a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopAck {
    /// True when the graceful window expired and the worker was killed.
    pub forced: bool,
}

impl WorkerHandle {
    /// Construct a handle for a freshly spawned worker.
    #[must_use]
    pub fn new(instance_id: String, pid: Option<u32>, restart_count: u32) -> Self {
        let now = Utc::now();
        Self {
            instance_id,
            pid,
            started_at: now,
            restart_count,
            last_alive_at: now,
        }
    }
}
