//! Health probe outcomes and per-worker failure bookkeeping.

use chrono::{DateTime, Utc};

/// Classification of one health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    /// Process alive and heartbeat fresh.
    Healthy,
    /// Process alive but the probe timed out or the heartbeat is stale.
    Unresponsive,
    /// OS process has exited.
    Crashed,
}

/// Ephemeral record of the most recent probe for a worker.
///
/// Rebuilt every poll cycle; never authoritative for billing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthRecord {
    /// Instance whose worker was probed.
    pub instance_id: String,
    /// When the probe ran.
    pub checked_at: DateTime<Utc>,
    /// Probe classification.
    pub outcome: HealthOutcome,
    /// Consecutive non-healthy probes, including this one.
    pub consecutive_failures: u32,
}

impl HealthRecord {
    /// Build a record for the current cycle.
    #[must_use]
    pub fn new(instance_id: String, outcome: HealthOutcome, consecutive_failures: u32) -> Self {
        Self {
            instance_id,
            checked_at: Utc::now(),
            outcome,
            consecutive_failures,
        }
    }
}
