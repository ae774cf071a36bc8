//! Bot instance model and lifecycle helpers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state for a deployed bot instance.
///
/// Transitions happen only through the billing state machine or explicit
/// user/admin action routed through the coordinator; the health monitor
/// only reports and never writes state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Instance created; worker not yet confirmed healthy.
    Provisioning,
    /// Fee collected and worker expected to be running.
    Active,
    /// Balance fell below the fee; worker keeps running during the
    /// warning period.
    PaymentWarned,
    /// Warning period elapsed without payment; worker stopped, grace
    /// window running.
    Suspended,
    /// Launch retries exhausted; requires manual intervention.
    LaunchFailed,
    /// Restart storm detected; requires manual clear.
    ChronicFailure,
    /// Terminal audit record; immutable once reached.
    Deleted,
}

impl LifecycleState {
    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (
                Self::Provisioning,
                Self::Active | Self::LaunchFailed | Self::Deleted
            ) | (
                Self::Active,
                Self::PaymentWarned
                    | Self::Suspended
                    | Self::ChronicFailure
                    | Self::LaunchFailed
                    | Self::Deleted
            ) | (
                Self::PaymentWarned,
                Self::Active
                    | Self::Suspended
                    | Self::ChronicFailure
                    | Self::LaunchFailed
                    | Self::Deleted
            ) | (Self::Suspended, Self::Active | Self::Deleted)
                | (Self::LaunchFailed | Self::ChronicFailure, Self::Provisioning | Self::Deleted)
        )
    }

    /// Whether the instance should have a running worker in this state.
    #[must_use]
    pub fn wants_worker(self) -> bool {
        matches!(self, Self::Provisioning | Self::Active | Self::PaymentWarned)
    }

    /// Whether the state is terminal for automation (human review or audit).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::LaunchFailed | Self::ChronicFailure | Self::Deleted)
    }
}

/// Payment warning tier already delivered for the current warning episode.
///
/// Persisted on the instance so each tier notification fires exactly once
/// per transition, not once per billing tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WarnTier {
    /// No warning outstanding.
    None,
    /// First warning sent on entering `PaymentWarned`.
    First,
    /// Final warning sent partway through the warning period.
    Final,
}

/// Bot instance domain entity persisted in `SQLite`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BotInstance {
    /// Unique record identifier.
    pub id: String,
    /// Owning account; immutable after creation.
    pub account_id: String,
    /// Template the worker executes; opaque to this core.
    pub template_ref: String,
    /// Opaque per-instance configuration blob.
    pub config: HashMap<String, String>,
    /// Current lifecycle state.
    pub state: LifecycleState,
    /// Fee debited once per billing period (minor currency units).
    pub daily_fee: i64,
    /// Monotonic worker restart counter; reset only on Suspended→Active.
    pub restart_count: u32,
    /// When the periodic fee was last collected.
    pub last_debit_at: Option<DateTime<Utc>>,
    /// When the worker last answered a health probe.
    pub last_health_at: Option<DateTime<Utc>>,
    /// Entry into the current warning episode.
    pub warned_at: Option<DateTime<Utc>>,
    /// Highest warning tier already notified for this episode.
    pub warn_tier: WarnTier,
    /// Grace window start: entry into `Suspended`. Written by the billing
    /// transition, read by cleanup, cleared only on resume.
    pub suspended_at: Option<DateTime<Utc>>,
    /// Whether the working directory and data file have been reclaimed.
    pub resources_cleared: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// When the instance reached `Deleted`.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl BotInstance {
    /// Construct a new instance in `Provisioning` with a generated id.
    #[must_use]
    pub fn new(
        account_id: String,
        template_ref: String,
        config: HashMap<String, String>,
        daily_fee: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            account_id,
            template_ref,
            config,
            state: LifecycleState::Provisioning,
            daily_fee,
            restart_count: 0,
            last_debit_at: None,
            last_health_at: None,
            warned_at: None,
            warn_tier: WarnTier::None,
            suspended_at: None,
            resources_cleared: false,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}
