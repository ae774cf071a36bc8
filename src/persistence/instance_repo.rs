//! Bot instance repository for `SQLite` persistence.
//!
//! The sole durable source of truth for instance lifecycle state. Core
//! components go through `load`/`save`/`list_by_state` and never cache
//! authoritative state longer than one cycle.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::instance::{BotInstance, LifecycleState, WarnTier};
use crate::{AppError, Result};

/// Repository wrapper around `SQLite` for bot instance records.
#[derive(Clone)]
pub struct InstanceRepo {
    db: Arc<sqlx::SqlitePool>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: String,
    account_id: String,
    template_ref: String,
    config: String,
    state: String,
    daily_fee: i64,
    restart_count: i64,
    last_debit_at: Option<String>,
    last_health_at: Option<String>,
    warned_at: Option<String>,
    warn_tier: String,
    suspended_at: Option<String>,
    resources_cleared: i64,
    created_at: String,
    updated_at: String,
    deleted_at: Option<String>,
}

impl InstanceRow {
    /// Convert a database row into the domain model.
    fn into_instance(self) -> Result<BotInstance> {
        let state = parse_state(&self.state)?;
        let warn_tier = parse_warn_tier(&self.warn_tier)?;
        let config: HashMap<String, String> = serde_json::from_str(&self.config)
            .map_err(|e| AppError::Db(format!("invalid config blob: {e}")))?;

        Ok(BotInstance {
            id: self.id,
            account_id: self.account_id,
            template_ref: self.template_ref,
            config,
            state,
            daily_fee: self.daily_fee,
            restart_count: u32::try_from(self.restart_count.max(0)).unwrap_or(u32::MAX),
            last_debit_at: parse_opt_dt(self.last_debit_at.as_deref(), "last_debit_at")?,
            last_health_at: parse_opt_dt(self.last_health_at.as_deref(), "last_health_at")?,
            warned_at: parse_opt_dt(self.warned_at.as_deref(), "warned_at")?,
            warn_tier,
            suspended_at: parse_opt_dt(self.suspended_at.as_deref(), "suspended_at")?,
            resources_cleared: self.resources_cleared != 0,
            created_at: parse_dt(&self.created_at, "created_at")?,
            updated_at: parse_dt(&self.updated_at, "updated_at")?,
            deleted_at: parse_opt_dt(self.deleted_at.as_deref(), "deleted_at")?,
        })
    }
}

fn parse_dt(s: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {field}: {e}")))
}

fn parse_opt_dt(s: Option<&str>, field: &str) -> Result<Option<DateTime<Utc>>> {
    s.map(|v| parse_dt(v, field)).transpose()
}

pub(crate) fn parse_state(s: &str) -> Result<LifecycleState> {
    match s {
        "provisioning" => Ok(LifecycleState::Provisioning),
        "active" => Ok(LifecycleState::Active),
        "payment_warned" => Ok(LifecycleState::PaymentWarned),
        "suspended" => Ok(LifecycleState::Suspended),
        "launch_failed" => Ok(LifecycleState::LaunchFailed),
        "chronic_failure" => Ok(LifecycleState::ChronicFailure),
        "deleted" => Ok(LifecycleState::Deleted),
        other => Err(AppError::Db(format!("invalid lifecycle state: {other}"))),
    }
}

pub(crate) fn state_str(s: LifecycleState) -> &'static str {
    match s {
        LifecycleState::Provisioning => "provisioning",
        LifecycleState::Active => "active",
        LifecycleState::PaymentWarned => "payment_warned",
        LifecycleState::Suspended => "suspended",
        LifecycleState::LaunchFailed => "launch_failed",
        LifecycleState::ChronicFailure => "chronic_failure",
        LifecycleState::Deleted => "deleted",
    }
}

fn parse_warn_tier(s: &str) -> Result<WarnTier> {
    match s {
        "none" => Ok(WarnTier::None),
        "first" => Ok(WarnTier::First),
        "final" => Ok(WarnTier::Final),
        other => Err(AppError::Db(format!("invalid warn tier: {other}"))),
    }
}

fn warn_tier_str(t: WarnTier) -> &'static str {
    match t {
        WarnTier::None => "none",
        WarnTier::First => "first",
        WarnTier::Final => "final",
    }
}

impl InstanceRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<sqlx::SqlitePool>) -> Self {
        Self { db }
    }

    /// Insert a new bot instance record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the database insert fails.
    pub async fn create(&self, instance: &BotInstance) -> Result<BotInstance> {
        self.insert_with(self.db.as_ref(), instance).await?;
        Ok(instance.clone())
    }

    /// Insert through a caller-supplied executor so the row can join a
    /// larger transaction.
    pub(crate) async fn insert_with<'e, E>(&self, executor: E, instance: &BotInstance) -> Result<()>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let config = serde_json::to_string(&instance.config)
            .map_err(|e| AppError::Db(format!("config blob not serializable: {e}")))?;

        sqlx::query(
            "INSERT INTO bot_instance (id, account_id, template_ref, config, state, daily_fee,
             restart_count, last_debit_at, last_health_at, warned_at, warn_tier, suspended_at,
             resources_cleared, created_at, updated_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        )
        .bind(&instance.id)
        .bind(&instance.account_id)
        .bind(&instance.template_ref)
        .bind(&config)
        .bind(state_str(instance.state))
        .bind(instance.daily_fee)
        .bind(i64::from(instance.restart_count))
        .bind(instance.last_debit_at.map(|dt| dt.to_rfc3339()))
        .bind(instance.last_health_at.map(|dt| dt.to_rfc3339()))
        .bind(instance.warned_at.map(|dt| dt.to_rfc3339()))
        .bind(warn_tier_str(instance.warn_tier))
        .bind(instance.suspended_at.map(|dt| dt.to_rfc3339()))
        .bind(i64::from(instance.resources_cleared))
        .bind(instance.created_at.to_rfc3339())
        .bind(instance.updated_at.to_rfc3339())
        .bind(instance.deleted_at.map(|dt| dt.to_rfc3339()))
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Retrieve an instance by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the instance does not exist, or
    /// `AppError::Db` if the query fails.
    pub async fn load(&self, id: &str) -> Result<BotInstance> {
        let row: Option<InstanceRow> = sqlx::query_as("SELECT * FROM bot_instance WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(InstanceRow::into_instance)
            .transpose()?
            .ok_or_else(|| AppError::NotFound(format!("instance {id} not found")))
    }

    /// Persist the full instance record, bumping `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails or matches no row.
    pub async fn save(&self, instance: &BotInstance) -> Result<BotInstance> {
        let mut current = instance.clone();
        current.updated_at = Utc::now();

        let config = serde_json::to_string(&current.config)
            .map_err(|e| AppError::Db(format!("config blob not serializable: {e}")))?;

        let result = sqlx::query(
            "UPDATE bot_instance SET account_id = ?2, template_ref = ?3, config = ?4,
             state = ?5, daily_fee = ?6, restart_count = ?7, last_debit_at = ?8,
             last_health_at = ?9, warned_at = ?10, warn_tier = ?11, suspended_at = ?12,
             resources_cleared = ?13, updated_at = ?14, deleted_at = ?15
             WHERE id = ?1",
        )
        .bind(&current.id)
        .bind(&current.account_id)
        .bind(&current.template_ref)
        .bind(&config)
        .bind(state_str(current.state))
        .bind(current.daily_fee)
        .bind(i64::from(current.restart_count))
        .bind(current.last_debit_at.map(|dt| dt.to_rfc3339()))
        .bind(current.last_health_at.map(|dt| dt.to_rfc3339()))
        .bind(current.warned_at.map(|dt| dt.to_rfc3339()))
        .bind(warn_tier_str(current.warn_tier))
        .bind(current.suspended_at.map(|dt| dt.to_rfc3339()))
        .bind(i64::from(current.resources_cleared))
        .bind(current.updated_at.to_rfc3339())
        .bind(current.deleted_at.map(|dt| dt.to_rfc3339()))
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::Db(format!(
                "instance {} vanished during save",
                current.id
            )));
        }

        Ok(current)
    }

    /// Transition an instance to a new lifecycle state, respecting the
    /// state machine.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the transition is not
    /// permitted, or `AppError::Db` if persistence fails.
    pub async fn set_state(&self, id: &str, next: LifecycleState) -> Result<BotInstance> {
        let mut current = self.load(id).await?;
        if !current.state.can_transition_to(next) {
            return Err(AppError::InvalidTransition(format!(
                "{} -> {} for instance {id}",
                state_str(current.state),
                state_str(next)
            )));
        }

        current.state = next;
        if next == LifecycleState::Deleted {
            current.deleted_at = Some(Utc::now());
        }
        self.save(&current).await
    }

    /// List instances in a given lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_by_state(&self, state: LifecycleState) -> Result<Vec<BotInstance>> {
        let rows: Vec<InstanceRow> = sqlx::query_as(
            "SELECT * FROM bot_instance WHERE state = ?1 ORDER BY created_at ASC",
        )
        .bind(state_str(state))
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(InstanceRow::into_instance).collect()
    }

    /// List all instances owned by an account, excluding deleted ones.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_account(&self, account_id: &str) -> Result<Vec<BotInstance>> {
        let rows: Vec<InstanceRow> = sqlx::query_as(
            "SELECT * FROM bot_instance WHERE account_id = ?1 AND state != 'deleted'
             ORDER BY created_at ASC",
        )
        .bind(account_id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(InstanceRow::into_instance).collect()
    }

    /// Count non-deleted instances owned by an account.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn count_for_account(&self, account_id: &str) -> Result<u64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM bot_instance WHERE account_id = ?1 AND state != 'deleted'",
        )
        .bind(account_id)
        .fetch_one(self.db.as_ref())
        .await?;

        Ok(u64::try_from(row.0.max(0)).unwrap_or(0))
    }

    /// Stamp the last successful health probe time.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn touch_last_health(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE bot_instance SET last_health_at = ?2, updated_at = ?3 WHERE id = ?1",
        )
        .bind(id)
        .bind(at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }
}
