//! Billing state machine — converts balance and elapsed time into
//! lifecycle state.
//!
//! The single writer of account balances. A debit and the lifecycle
//! transition it funds are one `SQLite` transaction: no observable state
//! shows `Active` with the fee uncollected, and no debit lands without a
//! state confirmation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn};

use crate::config::GlobalConfig;
use crate::locks::InstanceLocks;
use crate::models::instance::{BotInstance, LifecycleState, WarnTier};
use crate::notify::{NotificationKind, SharedNotifier};
use crate::persistence::account_repo::AccountRepo;
use crate::persistence::instance_repo::InstanceRepo;
use crate::{AppError, Result};

/// Billing engine driving per-instance ticks and top-up resumes.
pub struct BillingEngine {
    db: Arc<sqlx::SqlitePool>,
    config: Arc<GlobalConfig>,
    instance_repo: InstanceRepo,
    account_repo: AccountRepo,
    notifier: SharedNotifier,
    locks: Arc<InstanceLocks>,
}

impl BillingEngine {
    /// Create a billing engine over the shared pool and lock map.
    #[must_use]
    pub fn new(
        db: Arc<sqlx::SqlitePool>,
        config: Arc<GlobalConfig>,
        notifier: SharedNotifier,
        locks: Arc<InstanceLocks>,
    ) -> Self {
        Self {
            instance_repo: InstanceRepo::new(Arc::clone(&db)),
            account_repo: AccountRepo::new(Arc::clone(&db)),
            db,
            config,
            notifier,
            locks,
        }
    }

    /// Spawn the periodic billing sweep task.
    #[must_use]
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.billing.sweep_interval_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("billing sweep shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.run_sweep().await;
                    }
                }
            }
        })
    }

    /// Tick every billable instance once. Per-instance failures are
    /// logged and never abort the sweep for other instances.
    pub async fn run_sweep(&self) {
        let mut instances = Vec::new();
        for state in [LifecycleState::Active, LifecycleState::PaymentWarned] {
            match self.instance_repo.list_by_state(state).await {
                Ok(mut batch) => instances.append(&mut batch),
                Err(err) => {
                    error!(%err, state = ?state, "failed to list instances for billing sweep");
                }
            }
        }

        for instance in instances {
            let _lock = self.locks.acquire(&instance.id).await;
            if let Err(err) = self.tick(&instance.id).await {
                error!(instance_id = %instance.id, %err, "billing tick failed");
            }
        }
    }

    /// Run one billing tick for an instance.
    ///
    /// Active: debit when a billing period has elapsed, or enter
    /// `PaymentWarned` with a tier-1 notification when the balance is
    /// short. `PaymentWarned`: escalate to the final warning tier and then
    /// to `Suspended` on the configured schedule; resumption happens only
    /// via [`top_up`](Self::top_up).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on persistence failure or
    /// `AppError::BillingInconsistency` when a debit cannot be confirmed;
    /// either leaves the instance in its last confirmed state.
    pub async fn tick(&self, instance_id: &str) -> Result<()> {
        let span = info_span!("billing_tick", instance_id);
        let _guard = span.enter();

        let instance = self.instance_repo.load(instance_id).await?;
        let now = Utc::now();

        match instance.state {
            LifecycleState::Active => self.tick_active(&instance, now).await,
            LifecycleState::PaymentWarned => self.tick_warned(&instance, now).await,
            // Ticks only apply to billable states; anything else is a
            // no-op rather than an error so sweeps stay idempotent.
            _ => Ok(()),
        }
    }

    async fn tick_active(&self, instance: &BotInstance, now: DateTime<Utc>) -> Result<()> {
        let period = chrono::Duration::seconds(
            i64::try_from(self.config.billing.period_seconds).unwrap_or(86_400),
        );
        let due = instance.last_debit_at.is_none_or(|t| now - t >= period);
        if !due {
            return Ok(());
        }

        if self.debit_and_confirm(instance, now, false).await? {
            info!(
                instance_id = %instance.id,
                fee = instance.daily_fee,
                "periodic fee collected"
            );
            return Ok(());
        }

        // Balance short: one transition, one notification.
        let mut warned = instance.clone();
        warned.state = LifecycleState::PaymentWarned;
        warned.warned_at = Some(now);
        warned.warn_tier = WarnTier::First;
        self.instance_repo.save(&warned).await?;

        warn!(
            instance_id = %instance.id,
            fee = instance.daily_fee,
            "balance insufficient, payment warning issued"
        );
        self.notifier.notify(
            &instance.account_id,
            NotificationKind::PaymentWarning { tier: 1 },
            &warning_payload(instance),
        );
        Ok(())
    }

    async fn tick_warned(&self, instance: &BotInstance, now: DateTime<Utc>) -> Result<()> {
        let Some(warned_at) = instance.warned_at else {
            return Err(AppError::BillingInconsistency(format!(
                "instance {} is payment_warned without warned_at",
                instance.id
            )));
        };

        let elapsed = now - warned_at;
        let suspend_after = chrono::Duration::seconds(
            i64::try_from(self.config.billing.suspend_after_seconds).unwrap_or(i64::MAX),
        );
        let final_after = chrono::Duration::seconds(
            i64::try_from(self.config.billing.final_warning_after_seconds).unwrap_or(i64::MAX),
        );

        if elapsed >= suspend_after {
            let mut suspended = instance.clone();
            suspended.state = LifecycleState::Suspended;
            suspended.suspended_at = Some(now);
            self.instance_repo.save(&suspended).await?;

            warn!(instance_id = %instance.id, "warning period elapsed, instance suspended");
            self.notifier.notify(
                &instance.account_id,
                NotificationKind::Suspended,
                &warning_payload(instance),
            );
            return Ok(());
        }

        if elapsed >= final_after && instance.warn_tier == WarnTier::First {
            let mut finally_warned = instance.clone();
            finally_warned.warn_tier = WarnTier::Final;
            self.instance_repo.save(&finally_warned).await?;

            self.notifier.notify(
                &instance.account_id,
                NotificationKind::PaymentWarning { tier: 2 },
                &warning_payload(instance),
            );
        }

        Ok(())
    }

    /// Credit a top-up, then attempt a resume debit for every owned
    /// instance sitting in `PaymentWarned` or `Suspended`.
    ///
    /// Returns the instances that resumed to `Active`; resuming from
    /// `Suspended` clears the grace window and resets the restart counter.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown account,
    /// `AppError::Config` for a non-positive amount, or `AppError::Db` on
    /// persistence failure. Individual resume failures are logged, not
    /// propagated.
    pub async fn top_up(&self, account_id: &str, amount: i64) -> Result<Vec<BotInstance>> {
        let span = info_span!("top_up", account_id, amount);
        let _guard = span.enter();

        let account = self.account_repo.credit(account_id, amount).await?;
        info!(account_id, balance = account.balance, "balance credited");

        let mut resumed = Vec::new();
        for instance in self.instance_repo.list_for_account(account_id).await? {
            if !matches!(
                instance.state,
                LifecycleState::PaymentWarned | LifecycleState::Suspended
            ) {
                continue;
            }

            let _lock = self.locks.acquire(&instance.id).await;
            // Re-load under the lock; a concurrent tick may have moved it.
            let current = self.instance_repo.load(&instance.id).await?;
            if !matches!(
                current.state,
                LifecycleState::PaymentWarned | LifecycleState::Suspended
            ) {
                continue;
            }

            let from_suspended = current.state == LifecycleState::Suspended;
            match self.debit_and_confirm(&current, Utc::now(), from_suspended).await {
                Ok(true) => {
                    info!(instance_id = %current.id, "instance resumed after top-up");
                    self.notifier.notify(
                        account_id,
                        NotificationKind::Resumed,
                        &warning_payload(&current),
                    );
                    resumed.push(self.instance_repo.load(&current.id).await?);
                }
                Ok(false) => {
                    // Not enough for this instance's fee; leave it be.
                }
                Err(err) => {
                    error!(instance_id = %current.id, %err, "resume debit failed");
                }
            }
        }

        Ok(resumed)
    }

    /// Collect the one-time creation fee and persist the new instance.
    ///
    /// The conditional debit and the instance insert are one transaction,
    /// so a crash or insert failure never leaves the fee collected
    /// without an instance row.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InsufficientBalance` when the fee is not
    /// covered (nothing changes) or `AppError::Db` on persistence
    /// failure.
    pub async fn collect_creation_fee(&self, instance: &BotInstance) -> Result<BotInstance> {
        let fee = self.config.creation_fee;

        let mut tx = self.db.begin().await?;

        let debited = sqlx::query(
            "UPDATE account SET balance = balance - ?2, total_spent = total_spent + ?2,
             updated_at = ?3 WHERE id = ?1 AND balance >= ?2",
        )
        .bind(&instance.account_id)
        .bind(fee)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        if debited.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(AppError::InsufficientBalance(format!(
                "creation fee {fee} not covered"
            )));
        }

        self.instance_repo.insert_with(&mut *tx, instance).await?;
        tx.commit().await?;

        info!(instance_id = %instance.id, fee, "creation fee collected");
        Ok(instance.clone())
    }

    /// Atomically debit the fee and confirm the `Active` transition.
    ///
    /// Returns `Ok(false)` when the balance is insufficient (nothing
    /// changed). The conditional balance update and the instance state
    /// write commit together or not at all.
    async fn debit_and_confirm(
        &self,
        instance: &BotInstance,
        now: DateTime<Utc>,
        reset_restart_counter: bool,
    ) -> Result<bool> {
        let fee = instance.daily_fee;
        let now_s = now.to_rfc3339();

        let mut tx = self.db.begin().await?;

        let debited = sqlx::query(
            "UPDATE account SET balance = balance - ?2, total_spent = total_spent + ?2,
             updated_at = ?3 WHERE id = ?1 AND balance >= ?2",
        )
        .bind(&instance.account_id)
        .bind(fee)
        .bind(&now_s)
        .execute(&mut *tx)
        .await?;

        if debited.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let confirmed = sqlx::query(
            "UPDATE bot_instance SET state = 'active', last_debit_at = ?2, warned_at = NULL,
             warn_tier = 'none', suspended_at = NULL, updated_at = ?2,
             restart_count = CASE WHEN ?3 THEN 0 ELSE restart_count END
             WHERE id = ?1 AND state IN ('active', 'payment_warned', 'suspended')",
        )
        .bind(&instance.id)
        .bind(&now_s)
        .bind(reset_restart_counter)
        .execute(&mut *tx)
        .await?;

        if confirmed.rows_affected() == 0 {
            // Debit without a state confirmation must never land.
            tx.rollback().await?;
            return Err(AppError::BillingInconsistency(format!(
                "debit for instance {} had no state confirmation, rolled back",
                instance.id
            )));
        }

        tx.commit().await?;
        Ok(true)
    }
}

fn warning_payload(instance: &BotInstance) -> String {
    serde_json::json!({
        "instance_id": instance.id,
        "template_ref": instance.template_ref,
        "daily_fee": instance.daily_fee,
    })
    .to_string()
}
