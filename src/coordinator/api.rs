//! Inbound control API for the excluded web/admin layer.
//!
//! Each operation validates and persists synchronously; the actual
//! process effects happen asynchronously through the reconciliation
//! loop. Failures are returned as reason-coded errors, never panics.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{info, info_span, warn};

use crate::models::instance::{BotInstance, LifecycleState};
use crate::{AppError, Result, StopError};

use super::Coordinator;

impl Coordinator {
    /// Deploy a new bot instance from a template.
    ///
    /// Charges the one-time creation fee, enforces the per-account
    /// instance quota, and persists the instance in `Provisioning`. The
    /// worker is started by the next reconciliation pass and the instance
    /// activates on its first successful health check.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Launch(InvalidTemplate)` for an empty template
    /// ref, `AppError::QuotaExceeded` at the per-account cap,
    /// `AppError::InsufficientBalance` when the creation fee cannot be
    /// collected, or `AppError::Db`/`AppError::NotFound` on persistence
    /// failures.
    pub async fn request_deploy(
        &self,
        account_id: &str,
        template_ref: &str,
        config: HashMap<String, String>,
    ) -> Result<BotInstance> {
        let span = info_span!("request_deploy", account_id, template_ref);
        let _guard = span.enter();

        if template_ref.is_empty() {
            return Err(crate::LaunchError::InvalidTemplate(
                "template ref must not be empty".into(),
            )
            .into());
        }

        // Existence check doubles as the NotFound reason code.
        self.account_repo.load(account_id).await?;

        let owned = self.instance_repo.count_for_account(account_id).await?;
        if owned >= u64::from(self.config.max_instances_per_account) {
            return Err(AppError::QuotaExceeded(format!(
                "account {account_id} already owns {owned} instances (max {})",
                self.config.max_instances_per_account
            )));
        }

        let daily_fee = config
            .get("daily_fee")
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|fee| *fee >= 0)
            .unwrap_or(self.config.default_daily_fee);

        let instance = BotInstance::new(
            account_id.to_owned(),
            template_ref.to_owned(),
            config,
            daily_fee,
        );

        // Fee and instance row commit together; a failed deploy costs
        // nothing.
        let created = self.billing.collect_creation_fee(&instance).await?;
        info!(instance_id = %created.id, "instance deployed, awaiting reconcile");
        Ok(created)
    }

    /// Stop a running instance on user request.
    ///
    /// The instance moves to `Suspended` with the grace window stamped;
    /// the reconciliation loop stops the worker asynchronously, but the
    /// supervisor is also asked synchronously so the common case does not
    /// wait a full cycle.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown instance or
    /// `AppError::InvalidTransition` when the instance is not running.
    pub async fn request_stop(&self, instance_id: &str) -> Result<BotInstance> {
        let span = info_span!("request_stop", instance_id);
        let _guard = span.enter();

        let _lock = self.locks.acquire(instance_id).await;

        let mut instance = self.instance_repo.load(instance_id).await?;
        if !instance.state.can_transition_to(LifecycleState::Suspended) {
            return Err(AppError::InvalidTransition(format!(
                "instance {instance_id} cannot be stopped from its current state"
            )));
        }

        instance.state = LifecycleState::Suspended;
        instance.suspended_at = Some(Utc::now());
        let saved = self.instance_repo.save(&instance).await?;

        match self
            .supervisor
            .stop(instance_id, self.config.stop_timeout())
            .await
        {
            Ok(ack) => info!(instance_id, forced = ack.forced, "worker stopped on request"),
            Err(AppError::Stop(StopError::NotRunning(_))) => {}
            Err(err) => warn!(instance_id, %err, "stop request deferred to reconciler"),
        }

        Ok(saved)
    }

    /// Delete an instance.
    ///
    /// Valid from any non-deleted state; a live worker is stopped even
    /// when the instance never left `Provisioning`. Resource reclamation
    /// is left to the cleanup sweep; the `Deleted` row survives as an
    /// immutable audit record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown instance or
    /// `AppError::InvalidTransition` when it is already deleted.
    pub async fn request_delete(&self, instance_id: &str) -> Result<BotInstance> {
        let span = info_span!("request_delete", instance_id);
        let _guard = span.enter();

        let lock = self.locks.acquire(instance_id).await;

        match self
            .supervisor
            .stop(instance_id, self.config.stop_timeout())
            .await
        {
            Ok(ack) => info!(instance_id, forced = ack.forced, "worker stopped for deletion"),
            Err(AppError::Stop(StopError::NotRunning(_))) => {}
            Err(err) => warn!(instance_id, %err, "failed to stop worker before deletion"),
        }

        let deleted = self
            .instance_repo
            .set_state(instance_id, LifecycleState::Deleted)
            .await?;
        self.clear_failure_history(instance_id).await;
        drop(lock);
        self.locks.forget(instance_id).await;

        info!(instance_id, "instance deleted");
        Ok(deleted)
    }

    /// Credit an account and resume any payment-blocked instances the
    /// credit can fund.
    ///
    /// Resumed instances get their failure history cleared so the
    /// deliberate Suspended→Active restart starts from a clean slate.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown account or
    /// `AppError::Config` for a non-positive amount.
    pub async fn top_up_balance(&self, account_id: &str, amount: i64) -> Result<Vec<BotInstance>> {
        let resumed = self.billing.top_up(account_id, amount).await?;
        for instance in &resumed {
            self.clear_failure_history(&instance.id).await;
        }
        Ok(resumed)
    }

    /// Admin override: return a `LaunchFailed` or `ChronicFailure`
    /// instance to `Provisioning` after manual review.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` when the instance is not in
    /// a manually-clearable state.
    pub async fn clear_failure(&self, instance_id: &str) -> Result<BotInstance> {
        let span = info_span!("clear_failure", instance_id);
        let _guard = span.enter();

        let _lock = self.locks.acquire(instance_id).await;
        let cleared = self
            .instance_repo
            .set_state(instance_id, LifecycleState::Provisioning)
            .await?;
        self.clear_failure_history(instance_id).await;

        info!(instance_id, "failure state cleared by admin");
        Ok(cleared)
    }
}
