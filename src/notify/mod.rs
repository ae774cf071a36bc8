//! Outbound notification boundary.
//!
//! The actual delivery transport (the platform's Telegram/web layer) is an
//! external collaborator, so the core only defines the contract: exactly
//! one notification per qualifying lifecycle transition, delivery failures
//! logged but never fatal to the emitting loop.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

/// Kind of lifecycle notification delivered to an account owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    /// Balance fell below the fee; tier 1 is the first warning, tier 2 final.
    PaymentWarning {
        /// Warning tier, 1-based.
        tier: u8,
    },
    /// Warning period elapsed; the worker was stopped.
    Suspended,
    /// Launch retries exhausted; manual intervention required.
    LaunchFailed,
    /// Restart storm detected; manual clear required.
    ChronicFailure,
    /// Payment collected after a warning or suspension; instance active again.
    Resumed,
}

/// Delivery contract for account-facing notifications.
pub trait Notifier: Send + Sync {
    /// Deliver one notification for a qualifying transition.
    fn notify(&self, account_id: &str, kind: NotificationKind, payload: &str);
}

/// Notifier that emits through `tracing`, standing in for the excluded
/// delivery transport.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, account_id: &str, kind: NotificationKind, payload: &str) {
        info!(account_id, ?kind, payload, "notification emitted");
    }
}

/// Test notifier recording every delivery for exactly-once assertions.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, NotificationKind, String)>>,
}

impl RecordingNotifier {
    /// Snapshot of all recorded notifications in delivery order.
    pub async fn sent(&self) -> Vec<(String, NotificationKind, String)> {
        self.sent.lock().await.clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, account_id: &str, kind: NotificationKind, payload: &str) {
        // Recording must not block the emitting loop; fall back to a log
        // line if the lock is contended (only possible mid-assertion).
        match self.sent.try_lock() {
            Ok(mut sent) => sent.push((account_id.to_owned(), kind, payload.to_owned())),
            Err(_) => warn!(account_id, "recording notifier lock contended, dropping"),
        }
    }
}

/// Shared notifier handle used across background tasks.
pub type SharedNotifier = Arc<dyn Notifier>;
