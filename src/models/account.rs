//! Account model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Billing account owning zero or more bot instances.
///
/// The balance is mutated only through the billing engine's atomic debit
/// and the top-up path; every other component reads it as a snapshot.
/// Owned instances are derived by query, never cached on the account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Account {
    /// Unique record identifier.
    pub id: String,
    /// Current balance in minor currency units; non-negative once reconciled.
    pub balance: i64,
    /// Cumulative amount debited over the account's lifetime.
    pub total_spent: i64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Construct a new account with a generated id and the given balance.
    #[must_use]
    pub fn new(balance: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            balance,
            total_spent: 0,
            created_at: now,
            updated_at: now,
        }
    }
}
