//! Account repository for `SQLite` persistence.
//!
//! Balance writes outside the billing engine's transactional debit are
//! limited to credits (top-ups); everything else reads snapshots.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::account::Account;
use crate::{AppError, Result};

/// Repository wrapper around `SQLite` for account records.
#[derive(Clone)]
pub struct AccountRepo {
    db: Arc<sqlx::SqlitePool>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct AccountRow {
    id: String,
    balance: i64,
    total_spent: i64,
    created_at: String,
    updated_at: String,
}

impl AccountRow {
    fn into_account(self) -> Result<Account> {
        Ok(Account {
            id: self.id,
            balance: self.balance,
            total_spent: self.total_spent,
            created_at: parse_dt(&self.created_at, "created_at")?,
            updated_at: parse_dt(&self.updated_at, "updated_at")?,
        })
    }
}

fn parse_dt(s: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {field}: {e}")))
}

impl AccountRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<sqlx::SqlitePool>) -> Self {
        Self { db }
    }

    /// Insert a new account record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the database insert fails.
    pub async fn create(&self, account: &Account) -> Result<Account> {
        sqlx::query(
            "INSERT INTO account (id, balance, total_spent, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&account.id)
        .bind(account.balance)
        .bind(account.total_spent)
        .bind(account.created_at.to_rfc3339())
        .bind(account.updated_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;

        Ok(account.clone())
    }

    /// Retrieve an account by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the account does not exist, or
    /// `AppError::Db` if the query fails.
    pub async fn load(&self, id: &str) -> Result<Account> {
        let row: Option<AccountRow> = sqlx::query_as("SELECT * FROM account WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(AccountRow::into_account)
            .transpose()?
            .ok_or_else(|| AppError::NotFound(format!("account {id} not found")))
    }

    /// Credit a balance top-up.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the amount is not positive,
    /// `AppError::NotFound` if the account does not exist, or
    /// `AppError::Db` if the update fails.
    pub async fn credit(&self, id: &str, amount: i64) -> Result<Account> {
        if amount <= 0 {
            return Err(AppError::Config(format!(
                "top-up amount must be positive, got {amount}"
            )));
        }

        let result = sqlx::query(
            "UPDATE account SET balance = balance + ?2, updated_at = ?3 WHERE id = ?1",
        )
        .bind(id)
        .bind(amount)
        .bind(Utc::now().to_rfc3339())
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("account {id} not found")));
        }

        self.load(id).await
    }
}
