//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS` — safe to
//! re-run on every startup. Produces a convergent result.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// Creates both tables idempotently. Safe to call on every startup.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS account (
    id              TEXT PRIMARY KEY NOT NULL,
    balance         INTEGER NOT NULL DEFAULT 0,
    total_spent     INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS bot_instance (
    id                TEXT PRIMARY KEY NOT NULL,
    account_id        TEXT NOT NULL,
    template_ref      TEXT NOT NULL,
    config            TEXT NOT NULL,
    state             TEXT NOT NULL CHECK(state IN ('provisioning','active','payment_warned','suspended','launch_failed','chronic_failure','deleted')),
    daily_fee         INTEGER NOT NULL,
    restart_count     INTEGER NOT NULL DEFAULT 0,
    last_debit_at     TEXT,
    last_health_at    TEXT,
    warned_at         TEXT,
    warn_tier         TEXT NOT NULL DEFAULT 'none' CHECK(warn_tier IN ('none','first','final')),
    suspended_at      TEXT,
    resources_cleared INTEGER NOT NULL DEFAULT 0,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL,
    deleted_at        TEXT
);

CREATE INDEX IF NOT EXISTS idx_instance_state ON bot_instance(state);
CREATE INDEX IF NOT EXISTS idx_instance_account ON bot_instance(account_id);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
