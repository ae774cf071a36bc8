//! Persistence layer modules.

pub mod account_repo;
pub mod db;
pub mod instance_repo;
pub mod schema;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;
