#![forbid(unsafe_code)]

//! `botfoundry` — orchestration core for a template bot factory.
//!
//! Turns a user's template selection and payment state into running,
//! monitored, isolated worker processes: process supervision, health
//! polling with auto-restart, payment-driven lifecycle transitions,
//! reconciliation of desired vs. observed state, and grace-window cleanup.

pub mod billing;
pub mod cleanup;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod locks;
pub mod models;
pub mod monitor;
pub mod notify;
pub mod persistence;
pub mod supervisor;

pub use config::GlobalConfig;
pub use errors::{AppError, LaunchError, Result, StopError};
