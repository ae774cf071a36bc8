//! Error types shared across the orchestration core.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Launch failure classification for worker process start attempts.
///
/// Launch errors are retried with exponential backoff by the coordinator;
/// once the retry budget is exhausted the instance is marked `LaunchFailed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    /// The instance already has a live worker handle.
    AlreadyRunning(String),
    /// The configured live-worker ceiling has been reached.
    ResourceExhausted(String),
    /// The template reference is empty or unknown.
    InvalidTemplate(String),
    /// The OS refused to spawn the worker process.
    Spawn(String),
    /// The per-instance working directory could not be prepared.
    Workspace(String),
}

impl Display for LaunchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyRunning(msg) => write!(f, "already running: {msg}"),
            Self::ResourceExhausted(msg) => write!(f, "resource exhausted: {msg}"),
            Self::InvalidTemplate(msg) => write!(f, "invalid template: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn failed: {msg}"),
            Self::Workspace(msg) => write!(f, "workspace setup failed: {msg}"),
        }
    }
}

/// Stop failure classification.
///
/// A worker that ignores the graceful signal is force-killed and the stop
/// still reports success, so `StopError` only covers cases where the
/// supervisor could not act at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopError {
    /// No live worker handle exists for the instance.
    NotRunning(String),
    /// Sending the termination signal or reaping the process failed.
    Signal(String),
}

impl Display for StopError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRunning(msg) => write!(f, "not running: {msg}"),
            Self::Signal(msg) => write!(f, "signal failed: {msg}"),
        }
    }
}

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Worker process launch failure.
    Launch(LaunchError),
    /// Worker process stop failure.
    Stop(StopError),
    /// Debit succeeded without a matching state confirmation, or vice versa.
    BillingInconsistency(String),
    /// Account balance is insufficient for the requested debit.
    InsufficientBalance(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Requested lifecycle transition is not permitted.
    InvalidTransition(String),
    /// Per-account or system-wide quota exceeded.
    QuotaExceeded(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Launch(err) => write!(f, "launch: {err}"),
            Self::Stop(err) => write!(f, "stop: {err}"),
            Self::BillingInconsistency(msg) => write!(f, "billing inconsistency: {msg}"),
            Self::InsufficientBalance(msg) => write!(f, "insufficient balance: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::InvalidTransition(msg) => write!(f, "invalid transition: {msg}"),
            Self::QuotaExceeded(msg) => write!(f, "quota exceeded: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<LaunchError> for AppError {
    fn from(err: LaunchError) -> Self {
        Self::Launch(err)
    }
}

impl From<StopError> for AppError {
    fn from(err: StopError) -> Self {
        Self::Stop(err)
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
