//! Per-instance working directory layout and preparation.

use std::fs;
use std::path::PathBuf;

use crate::config::GlobalConfig;
use crate::{AppError, Result};

/// File-system locations belonging to one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstancePaths {
    /// Working directory the worker runs in.
    pub dir: PathBuf,
    /// Local data file owned by the worker.
    pub data_file: PathBuf,
    /// Heartbeat file the worker touches to prove responsiveness.
    pub heartbeat_file: PathBuf,
}

/// Resolve the instance's paths without touching the file system.
#[must_use]
pub fn paths(config: &GlobalConfig, instance_id: &str) -> InstancePaths {
    let dir = config.instance_dir(instance_id);
    InstancePaths {
        data_file: dir.join("data.json"),
        heartbeat_file: dir.join("heartbeat"),
        dir,
    }
}

/// Create the working directory and data file when missing.
///
/// An existing data file is preserved: a restart reuses the worker's
/// accumulated local state rather than reprovisioning it.
///
/// # Errors
///
/// Returns `AppError::Io` if directory or file creation fails.
pub fn prepare(config: &GlobalConfig, instance_id: &str) -> Result<InstancePaths> {
    let paths = paths(config, instance_id);

    fs::create_dir_all(&paths.dir).map_err(|err| {
        AppError::Io(format!(
            "failed to create instance dir {}: {err}",
            paths.dir.display()
        ))
    })?;

    if !paths.data_file.exists() {
        fs::write(&paths.data_file, b"{}").map_err(|err| {
            AppError::Io(format!(
                "failed to seed data file {}: {err}",
                paths.data_file.display()
            ))
        })?;
    }

    Ok(paths)
}

/// Remove the instance's data file and working directory.
///
/// Each removal is independently idempotent: a missing path is a no-op,
/// so an interrupted cleanup can be re-run safely.
///
/// # Errors
///
/// Returns `AppError::Io` for any failure other than the path already
/// being absent.
pub fn remove(config: &GlobalConfig, instance_id: &str) -> Result<()> {
    let paths = paths(config, instance_id);

    match fs::remove_file(&paths.data_file) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(AppError::Io(format!(
                "failed to remove data file {}: {err}",
                paths.data_file.display()
            )))
        }
    }

    match fs::remove_dir_all(&paths.dir) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(AppError::Io(format!(
                "failed to remove instance dir {}: {err}",
                paths.dir.display()
            )))
        }
    }

    Ok(())
}
