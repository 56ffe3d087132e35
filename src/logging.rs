use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::audit::AUDIT_TARGET;
use crate::error::DispatchError;

const DEFAULT_MAX_LOG_FILES: usize = 5;
const DEFAULT_FILTER: &str = "info";

pub struct FileLogger {
    log_directory: PathBuf,
    prefix: String,
    max_files: usize,
    rotation: Rotation,
}

impl FileLogger {
    pub fn new(log_directory: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            log_directory: log_directory.into(),
            prefix: prefix.into(),
            max_files: DEFAULT_MAX_LOG_FILES,
            rotation: Rotation::DAILY,
        }
    }

    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }

    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    /// Rolling file appender wrapped in a non-blocking writer.
    /// The guard must be held for as long as logs should be flushed.
    pub fn setup_file_logging(&self) -> Result<(NonBlocking, WorkerGuard), DispatchError> {
        std::fs::create_dir_all(&self.log_directory)?;

        let file_appender = RollingFileAppender::builder()
            .rotation(self.rotation.clone())
            .filename_prefix(&self.prefix)
            .max_log_files(self.max_files)
            .build(&self.log_directory)
            .map_err(|e| {
                DispatchError::ConfigError(format!(
                    "Failed to create log file in {:?}: {}",
                    self.log_directory, e
                ))
            })?;

        Ok(tracing_appender::non_blocking(file_appender))
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the global subscriber.
///
/// Console output always follows `RUST_LOG`. With a log directory, the same
/// output also goes to `slash_deploy.*` files, and audit events are written
/// to their own `audit.*` files regardless of `RUST_LOG`.
pub fn setup_logging(log_dir: Option<&Path>) -> Result<Vec<WorkerGuard>, DispatchError> {
    let mut guards = Vec::new();

    let (file_layer, audit_layer) = match log_dir {
        Some(dir) => {
            let (app_writer, app_guard) = FileLogger::new(dir, "slash_deploy").setup_file_logging()?;
            let (audit_writer, audit_guard) = FileLogger::new(dir, AUDIT_TARGET)
                .with_max_files(30)
                .setup_file_logging()?;
            guards.push(app_guard);
            guards.push(audit_guard);

            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(app_writer)
                .with_ansi(false)
                .with_filter(env_filter());
            let audit_layer = tracing_subscriber::fmt::layer()
                .with_writer(audit_writer)
                .with_ansi(false)
                .with_target(false)
                .with_filter(Targets::new().with_target(AUDIT_TARGET, Level::INFO));
            (Some(file_layer), Some(audit_layer))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter())) // Console output
        .with(file_layer)
        .with(audit_layer)
        .try_init()
        .map_err(|e| DispatchError::ConfigError(format!("Failed to install logger: {}", e)))?;

    Ok(guards)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_log_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("logs/nested");
        let logger = FileLogger::new(&nested, "test").with_rotation(Rotation::NEVER);
        let (_writer, _guard) = logger.setup_file_logging().unwrap();
        assert!(nested.is_dir());
    }
}
