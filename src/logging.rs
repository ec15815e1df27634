use std::{
    path::PathBuf,
    sync::{Mutex, PoisonError},
};

use tracing::{debug, info, metadata::LevelFilter, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

/// Name of the log files, before the date suffix.
pub const LOG_FILE_PREFIX: &str = "serial-bridge.log";

/// Keeps the file writer's background thread alive. Dropping it flushes.
static FILE_GUARD: Mutex<Option<WorkerGuard>> = Mutex::new(None);

/// Where log lines go.
#[derive(Debug, Clone)]
pub struct LogTargets {
    /// Level of stdout. `RUST_LOG` narrows it down further, if set.
    pub stdout: Level,

    /// Level and directory of the daily rotated log files, if any.
    pub file: Option<(Level, PathBuf)>,
}

/// Set up tracing.
///
/// Only the first call has an effect, so tests may call this.
/// File logging is buffered, call [`shutdown`] before exiting to flush it.
pub fn init(targets: LogTargets) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(targets.stdout.to_string().to_lowercase()));

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_filter(LevelFilter::from(targets.stdout))
        .with_filter(env_filter);

    let (file_layer, guard) = match &targets.file {
        Some((level, dir)) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(LevelFilter::from(*level));

            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    if tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .is_err()
    {
        debug!("Logging was already set up");
        return;
    }

    if guard.is_some() {
        *FILE_GUARD.lock().unwrap_or_else(PoisonError::into_inner) = guard;
    }

    info!(?targets, "Logging initialized");
}

/// Flush buffered log lines to file.
///
/// Logging to file stops here. Stdout keeps working.
pub fn shutdown() {
    let guard = FILE_GUARD
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();

    if guard.is_some() {
        debug!("Flushing log file");
    }

    drop(guard);
}
