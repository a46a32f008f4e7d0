use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_FILE_BASENAME: &str = "printlapse.log";
const LOG_DIR_ENV: &str = "PRINTLAPSE_LOG_PATH";
const KEEP_LOGS_FOR: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[cfg(target_os = "macos")]
const OSLOG_SUBSYSTEM: &str = "dev.printlapse.rig";

/// Where rolled log files are written
pub fn get_log_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(LOG_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }

    let dirs = ProjectDirs::from("dev", "printlapse", "rig")
        .context("Failed to determine project directories for log path")?;
    Ok(dirs
        .state_dir()
        .unwrap_or_else(|| dirs.data_local_dir())
        .join("logs"))
}

/// Install the global subscriber: stderr plus a daily rolling file.
///
/// The returned guard must be held for the lifetime of the process,
/// dropping it flushes and stops the file writer.
pub fn init_logging() -> Result<WorkerGuard> {
    let log_dir = get_log_dir()?;
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {:?}", log_dir))?;
    remove_stale_logs(&log_dir, KEEP_LOGS_FOR);

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, LOG_FILE_BASENAME));

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .with(platform_layer())
        .init();

    Ok(guard)
}

/// Unified logging on macOS, visible in Console.app
#[cfg(target_os = "macos")]
fn platform_layer<S>() -> Option<Box<dyn Layer<S> + Send + Sync>>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    Some(tracing_oslog::OsLogger::new(OSLOG_SUBSYSTEM, "default").boxed())
}

#[cfg(not(target_os = "macos"))]
fn platform_layer<S>() -> Option<Box<dyn Layer<S> + Send + Sync>>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    None
}

/// Delete our own rolled files last modified before `max_age` ago
fn remove_stale_logs(log_dir: &Path, max_age: Duration) {
    let (Ok(entries), Some(cutoff)) = (
        std::fs::read_dir(log_dir),
        SystemTime::now().checked_sub(max_age),
    ) else {
        return;
    };

    let stale = entries.flatten().filter(|entry| {
        let ours = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(LOG_FILE_BASENAME));
        let modified = entry
            .metadata()
            .ok()
            .filter(|m| m.is_file())
            .and_then(|m| m.modified().ok());
        ours && modified.is_some_and(|at| at < cutoff)
    });

    for entry in stale {
        let _ = std::fs::remove_file(entry.path());
    }
}
