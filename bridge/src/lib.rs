// Astrocam process shell
//
// Logging, settings storage and simulated hardware around the
// session engine. The `astrocam` binary wires them together.

mod error;
pub mod settings;
pub mod sim_devices;

pub use error::*;
pub use settings::SettingsStorage;

use std::panic;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Prefix of the daily log files
pub const LOG_FILE_NAME: &str = "astrocam.log";

/// Global log file guard (keeps file writer alive)
static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Log panics before the default hook runs
fn init_panic_handler() {
    panic::set_hook(Box::new(|panic_info| {
        let msg = panic_info.to_string();
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());

        eprintln!("PANIC at {}: {}", location, msg);
        tracing::error!("PANIC at {}: {}", location, msg);
    }));
}

/// Initialize logging. Call once at start-up.
///
/// With a directory, logs go to the console and to a daily rolling file
/// in that directory; files older than a week are removed. Without one,
/// logging is console-only.
pub fn init_logging(log_directory: Option<PathBuf>) -> Result<(), BridgeError> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    init_panic_handler();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    if let Some(log_path) = log_directory {
        if let Err(e) = std::fs::create_dir_all(&log_path) {
            eprintln!("Failed to create log directory: {}", e);
            return init_logging(None);
        }

        let file_appender = tracing_appender::rolling::daily(&log_path, LOG_FILE_NAME);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        LOG_GUARD.set(guard).ok();

        let console_layer = fmt::layer().with_target(false).with_ansi(true);

        let file_layer = fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .try_init()
            .map_err(|e| BridgeError::Internal(format!("Logging already initialized: {}", e)))?;

        tracing::info!("Astrocam initialized with file logging");
        tracing::info!("Log directory: {}", log_path.display());

        cleanup_old_logs(&log_path, 7);
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_target(false)
            .try_init()
            .map_err(|e| BridgeError::Internal(format!("Logging already initialized: {}", e)))?;

        tracing::info!("Astrocam initialized (console logging only)");
    }

    Ok(())
}

/// Clean up old log files, keeping only the most recent N days
pub fn cleanup_old_logs(log_dir: &Path, keep_days: i64) -> usize {
    use chrono::TimeZone;

    let cutoff = chrono::Local::now() - chrono::Duration::days(keep_days);
    let prefix = format!("{}.", LOG_FILE_NAME);

    let entries = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("Cannot read log directory for cleanup: {}", e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        // "astrocam.log.2024-01-15"
        let Some(date_str) = name.strip_prefix(&prefix) else {
            continue;
        };

        let Ok(file_date) = chrono::NaiveDate::parse_from_str(date_str, "%Y-%m-%d") else {
            continue;
        };
        let Some(file_datetime) = file_date.and_hms_opt(0, 0, 0) else {
            continue;
        };
        let Some(file_local) = chrono::Local.from_local_datetime(&file_datetime).single() else {
            continue;
        };

        if file_local < cutoff {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!("Failed to delete old log file {:?}: {}", path, e);
            } else {
                tracing::debug!("Deleted old log file: {:?}", path);
                removed += 1;
            }
        }
    }
    removed
}

/// Get the version of the shell
pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
