//! Tracing subscriber setup

use std::path::Path;
use tracing_subscriber::prelude::*;

/// Log file name inside the log directory
pub const LOG_FILE_NAME: &str = "scanfill-debug.log";

/// Format timestamps using the system's local time via chrono
struct LocalTimer;

impl tracing_subscriber::fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// Install the global subscriber: console (stderr) plus an append-mode file
/// in `log_dir`. Falls back to console only when the file cannot be opened.
/// A second call is a no-op.
pub fn init_logging(log_dir: &Path) {
    let _ = std::fs::create_dir_all(log_dir);
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(LOG_FILE_NAME))
        .ok();

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_timer(LocalTimer);

    let result = match log_file {
        Some(file) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(std::sync::Mutex::new(file))
                .with_timer(LocalTimer)
                .with_ansi(false);
            tracing_subscriber::registry()
                .with(env_filter())
                .with(console_layer)
                .with(file_layer)
                .try_init()
        }
        None => tracing_subscriber::registry()
            .with(env_filter())
            .with(console_layer)
            .try_init(),
    };

    if result.is_ok() {
        tracing::debug!("Logging to {}", log_dir.join(LOG_FILE_NAME).display());
    }
}
