use anyhow::Result;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

const DEFAULT_LOG_FILE: &str = "hookscope.log";

static INIT_GUARD: OnceLock<()> = OnceLock::new();

/// Initialize tracing once: file output when a log file can be created,
/// stdout otherwise, filtered through RUST_LOG.
pub fn initialize_logging(log_file_path: Option<&str>) -> Result<()> {
    if INIT_GUARD.set(()).is_err() {
        // Already initialized elsewhere; do nothing and succeed.
        return Ok(());
    }

    let log_path = match log_file_path {
        Some(path) => PathBuf::from(path),
        None => std::env::current_dir()?.join(DEFAULT_LOG_FILE),
    };

    let maybe_log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path);

    match maybe_log_file {
        Ok(log_file) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(log_file)
                .with_target(true)
                .with_ansi(false)
                .with_filter(tracing_subscriber::filter::EnvFilter::from_default_env());
            let _ = tracing_subscriber::registry().with(file_layer).try_init();
        }
        Err(_) => {
            let _ = tracing_subscriber::fmt()
                .with_target(true)
                .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
                .try_init();
        }
    }

    Ok(())
}
