use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info,devnet=debug,devnet_core=debug,devnet_deploy=debug";

/// Initializes console logging, plus a daily-rolling file log when
/// `logs_dir` is given. Keep the returned guard alive until exit.
pub fn init_logging(logs_dir: Option<&Path>, filter: &str) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let (file_layer, guard) = match logs_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::daily(dir, "devnet");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(false)
                .with_writer(non_blocking);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .compact(),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_log_directory() {
        let tmp = tempfile::tempdir().expect("Failed to create tempdir");
        let logs_dir = tmp.path().join("nested").join("logs");
        assert!(!logs_dir.exists());

        // Only one global subscriber per process; a second init may fail,
        // but the directory is created before that.
        let result = init_logging(Some(&logs_dir), "warn");
        assert!(logs_dir.exists());
        if let Err(e) = result {
            assert!(e.to_string().contains("logging"), "unexpected error: {e}");
        }
    }

    #[test]
    fn default_filter_parses() {
        let filter = EnvFilter::try_new(DEFAULT_FILTER);
        assert!(filter.is_ok());
    }
}
