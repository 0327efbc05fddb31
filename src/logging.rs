//! tracing setup. Stdout is reserved for per-request output, so logs go to
//! stderr or to a daily file.

use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

const LOG_ENV: &str = "OFFLINE_CACHE_LOG";

/// Install the global subscriber. Keep the guard alive until exit or buffered
/// lines are lost.
pub fn init(config: &LogConfig, data_dir: &Path) -> Result<WorkerGuard> {
  let filter = EnvFilter::try_from_env(LOG_ENV)
    .or_else(|_| EnvFilter::try_new(&config.level))
    .map_err(|e| eyre!("Invalid log filter {}: {}", config.level, e))?;

  let (writer, guard) = if config.file {
    let appender = tracing_appender::rolling::daily(data_dir.join("logs"), "offline-cache.log");
    tracing_appender::non_blocking(appender)
  } else {
    tracing_appender::non_blocking(std::io::stderr())
  };

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(!config.file)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}
