//! Tracing subscriber setup for the command line tool.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
  fmt,
  layer::{Layer, SubscriberExt},
  util::SubscriberInitExt,
  EnvFilter,
};

use crate::config::LogConfig;

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
///
/// Keep the returned guard alive until exit so buffered file output is
/// flushed.
pub fn init(log: &LogConfig) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&log.level))
    .map_err(|e| eyre!("Invalid log level {:?}: {}", log.level, e))?;

  let stderr_layer = fmt::layer().compact().with_writer(std::io::stderr);

  let (file_layer, guard) = match &log.file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
      let name = path
        .file_name()
        .ok_or_else(|| eyre!("Log file path has no file name: {}", path.display()))?;
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

      let appender = tracing_appender::rolling::never(dir, name);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer().with_ansi(false).with_writer(writer).boxed();
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(stderr_layer)
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}
