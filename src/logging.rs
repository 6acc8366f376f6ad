/*!
 * Logging and tracing initialization
 */

use std::fs::OpenOptions;
use std::path::Path;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::{Layered, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::LoggingConfig;
use crate::error::{FlowError, Result};

/// Level the configuration asks for; `verbose` wins over `log_level`
pub fn effective_level(config: &LoggingConfig) -> Level {
    if config.verbose {
        Level::DEBUG
    } else {
        config.log_level.to_tracing_level()
    }
}

/// Initialize structured logging based on configuration
///
/// `RUST_LOG` takes precedence over the configured level. Fails with a config
/// error instead of panicking when a global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let log_level = effective_level(config);

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("fileflow={}", log_level)))
        .map_err(|e| FlowError::Config(format!("Failed to create log filter: {}", e)))?;

    match config.log_file {
        Some(ref log_path) => install(env_filter, file_layer(log_path)?),
        None => install(env_filter, stderr_layer()),
    }
}

type FilteredRegistry = Layered<EnvFilter, Registry>;

fn install<L>(env_filter: EnvFilter, layer: L) -> Result<()>
where
    L: Layer<FilteredRegistry> + Send + Sync + 'static,
{
    tracing_subscriber::registry()
        .with(env_filter)
        .with(layer)
        .try_init()
        .map_err(|e| FlowError::Config(format!("Logging already initialized: {}", e)))
}

/// Compact lines on stderr, keeping stdout free for reports
///
/// Stage threads are named `stage-<name>`, so thread names identify the stage.
fn stderr_layer() -> impl Layer<FilteredRegistry> + Send + Sync + 'static {
    fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(true)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::NONE)
        .compact()
}

/// JSON lines appended to `log_path`
///
/// Closing each `stage` span records how long the stage ran. The file is appended
/// to, so consecutive runs share one log.
fn file_layer(log_path: &Path) -> Result<impl Layer<FilteredRegistry> + Send + Sync + 'static> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|e| {
            FlowError::Config(format!("Failed to open log file {:?}: {}", log_path, e))
        })?;

    Ok(fmt::layer()
        .with_writer(file)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(false)
        .json())
}

/// Route logs through the test harness so they show up only for failing tests
#[cfg(test)]
pub fn init_test_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("fileflow=debug"));

        let layer = fmt::layer()
            .with_test_writer()
            .with_target(false)
            .with_thread_names(true)
            .compact();

        // Another test may have installed a subscriber first
        install(env_filter, layer).ok();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_configured_level_is_used() {
        let config = LoggingConfig {
            log_level: LogLevel::Warn,
            log_file: None,
            verbose: false,
        };
        assert_eq!(effective_level(&config), Level::WARN);
    }

    #[test]
    fn test_verbose_overrides_log_level() {
        let config = LoggingConfig {
            log_level: LogLevel::Error,
            log_file: None,
            verbose: true,
        };
        assert_eq!(effective_level(&config), Level::DEBUG);
    }

    #[test]
    fn test_default_level_is_info() {
        assert_eq!(effective_level(&LoggingConfig::default()), Level::INFO);
    }

    #[test]
    fn test_log_file_in_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            log_file: Some(dir.path().join("no/such/dir/flow.log")),
            ..LoggingConfig::default()
        };
        assert!(matches!(init_logging(&config), Err(FlowError::Config(_))));
    }

    #[test]
    fn test_second_init_is_an_error() {
        init_test_logging();
        let result = init_logging(&LoggingConfig::default());
        assert!(matches!(result, Err(FlowError::Config(_))));
    }

    #[test]
    fn test_log_file_is_appended_not_truncated() {
        init_test_logging();
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("flow.log");
        std::fs::write(&log_path, "earlier run\n").unwrap();

        let config = LoggingConfig {
            log_file: Some(log_path.clone()),
            ..LoggingConfig::default()
        };
        // The subscriber slot is taken, but the file has already been opened
        assert!(init_logging(&config).is_err());
        assert!(std::fs::read_to_string(&log_path)
            .unwrap()
            .starts_with("earlier run"));
    }
}
