//! Logging subsystem
//!
//! Structured logging via tracing with JSON (production) and plaintext
//! (development) output formats.
//!
//! # Log Targets
//!
//! Use these consistent target names across the codebase:
//! - `gateway` - main gateway operations
//! - `ws` - WebSocket hub
//! - `exec` - exec engine
//! - `nodes` - node registry and invoke routing
//! - `approvals` - exec approval flow
//! - `sessions` - session store and orchestration
//!
//! # Environment Variables
//!
//! - `CLAWDBOT_LOG` - Primary log level/filter (takes precedence)
//! - `RUST_LOG` - Fallback log level/filter

use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use tracing::Level;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Guard to track if logging has been initialized
static INIT_GUARD: OnceLock<()> = OnceLock::new();

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON format for production (structured logs)
    Json,
    /// Human-readable plaintext for development
    #[default]
    Plaintext,
}

/// Log output destination
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogOutput {
    /// Write to stdout
    #[default]
    Stdout,
    /// Write to stderr
    Stderr,
    /// Write to a file at the given path
    File(PathBuf),
}

/// Configuration for the logging subsystem
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Output format (JSON or plaintext)
    pub format: LogFormat,
    /// Output destination (stdout, stderr, or file)
    pub output: LogOutput,
    /// Default log level when no env filter is set
    pub default_level: Level,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stdout,
            default_level: Level::INFO,
        }
    }
}

impl LogConfig {
    /// Create a development configuration (plaintext to stdout, debug level)
    pub fn development() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stdout,
            default_level: Level::DEBUG,
        }
    }

    /// Create a production configuration (JSON to stdout, info level)
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            output: LogOutput::Stdout,
            default_level: Level::INFO,
        }
    }
}

/// Error type for logging initialization
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to create log file: {0}")]
    FileCreation(#[from] io::Error),
    #[error("failed to parse log filter: {0}")]
    FilterParse(#[from] tracing_subscriber::filter::ParseError),
    #[error("logging already initialized")]
    AlreadyInitialized,
    #[error("failed to initialize subscriber: {0}")]
    TryInit(#[from] tracing_subscriber::util::TryInitError),
}

/// Build an EnvFilter from environment variables or default level.
///
/// Checks CLAWDBOT_LOG first, then RUST_LOG, falling back to the default level.
fn build_env_filter(default_level: Level) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = std::env::var("CLAWDBOT_LOG") {
        return Ok(EnvFilter::try_new(filter)?);
    }
    if let Ok(filter) = std::env::var("RUST_LOG") {
        return Ok(EnvFilter::try_new(filter)?);
    }

    let default_filter = format!(
        "{level},gateway={level},ws={level},exec={level},nodes={level},approvals={level},sessions={level}",
        level = default_level.as_str().to_lowercase()
    );
    Ok(EnvFilter::try_new(default_filter)?)
}

fn make_writer(output: &LogOutput) -> Result<BoxMakeWriter, LoggingError> {
    Ok(match output {
        LogOutput::Stdout => BoxMakeWriter::new(io::stdout),
        LogOutput::Stderr => BoxMakeWriter::new(io::stderr),
        LogOutput::File(path) => BoxMakeWriter::new(Arc::new(File::create(path)?)),
    })
}

/// Initialize the logging subsystem with the given configuration.
///
/// This function should be called once at application startup. Subsequent
/// calls return an error.
pub fn init_logging(config: LogConfig) -> Result<(), LoggingError> {
    if INIT_GUARD.set(()).is_err() {
        return Err(LoggingError::AlreadyInitialized);
    }

    let filter = build_env_filter(config.default_level)?;
    let timer = UtcTime::rfc_3339();
    let writer = make_writer(&config.output)?;

    match config.format {
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_timer(timer)
                .with_target(true)
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(writer)
                .with_filter(filter);
            tracing_subscriber::registry().with(layer).try_init()?;
        }
        LogFormat::Plaintext => {
            let layer = tracing_subscriber::fmt::layer()
                .with_timer(timer)
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false)
                .with_writer(writer)
                .with_filter(filter);
            tracing_subscriber::registry().with(layer).try_init()?;
        }
    }

    Ok(())
}

/// Initialize logging for tests.
///
/// Silently ignores errors if logging is already initialized, making it safe
/// to call from multiple tests.
pub fn init_test_logging() {
    let _ = INIT_GUARD.set(());
    let Ok(filter) = build_env_filter(Level::DEBUG) else {
        return;
    };
    let layer = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_filter(filter);
    let _ = tracing_subscriber::registry().with(layer).try_init();
}

/// Log target constants for consistent naming across the codebase
pub mod targets {
    /// Main gateway operations
    pub const GATEWAY: &str = "gateway";
    /// WebSocket hub
    pub const WS: &str = "ws";
    /// Exec engine
    pub const EXEC: &str = "exec";
    /// Node registry and invoke routing
    pub const NODES: &str = "nodes";
    /// Exec approval flow
    pub const APPROVALS: &str = "approvals";
    /// Session store and orchestration
    pub const SESSIONS: &str = "sessions";
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that modify global state (env vars).
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_log_config_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.format, LogFormat::Plaintext);
        assert_eq!(config.output, LogOutput::Stdout);
        assert_eq!(config.default_level, Level::INFO);
    }

    #[test]
    fn test_log_config_development() {
        let config = LogConfig::development();
        assert_eq!(config.format, LogFormat::Plaintext);
        assert_eq!(config.default_level, Level::DEBUG);
    }

    #[test]
    fn test_log_config_production() {
        let config = LogConfig::production();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.default_level, Level::INFO);
    }

    #[test]
    fn test_env_filter_default() {
        let _lock = TEST_LOCK.lock().unwrap();
        std::env::remove_var("CLAWDBOT_LOG");
        std::env::remove_var("RUST_LOG");
        assert!(build_env_filter(Level::INFO).is_ok());
    }

    #[test]
    fn test_env_filter_clawdbot_log_precedence() {
        let _lock = TEST_LOCK.lock().unwrap();
        std::env::set_var("CLAWDBOT_LOG", "error");
        std::env::set_var("RUST_LOG", "debug");
        assert!(build_env_filter(Level::INFO).is_ok());
        std::env::remove_var("CLAWDBOT_LOG");
        std::env::remove_var("RUST_LOG");
    }

    #[test]
    fn test_env_filter_complex_directive() {
        let _lock = TEST_LOCK.lock().unwrap();
        std::env::set_var("CLAWDBOT_LOG", "gateway=debug,ws=info,exec=warn");
        assert!(build_env_filter(Level::INFO).is_ok());
        std::env::remove_var("CLAWDBOT_LOG");
    }

    #[test]
    fn test_targets_constants() {
        assert_eq!(targets::GATEWAY, "gateway");
        assert_eq!(targets::WS, "ws");
        assert_eq!(targets::EXEC, "exec");
        assert_eq!(targets::NODES, "nodes");
        assert_eq!(targets::APPROVALS, "approvals");
        assert_eq!(targets::SESSIONS, "sessions");
    }
}
