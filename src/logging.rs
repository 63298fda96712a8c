//! Logging setup
//!
//! Wire chatter goes to `trace`, protocol decisions to `debug`, process
//! lifecycle to `info`. The subscriber is configured from the
//! environment with optional CLI overrides; embedding applications that
//! install their own subscriber can skip this module entirely.

use std::env;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level filter (e.g., "debug", "lsp_link=trace")
    pub level: String,
    /// Optional log file path. If None, logs go to stderr
    pub file_path: Option<PathBuf>,
    /// Whether to emit structured JSON lines instead of human-readable text
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            json_format: false,
        }
    }
}

impl LogConfig {
    /// Read configuration from `RUST_LOG`, `LSP_LINK_LOG_FILE` and
    /// `LSP_LINK_LOG_JSON`
    pub fn from_env() -> Self {
        Self {
            level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            file_path: env::var("LSP_LINK_LOG_FILE").ok().map(PathBuf::from),
            json_format: env::var("LSP_LINK_LOG_JSON").unwrap_or_default() == "true",
        }
    }

    /// Override values from CLI arguments
    pub fn with_overrides(mut self, level: Option<String>, file_path: Option<PathBuf>) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if let Some(file_path) = file_path {
            self.file_path = Some(file_path);
        }
        self
    }
}

/// Initialize the global subscriber based on configuration
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_new(&config.level).or_else(|_| EnvFilter::try_new("info"))?;
    let registry = tracing_subscriber::registry().with(env_filter);

    match (&config.file_path, config.json_format) {
        (Some(file_path), true) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;
            registry
                .with(fmt::layer().json().with_writer(file).with_ansi(false))
                .init();
        }
        (Some(file_path), false) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;
            registry
                .with(
                    fmt::layer()
                        .with_writer(file)
                        .with_ansi(false)
                        .with_target(true),
                )
                .init();
        }
        (None, true) => {
            registry
                .with(fmt::layer().json().with_writer(io::stderr).with_ansi(false))
                .init();
        }
        (None, false) => {
            registry
                .with(fmt::layer().with_writer(io::stderr).with_target(true))
                .init();
        }
    }

    Ok(())
}
