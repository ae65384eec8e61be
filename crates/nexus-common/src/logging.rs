//! Logging setup for GW-Nexus
//!
//! The agent runs inside a foreign process with no console, so the default
//! agent configuration appends to a per-pid log file in the host's working
//! directory. Console output stays available for harnesses and tools.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Global file logger handle
static FILE_LOGGER: Mutex<Option<File>> = Mutex::new(None);

/// Logging configuration matching the config file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable console (stderr) logging
    #[serde(default = "default_true")]
    pub console_enabled: bool,

    /// Enable file logging
    #[serde(default)]
    pub file_enabled: bool,

    /// Log file path
    #[serde(default)]
    pub file_path: String,

    /// Include timestamps
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include module target
    #[serde(default = "default_true")]
    pub show_target: bool,

    /// Log level as string
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_true() -> bool {
    true
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enabled: true,
            file_enabled: false,
            file_path: String::new(),
            timestamps: true,
            show_target: true,
            level: "info".to_string(),
        }
    }
}

impl LogConfig {
    /// Config with file logging enabled at the given path
    pub fn with_file(mut self, path: &str) -> Self {
        self.file_enabled = true;
        self.file_path = path.to_string();
        self
    }

    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }
}

fn file_writer() -> Box<dyn Write + Send> {
    if let Ok(guard) = FILE_LOGGER.lock() {
        if let Some(ref file) = *guard {
            if let Ok(f) = file.try_clone() {
                return Box::new(f);
            }
        }
    }
    Box::new(std::io::sink())
}

/// Initialize logging with the given configuration.
///
/// Only the first call installs a subscriber; later calls are no-ops.
pub fn init_logging(config: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.file_enabled && !config.file_path.is_empty() {
        if let Ok(file) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.file_path)
        {
            if let Ok(mut guard) = FILE_LOGGER.lock() {
                *guard = Some(file);
            }
        }
    }

    match (config.console_enabled, config.file_enabled) {
        (true, true) => {
            let console_layer = fmt::layer()
                .with_target(config.show_target)
                .with_writer(std::io::stderr);
            let file_layer = fmt::layer()
                .with_ansi(false)
                .with_target(config.show_target)
                .with_writer(file_writer);
            let _ = tracing::subscriber::set_global_default(
                tracing_subscriber::registry()
                    .with(filter)
                    .with(console_layer)
                    .with(file_layer),
            );
        }
        (false, true) => {
            let file_layer = fmt::layer()
                .with_ansi(false)
                .with_target(config.show_target)
                .with_writer(file_writer);
            let _ = tracing::subscriber::set_global_default(
                tracing_subscriber::registry().with(filter).with(file_layer),
            );
        }
        _ => {
            let builder = fmt::Subscriber::builder()
                .with_env_filter(filter)
                .with_target(config.show_target)
                .with_writer(std::io::stderr);
            let _ = if config.timestamps {
                builder.try_init()
            } else {
                builder.without_time().try_init()
            };
        }
    }
}

/// Initialize logging for the injected agent.
///
/// Appends to `gw-nexus-agent-<pid>.log` in the host's working directory;
/// the pid suffix keeps concurrent hosts from clobbering each other.
pub fn init_agent_logging(config: &LogConfig) {
    let mut config = config.clone();
    if config.file_path.is_empty() {
        let mut path = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        path.push(format!("gw-nexus-agent-{}.log", std::process::id()));
        config.file_path = path.to_string_lossy().to_string();
    }
    config.console_enabled = false;
    config.file_enabled = true;
    init_logging(&config);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert!(config.console_enabled);
        assert!(!config.file_enabled);
        assert_eq!(config.level, "info");
    }

    #[test]
    fn test_log_config_with_file() {
        let config = LogConfig::default().with_file("agent.log");
        assert!(config.file_enabled);
        assert_eq!(config.file_path, "agent.log");
    }

    #[test]
    fn test_log_config_roundtrips_through_toml() {
        let config = LogConfig::default().with_level("debug");
        let text = toml::to_string(&config).unwrap();
        let parsed: LogConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.level, "debug");
        assert_eq!(parsed.console_enabled, config.console_enabled);
    }
}
