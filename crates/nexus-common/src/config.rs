//! Agent configuration
//!
//! Loaded from `gw-nexus.toml` in the host's working directory when present.
//! Everything has a default so the agent runs with no file at all.

use crate::logging::LogConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const CONFIG_FILE_NAME: &str = "gw-nexus.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Endpoint-name override. When unset the pipe name is derived from the
    /// host identifier (or the process id as a fallback).
    #[serde(default)]
    pub pipe_name: Option<String>,

    /// Deadline for calls queued to the host thread.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_call_timeout_ms() -> u64 {
    5_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            pipe_name: None,
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Internal(format!("Failed to read config file: {}", e)))?;
        toml::from_str(&content)
            .map_err(|e| Error::Internal(format!("Failed to parse config file: {}", e)))
    }

    /// Load `gw-nexus.toml` from the working directory, or defaults.
    pub fn load_or_default() -> Self {
        let path = std::env::current_dir()
            .map(|d| d.join(CONFIG_FILE_NAME))
            .unwrap_or_else(|_| CONFIG_FILE_NAME.into());
        if path.is_file() {
            match Self::load(&path) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!(target: "nexus_common::config", error = %e, "Ignoring bad config file");
                }
            }
        }
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert!(config.server.pipe_name.is_none());
        assert_eq!(config.server.call_timeout_ms, 5_000);
    }

    #[test]
    fn test_parse_partial_file() {
        let config: AgentConfig = toml::from_str(
            r#"
            [server]
            pipe_name = "\\\\.\\pipe\\GwNexus_test"

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.server.pipe_name.as_deref(),
            Some("\\\\.\\pipe\\GwNexus_test")
        );
        assert_eq!(config.server.call_timeout_ms, 5_000);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_empty_file_is_defaults() {
        let config: AgentConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.call_timeout_ms, 5_000);
    }
}
