//! Global supervisor tunables (`~/.config/mcp-fleet/config.toml`).
//!
//! Settings that apply across the whole fleet: worker-pool sizes, retry
//! caps, monitor intervals, and the data directory for persisted state.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_MAX_CONCURRENT_CONNECTIONS: usize = 16;
const DEFAULT_MAX_CONNECTION_RETRIES: u32 = 5;
const DEFAULT_AUTO_DISABLE_THRESHOLD: u32 = 3;
const DEFAULT_MAX_BACKOFF_SECS: u64 = 300;
const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 60;
const DEFAULT_OAUTH_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_TOKEN_RETRY_COOLDOWN_SECS: u64 = 30;
const DEFAULT_DISCONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_STARTUP_DEADLINE_SECS: u64 = 300;
const DEFAULT_TOOL_CACHE_TTL_SECS: u64 = 300;

/// Global settings with serde defaults so a partial (or absent) config file
/// yields a fully usable value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FleetSettings {
    /// Worker-pool size for startup connects and health-monitor reconnects.
    #[serde(default = "default_max_concurrent_connections")]
    pub max_concurrent_connections: usize,
    /// Scheduler retries per upstream beyond the first attempt.
    #[serde(default = "default_max_connection_retries")]
    pub max_connection_retries: u32,
    /// Global consecutive-failure threshold; per-server config overrides.
    #[serde(default = "default_auto_disable_threshold")]
    pub auto_disable_threshold: u32,
    /// Cap for exponential reconnect backoff, seconds.
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    #[serde(default = "default_oauth_poll_interval_secs")]
    pub oauth_poll_interval_secs: u64,
    /// Minimum spacing between token-scan retries for one upstream, seconds.
    #[serde(default = "default_token_retry_cooldown_secs")]
    pub token_retry_cooldown_secs: u64,
    /// Overall budget for `disconnect_all`, seconds.
    #[serde(default = "default_disconnect_timeout_secs")]
    pub disconnect_timeout_secs: u64,
    /// Overall budget for the startup scheduler, seconds.
    #[serde(default = "default_startup_deadline_secs")]
    pub startup_deadline_secs: u64,
    #[serde(default = "default_tool_cache_ttl_secs")]
    pub tool_cache_ttl_secs: u64,
    /// Directory for persisted records, tokens, and the failure log.
    /// Defaults to the platform data dir when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

fn default_max_concurrent_connections() -> usize {
    DEFAULT_MAX_CONCURRENT_CONNECTIONS
}
fn default_max_connection_retries() -> u32 {
    DEFAULT_MAX_CONNECTION_RETRIES
}
fn default_auto_disable_threshold() -> u32 {
    DEFAULT_AUTO_DISABLE_THRESHOLD
}
fn default_max_backoff_secs() -> u64 {
    DEFAULT_MAX_BACKOFF_SECS
}
fn default_health_interval_secs() -> u64 {
    DEFAULT_HEALTH_INTERVAL_SECS
}
fn default_oauth_poll_interval_secs() -> u64 {
    DEFAULT_OAUTH_POLL_INTERVAL_SECS
}
fn default_token_retry_cooldown_secs() -> u64 {
    DEFAULT_TOKEN_RETRY_COOLDOWN_SECS
}
fn default_disconnect_timeout_secs() -> u64 {
    DEFAULT_DISCONNECT_TIMEOUT_SECS
}
fn default_startup_deadline_secs() -> u64 {
    DEFAULT_STARTUP_DEADLINE_SECS
}
fn default_tool_cache_ttl_secs() -> u64 {
    DEFAULT_TOOL_CACHE_TTL_SECS
}

impl Default for FleetSettings {
    fn default() -> Self {
        toml::from_str("").expect("empty settings must deserialize via defaults")
    }
}

impl FleetSettings {
    /// Load from `~/.config/mcp-fleet/config.toml`, returning defaults when
    /// the file (or the config directory) does not exist.
    pub fn load() -> Result<Self> {
        let path = match Self::config_path() {
            Ok(p) => p,
            Err(_) => return Ok(Self::default()),
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read settings: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse settings: {}", path.display()))
    }

    pub fn config_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "mcp-fleet")
            .context("Failed to determine config directory")?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Default path of the fleet registry file, next to the settings.
    pub fn registry_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "mcp-fleet")
            .context("Failed to determine config directory")?;
        Ok(dirs.config_dir().join("servers.toml"))
    }

    /// Resolved data directory: explicit setting, else the platform data
    /// dir, else a temp-dir fallback for environments without a home.
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        directories::ProjectDirs::from("", "", "mcp-fleet")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| std::env::temp_dir().join("mcp-fleet"))
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn oauth_poll_interval(&self) -> Duration {
        Duration::from_secs(self.oauth_poll_interval_secs)
    }

    pub fn token_retry_cooldown(&self) -> Duration {
        Duration::from_secs(self.token_retry_cooldown_secs)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.disconnect_timeout_secs)
    }

    pub fn startup_deadline(&self) -> Duration {
        Duration::from_secs(self.startup_deadline_secs)
    }

    pub fn tool_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.tool_cache_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = FleetSettings::default();
        assert_eq!(settings.max_concurrent_connections, 16);
        assert_eq!(settings.max_connection_retries, 5);
        assert_eq!(settings.auto_disable_threshold, 3);
        assert_eq!(settings.health_interval(), Duration::from_secs(60));
        assert_eq!(settings.oauth_poll_interval(), Duration::from_secs(5));
        assert_eq!(settings.token_retry_cooldown(), Duration::from_secs(30));
        assert_eq!(settings.disconnect_timeout(), Duration::from_secs(10));
        assert_eq!(settings.startup_deadline(), Duration::from_secs(300));
        assert_eq!(settings.tool_cache_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let settings: FleetSettings = toml::from_str(
            r#"
max_concurrent_connections = 4
max_backoff_secs = 60
"#,
        )
        .unwrap();
        assert_eq!(settings.max_concurrent_connections, 4);
        assert_eq!(settings.max_backoff(), Duration::from_secs(60));
        assert_eq!(settings.max_connection_retries, 5);
    }

    #[test]
    fn explicit_data_dir_wins() {
        let settings: FleetSettings = toml::from_str(
            r#"
data_dir = "/var/lib/fleet"
"#,
        )
        .unwrap();
        assert_eq!(settings.data_dir(), PathBuf::from("/var/lib/fleet"));
    }

    #[test]
    fn resolved_data_dir_is_never_empty() {
        let settings = FleetSettings::default();
        assert!(!settings.data_dir().as_os_str().is_empty());
    }
}
