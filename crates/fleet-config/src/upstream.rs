use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default per-server connect timeout when the entry does not override it.
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 30;

/// Upstream transport configuration.
///
/// Serialized with `#[serde(tag = "type")]` so TOML uses `type = "stdio"`,
/// `type = "docker-stdio"`, `type = "streamable-http"`, or `type = "sse"`.
/// `type = "http"` is accepted on input as an alias of `streamable-http`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum UpstreamTransport {
    /// Spawn a child process speaking MCP over stdin/stdout.
    #[serde(rename = "stdio")]
    Stdio {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        working_dir: Option<PathBuf>,
    },
    /// Spawn `docker run --rm -i <image>` and speak MCP over the attached
    /// stdio; the container lifecycle is owned by the transport.
    #[serde(rename = "docker-stdio")]
    DockerStdio {
        image: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
    },
    /// Remote MCP server via Streamable HTTP.
    #[serde(rename = "streamable-http")]
    StreamableHttp {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        /// Allow insecure `http://` connections (default: false).
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        allow_insecure: bool,
    },
    /// Remote MCP server advertised as legacy SSE.
    #[serde(rename = "sse")]
    Sse {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        allow_insecure: bool,
    },
}

impl UpstreamTransport {
    /// Short human-readable label for the transport type.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::DockerStdio { .. } => "docker-stdio",
            Self::StreamableHttp { .. } => "streamable-http",
            Self::Sse { .. } => "sse",
        }
    }

    /// URL for remote transports, `None` for process-backed ones.
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::StreamableHttp { url, .. } | Self::Sse { url, .. } => Some(url),
            _ => None,
        }
    }
}

/// How the supervisor treats an upstream at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupMode {
    /// Connect eagerly during `connect_all`.
    #[default]
    Active,
    /// Keep known upstreams asleep until a tool call wakes them.
    LazyLoading,
    /// Operator-disabled; never connected automatically.
    Disabled,
    /// Quarantined by policy; never connected automatically.
    Quarantined,
    /// Latched off after chronic failures; requires operator action.
    AutoDisabled,
}

impl StartupMode {
    /// Whether any automatic connect path may touch this upstream.
    pub fn is_startable(self) -> bool {
        matches!(self, Self::Active | Self::LazyLoading)
    }
}

impl std::fmt::Display for StartupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Active => "active",
            Self::LazyLoading => "lazy_loading",
            Self::Disabled => "disabled",
            Self::Quarantined => "quarantined",
            Self::AutoDisabled => "auto_disabled",
        };
        f.write_str(label)
    }
}

/// OAuth parameters for upstreams that require an authorization round-trip.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_port: Option<u16>,
}

/// One upstream entry in the fleet registry.
///
/// # TOML formats
///
/// **Tagged (canonical):**
/// ```toml
/// [[servers]]
/// name = "git"
/// type = "stdio"
/// command = "uvx"
/// args = ["mcp-server-git"]
///
/// [[servers]]
/// name = "deepwiki"
/// type = "streamable-http"
/// url = "https://mcp.deepwiki.com/mcp"
/// ```
///
/// **Legacy (auto-detected as stdio when `command` is present):**
/// ```toml
/// [[servers]]
/// name = "git"
/// command = "uvx"
/// args = ["mcp-server-git"]
/// ```
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UpstreamConfig {
    pub name: String,
    #[serde(flatten)]
    pub transport: UpstreamTransport,
    #[serde(default, skip_serializing_if = "is_default_mode")]
    pub startup_mode: StartupMode,
    /// Run the periodic health loop for this upstream (default: true).
    #[serde(default = "default_true")]
    pub health_check: bool,
    /// Per-server connect timeout override, seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_timeout_secs: Option<u64>,
    /// Consecutive-failure count that latches auto-disable; 0 means use the
    /// global default.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub auto_disable_threshold: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthConfig>,
    // Connection history, mirrored from the store so lazy-loading decisions
    // survive restarts.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ever_connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_connection: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub tool_count: u64,
}

fn default_true() -> bool {
    true
}

fn is_default_mode(mode: &StartupMode) -> bool {
    *mode == StartupMode::Active
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

impl UpstreamConfig {
    /// Minimal entry with defaults for everything but name and transport.
    pub fn new(name: &str, transport: UpstreamTransport) -> Self {
        Self {
            name: name.to_string(),
            transport,
            startup_mode: StartupMode::default(),
            health_check: true,
            connection_timeout_secs: None,
            auto_disable_threshold: 0,
            oauth: None,
            ever_connected: false,
            last_successful_connection: None,
            tool_count: 0,
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(
            self.connection_timeout_secs
                .unwrap_or(DEFAULT_CONNECTION_TIMEOUT_SECS),
        )
    }

    /// True when both entries describe the same endpoint and startup intent.
    ///
    /// Used to decide whether a re-added config can keep the live client.
    /// History fields and timeouts are deliberately excluded: they change
    /// without invalidating an open connection.
    pub fn same_endpoint(&self, other: &Self) -> bool {
        self.name == other.name
            && self.transport == other.transport
            && self.startup_mode == other.startup_mode
            && self.oauth == other.oauth
    }

    pub fn is_stdio(&self) -> bool {
        matches!(&self.transport, UpstreamTransport::Stdio { .. })
    }

    pub fn is_docker(&self) -> bool {
        matches!(&self.transport, UpstreamTransport::DockerStdio { .. })
    }

    pub fn is_remote(&self) -> bool {
        matches!(
            &self.transport,
            UpstreamTransport::StreamableHttp { .. } | UpstreamTransport::Sse { .. }
        )
    }
}

/// Custom deserializer for backward-compatible config parsing.
///
/// Handles:
/// 1. Explicit `type` field, including the `http` alias for
///    `streamable-http`.
/// 2. No `type` field + `command` present: auto-detected as stdio.
/// 3. Anything else: error with a pointer to the accepted forms.
impl<'de> Deserialize<'de> for UpstreamConfig {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            name: String,
            #[serde(rename = "type")]
            transport_type: Option<String>,
            // stdio / docker fields
            command: Option<String>,
            image: Option<String>,
            #[serde(default)]
            args: Vec<String>,
            #[serde(default)]
            env: HashMap<String, String>,
            working_dir: Option<PathBuf>,
            // remote fields
            url: Option<String>,
            #[serde(default)]
            headers: HashMap<String, String>,
            #[serde(default)]
            allow_insecure: bool,
            // common
            #[serde(default)]
            startup_mode: StartupMode,
            health_check: Option<bool>,
            connection_timeout_secs: Option<u64>,
            #[serde(default)]
            auto_disable_threshold: u32,
            oauth: Option<OAuthConfig>,
            #[serde(default)]
            ever_connected: bool,
            last_successful_connection: Option<DateTime<Utc>>,
            #[serde(default)]
            tool_count: u64,
        }

        let raw = Raw::deserialize(deserializer)?;

        let require_url = |url: Option<String>, tag: &str| {
            url.ok_or_else(|| {
                serde::de::Error::custom(format!(
                    "server '{}': type = \"{tag}\" requires 'url' field",
                    raw.name
                ))
            })
        };

        let transport = match raw.transport_type.as_deref() {
            Some("stdio") => {
                let command = raw.command.clone().ok_or_else(|| {
                    serde::de::Error::custom(format!(
                        "server '{}': type = \"stdio\" requires 'command' field",
                        raw.name
                    ))
                })?;
                UpstreamTransport::Stdio {
                    command,
                    args: raw.args,
                    env: raw.env,
                    working_dir: raw.working_dir,
                }
            }
            Some("docker-stdio") => {
                let image = raw.image.clone().ok_or_else(|| {
                    serde::de::Error::custom(format!(
                        "server '{}': type = \"docker-stdio\" requires 'image' field",
                        raw.name
                    ))
                })?;
                UpstreamTransport::DockerStdio {
                    image,
                    args: raw.args,
                    env: raw.env,
                }
            }
            Some("http") | Some("streamable-http") => UpstreamTransport::StreamableHttp {
                url: require_url(raw.url.clone(), "streamable-http")?,
                headers: raw.headers,
                allow_insecure: raw.allow_insecure,
            },
            Some("sse") => UpstreamTransport::Sse {
                url: require_url(raw.url.clone(), "sse")?,
                headers: raw.headers,
                allow_insecure: raw.allow_insecure,
            },
            Some(other) => {
                return Err(serde::de::Error::custom(format!(
                    "server '{}': unknown transport type '{}' (expected: stdio, docker-stdio, streamable-http, sse)",
                    raw.name, other
                )));
            }
            None => {
                if let Some(command) = raw.command.clone() {
                    UpstreamTransport::Stdio {
                        command,
                        args: raw.args,
                        env: raw.env,
                        working_dir: raw.working_dir,
                    }
                } else {
                    return Err(serde::de::Error::custom(format!(
                        "server '{}': missing 'type' field; add type = \"stdio\" (with 'command'), \
                         type = \"docker-stdio\" (with 'image'), or type = \"streamable-http\" (with 'url')",
                        raw.name
                    )));
                }
            }
        };

        Ok(UpstreamConfig {
            name: raw.name,
            transport,
            startup_mode: raw.startup_mode,
            health_check: raw.health_check.unwrap_or(true),
            connection_timeout_secs: raw.connection_timeout_secs,
            auto_disable_threshold: raw.auto_disable_threshold,
            oauth: raw.oauth,
            ever_connected: raw.ever_connected,
            last_successful_connection: raw.last_successful_connection,
            tool_count: raw.tool_count,
        })
    }
}

/// The fleet registry file: the full list of configured upstreams.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FleetRegistry {
    #[serde(default)]
    pub servers: Vec<UpstreamConfig>,
}

impl FleetRegistry {
    /// Load from an explicit path.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fleet registry: {}", path.display()))?;
        toml::from_str::<Self>(&raw)
            .with_context(|| format!("Failed to parse fleet registry: {}", path.display()))
    }

    /// Write the registry atomically (temp file + rename).
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let rendered =
            toml::to_string_pretty(self).context("Failed to serialize fleet registry")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create registry directory: {}", parent.display())
            })?;
        }
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, rendered)
            .with_context(|| format!("Failed to write fleet registry: {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace fleet registry: {}", path.display()))?;
        Ok(())
    }

    /// Update one entry's startup mode and save; inserts nothing when the
    /// name is unknown. Used by the auto-disable persistence hook.
    pub fn set_startup_mode(&mut self, name: &str, mode: StartupMode) -> bool {
        for server in &mut self.servers {
            if server.name == name {
                server.startup_mode = mode;
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
#[path = "upstream_tests.rs"]
mod tests;
