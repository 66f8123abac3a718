//! Connection/server state enums, tool descriptors, and qualified tool names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::ErrorKind;

/// Separator between the upstream name and the tool name in a qualified
/// tool name (`server:tool`).
pub const TOOL_NAME_SEPARATOR: char = ':';

/// How many recent errors a connection snapshot retains for diagnostics.
pub const RECENT_ERROR_CAPACITY: usize = 8;

/// Runtime connection state of one upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Discovering,
    Ready,
    /// Known upstream kept offline until a tool call wakes it.
    Sleeping,
    Error,
}

impl ConnectionState {
    /// True while a connect attempt is in progress in any of its stages.
    pub fn is_connecting(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Authenticating | Self::Discovering
        )
    }

    pub fn is_ready(self) -> bool {
        self == Self::Ready
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Discovering => "discovering",
            Self::Ready => "ready",
            Self::Sleeping => "sleeping",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

/// Persisted administrative state of one upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    #[default]
    Active,
    Disabled,
    Quarantined,
    AutoDisabled,
}

impl ServerState {
    /// Whether the supervisor may open connections for this upstream.
    pub fn allows_connect(self) -> bool {
        self == Self::Active
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Active => "active",
            Self::Disabled => "disabled",
            Self::Quarantined => "quarantined",
            Self::AutoDisabled => "auto_disabled",
        };
        f.write_str(label)
    }
}

/// One tool advertised by one upstream.
///
/// The fingerprint is a stable SHA-256 over name, description, and the
/// canonical JSON of the parameter schema, used to detect drift between
/// discoveries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub server: String,
    pub name: String,
    pub description: String,
    pub params_schema: Value,
    pub fingerprint: String,
}

impl ToolDescriptor {
    pub fn new(server: &str, name: &str, description: &str, params_schema: Value) -> Self {
        let fingerprint = fingerprint_tool(name, description, &params_schema);
        Self {
            server: server.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            params_schema,
            fingerprint,
        }
    }

    /// Name under which this tool is exposed by the aggregate endpoint.
    pub fn qualified_name(&self) -> String {
        qualify_tool_name(&self.server, &self.name)
    }
}

fn fingerprint_tool(name: &str, description: &str, schema: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(description.as_bytes());
    hasher.update([0u8]);
    hasher.update(serde_json::to_vec(schema).unwrap_or_default());
    format!("{:x}", hasher.finalize())
}

/// Digest over a whole tool list (names + descriptions + schemas), used as
/// the tool-cache key.
pub fn tool_list_digest(tools: &[ToolDescriptor]) -> String {
    let mut hasher = Sha256::new();
    for tool in tools {
        hasher.update(tool.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(tool.description.as_bytes());
        hasher.update([0u8]);
        hasher.update(serde_json::to_vec(&tool.params_schema).unwrap_or_default());
        hasher.update([0xff]);
    }
    format!("{:x}", hasher.finalize())
}

/// Compose `server:tool`.
pub fn qualify_tool_name(server: &str, tool: &str) -> String {
    format!("{server}{TOOL_NAME_SEPARATOR}{tool}")
}

/// Split a qualified tool name on the FIRST separator, tolerating separators
/// inside the tool part. Returns `None` when either side is empty or the
/// separator is absent.
pub fn split_tool_name(qualified: &str) -> Option<(&str, &str)> {
    let idx = qualified.find(TOOL_NAME_SEPARATOR)?;
    let (server, rest) = qualified.split_at(idx);
    let tool = &rest[1..];
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server, tool))
}

/// One classified error kept in the per-upstream diagnostic ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedError {
    pub at: DateTime<Utc>,
    pub kind: ErrorKind,
    pub message: String,
}

/// Point-in-time copy of one upstream's connection bookkeeping.
///
/// Produced under the state lock and handed to callbacks and event
/// subscribers; never a live view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub last_error_kind: Option<ErrorKind>,
    pub retry_count: u32,
    pub oauth_retry_count: u32,
    pub consecutive_failures: u32,
    pub auto_disable_threshold: u32,
    pub auto_disabled: bool,
    pub auto_disable_reason: Option<String>,
    pub user_stopped: bool,
    pub first_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub recent_errors: Vec<RecordedError>,
}
