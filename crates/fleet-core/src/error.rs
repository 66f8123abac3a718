//! Error taxonomy: classification of upstream failures into actionable kinds.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::types::{ConnectionState, ServerState};

/// Classified failure category for one upstream operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Upstream requires an OAuth authorization round-trip.
    OauthRequired,
    /// A stored OAuth token was rejected or has expired.
    OauthToken,
    Timeout,
    /// Spawn failed with a recognizable missing module/command pattern.
    MissingDependency,
    Network,
    Protocol,
    Permission,
    RateLimit,
    UnknownTool,
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::OauthRequired => "oauth_required",
            Self::OauthToken => "oauth_token",
            Self::Timeout => "timeout",
            Self::MissingDependency => "missing_dependency",
            Self::Network => "network",
            Self::Protocol => "protocol",
            Self::Permission => "permission",
            Self::RateLimit => "rate_limit",
            Self::UnknownTool => "unknown_tool",
            Self::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

impl ErrorKind {
    /// Classify an error message into a kind.
    ///
    /// Pattern lists are checked most-specific first: token problems before
    /// generic auth, missing dependencies before generic spawn noise.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();

        if detect_missing_dependency(message).is_some() {
            return Self::MissingDependency;
        }

        for pattern in ["token expired", "invalid_grant", "invalid token", "token has been revoked"] {
            if lower.contains(pattern) {
                return Self::OauthToken;
            }
        }
        for pattern in ["oauth", "authorization required", "authorization_required", "401", "unauthorized"] {
            if lower.contains(pattern) {
                return Self::OauthRequired;
            }
        }
        for pattern in ["429", "rate limit", "too many requests", "quota exceeded"] {
            if lower.contains(pattern) {
                return Self::RateLimit;
            }
        }
        for pattern in ["403", "permission denied", "insufficient scope", "forbidden", "access denied"] {
            if lower.contains(pattern) {
                return Self::Permission;
            }
        }
        for pattern in ["timed out", "timeout", "deadline exceeded"] {
            if lower.contains(pattern) {
                return Self::Timeout;
            }
        }
        for pattern in [
            "connection refused",
            "connection reset",
            "no route to host",
            "network is unreachable",
            "dns error",
            "failed to lookup address",
            "broken pipe",
        ] {
            if lower.contains(pattern) {
                return Self::Network;
            }
        }
        for pattern in ["unknown tool", "tool not found", "no such tool"] {
            if lower.contains(pattern) {
                return Self::UnknownTool;
            }
        }
        for pattern in ["handshake", "initialize", "jsonrpc", "protocol", "unexpected response", "expected initialized"] {
            if lower.contains(pattern) {
                return Self::Protocol;
            }
        }

        Self::Unknown
    }

    /// True for kinds whose retries go through the OAuth backoff series.
    pub fn is_oauth(self) -> bool {
        matches!(self, Self::OauthRequired | Self::OauthToken)
    }
}

fn missing_dependency_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"ModuleNotFoundError: No module named '([^']+)'",
            r"Cannot find module '([^']+)'",
            r"command not found:?\s+([\w@./-]+)",
            r"([\w@./-]+): command not found",
            r"No such file or directory \(os error 2\)",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Extract the name of a missing package/command from spawn error text.
///
/// Returns the captured name when a pattern has one, or an empty string for
/// patterns that only prove *something* is missing (bare ENOENT).
pub fn detect_missing_dependency(message: &str) -> Option<String> {
    for pattern in missing_dependency_patterns() {
        if let Some(caps) = pattern.captures(message) {
            return Some(
                caps.get(1)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default(),
            );
        }
    }
    None
}

/// Structured errors surfaced by the dispatch layer.
///
/// These name the server and its state so callers (and the humans reading
/// them) can act without consulting logs.
#[derive(thiserror::Error, Debug)]
pub enum FleetError {
    #[error("unknown upstream server '{0}'")]
    UnknownServer(String),

    #[error("invalid tool name '{0}': expected 'server:tool'")]
    InvalidToolName(String),

    #[error("upstream '{server}' is {state}{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    ServerDisabled {
        server: String,
        state: ServerState,
        reason: Option<String>,
    },

    #[error("upstream '{server}' is not connected (state: {state}{})", .last_error.as_deref().map(|e| format!(", last error: {e}")).unwrap_or_default())]
    NotConnected {
        server: String,
        state: ConnectionState,
        last_error: Option<String>,
    },

    #[error("upstream '{0}' is already connecting")]
    AlreadyConnecting(String),

    #[error("disconnect timed out for upstreams: {}", .servers.join(", "))]
    DisconnectTimeout { servers: Vec<String> },
}
