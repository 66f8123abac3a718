use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fleet_config::UpstreamConfig;
use fleet_core::ServerState;

/// Persisted per-upstream record.
///
/// Identity and transport summary plus the administrative state and
/// connection history. The auto-disable fields ride along on every save so
/// an incidental history write can never silently clear a latch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamRecord {
    pub name: String,
    pub transport_label: String,
    /// URL for remote transports, command/image for process-backed ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub server_state: ServerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_disable_reason: Option<String>,
    #[serde(default)]
    pub auto_disable_threshold: u32,
    #[serde(default)]
    pub ever_connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_connection: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tool_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UpstreamRecord {
    /// Fresh record for a newly configured upstream.
    pub fn from_config(config: &UpstreamConfig) -> Self {
        let now = Utc::now();
        let endpoint = match &config.transport {
            fleet_config::UpstreamTransport::Stdio { command, .. } => Some(command.clone()),
            fleet_config::UpstreamTransport::DockerStdio { image, .. } => Some(image.clone()),
            fleet_config::UpstreamTransport::StreamableHttp { url, .. }
            | fleet_config::UpstreamTransport::Sse { url, .. } => Some(url.clone()),
        };
        Self {
            name: config.name.clone(),
            transport_label: config.transport.label().to_string(),
            endpoint,
            server_state: match config.startup_mode {
                fleet_config::StartupMode::Active | fleet_config::StartupMode::LazyLoading => {
                    ServerState::Active
                }
                fleet_config::StartupMode::Disabled => ServerState::Disabled,
                fleet_config::StartupMode::Quarantined => ServerState::Quarantined,
                fleet_config::StartupMode::AutoDisabled => ServerState::AutoDisabled,
            },
            auto_disable_reason: None,
            auto_disable_threshold: config.auto_disable_threshold,
            ever_connected: config.ever_connected,
            last_successful_connection: config.last_successful_connection,
            tool_count: config.tool_count,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Cross-process signal that an OAuth flow finished for a server.
///
/// Written by whichever process completed the browser round-trip; consumed
/// (at most once, via the `processed` flag) by the supervisor's event
/// monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthCompletionEvent {
    pub server_name: String,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub processed: bool,
}

impl OAuthCompletionEvent {
    pub fn new(server_name: &str) -> Self {
        Self {
            server_name: server_name.to_string(),
            completed_at: Utc::now(),
            processed: false,
        }
    }
}

/// Stored OAuth token for one upstream endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub server_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenRecord {
    /// A token with no expiry is treated as usable.
    pub fn is_usable(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at > Utc::now(),
            None => true,
        }
    }
}

// Tokens end up in logs through Debug formatting more often than through
// intent; keep the secret out of it.
impl std::fmt::Display for TokenRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "token for '{}' ({})",
            self.server_name,
            self.server_url.as_deref().unwrap_or("no url")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_config::{StartupMode, UpstreamTransport};
    use std::collections::HashMap;

    fn config(name: &str, mode: StartupMode) -> UpstreamConfig {
        let mut cfg = UpstreamConfig::new(
            name,
            UpstreamTransport::Stdio {
                command: "uvx".to_string(),
                args: vec![],
                env: HashMap::new(),
                working_dir: None,
            },
        );
        cfg.startup_mode = mode;
        cfg
    }

    #[test]
    fn record_mirrors_config_identity() {
        let mut cfg = config("git", StartupMode::Active);
        cfg.ever_connected = true;
        cfg.tool_count = 7;
        let record = UpstreamRecord::from_config(&cfg);
        assert_eq!(record.name, "git");
        assert_eq!(record.transport_label, "stdio");
        assert_eq!(record.endpoint.as_deref(), Some("uvx"));
        assert_eq!(record.server_state, ServerState::Active);
        assert!(record.ever_connected);
        assert_eq!(record.tool_count, 7);
    }

    #[test]
    fn startup_mode_maps_to_server_state() {
        let cases = [
            (StartupMode::Active, ServerState::Active),
            (StartupMode::LazyLoading, ServerState::Active),
            (StartupMode::Disabled, ServerState::Disabled),
            (StartupMode::Quarantined, ServerState::Quarantined),
            (StartupMode::AutoDisabled, ServerState::AutoDisabled),
        ];
        for (mode, expected) in cases {
            let record = UpstreamRecord::from_config(&config("s", mode));
            assert_eq!(record.server_state, expected, "mode {mode}");
        }
    }

    #[test]
    fn token_usability_tracks_expiry() {
        let mut token = TokenRecord {
            server_name: "g".into(),
            server_url: None,
            access_token: "secret".into(),
            refresh_token: None,
            expires_at: None,
        };
        assert!(token.is_usable());

        token.expires_at = Some(Utc::now() + chrono::Duration::minutes(5));
        assert!(token.is_usable());

        token.expires_at = Some(Utc::now() - chrono::Duration::minutes(5));
        assert!(!token.is_usable());
    }

    #[test]
    fn token_display_hides_secret() {
        let token = TokenRecord {
            server_name: "g".into(),
            server_url: Some("https://example.com".into()),
            access_token: "super-secret".into(),
            refresh_token: None,
            expires_at: None,
        };
        let shown = token.to_string();
        assert!(!shown.contains("super-secret"));
        assert!(shown.contains("'g'"));
    }

    #[test]
    fn new_oauth_event_is_unprocessed() {
        let event = OAuthCompletionEvent::new("github");
        assert!(!event.processed);
        assert_eq!(event.server_name, "github");
    }
}
