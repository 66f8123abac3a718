//! Fan-out of state transitions and failure diagnostics to subscribers.
//!
//! Delivery is out-of-band over a broadcast channel: publishing never
//! blocks, and a slow subscriber loses old events instead of stalling
//! state transitions.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

use fleet_config::{UpstreamConfig, UpstreamTransport};
use fleet_core::{ConnectionSnapshot, ConnectionState, ErrorKind, RecordedError,
    detect_missing_dependency};

const EVENT_BUS_CAPACITY: usize = 256;
const REACHABILITY_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Events published by the supervisor.
#[derive(Debug, Clone)]
pub enum FleetEvent {
    StateChange {
        server: String,
        old: ConnectionState,
        new: ConnectionState,
        snapshot: ConnectionSnapshot,
    },
    FailureReport(FailureReport),
}

/// Structured diagnostic emitted when an upstream is auto-disabled.
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub server: String,
    pub transport_label: String,
    /// Last errors with timestamps and classes, oldest first.
    pub recent_errors: Vec<RecordedError>,
    /// Transport parameters with secret values masked.
    pub transport_params: BTreeMap<String, String>,
    /// Package/command names parsed out of spawn error text.
    pub missing_packages: Vec<String>,
    /// TCP reachability of the endpoint; `None` for process transports.
    pub endpoint_reachable: Option<bool>,
    pub oauth_configured: bool,
    pub suggestions: Vec<String>,
}

impl FailureReport {
    /// Assemble a report from the config and a connection snapshot.
    ///
    /// Probes remote endpoints over TCP (bounded by a 2 s timeout); never
    /// touches the upstream protocol.
    pub async fn build(config: &UpstreamConfig, snapshot: &ConnectionSnapshot) -> Self {
        let endpoint_reachable = match config.transport.url() {
            Some(url) => probe_endpoint(url).await,
            None => None,
        };

        let missing_packages = snapshot
            .recent_errors
            .iter()
            .filter_map(|e| detect_missing_dependency(&e.message))
            .filter(|name| !name.is_empty())
            .collect::<std::collections::BTreeSet<String>>()
            .into_iter()
            .collect();

        Self {
            server: config.name.clone(),
            transport_label: config.transport.label().to_string(),
            recent_errors: snapshot.recent_errors.clone(),
            transport_params: redact_transport_params(&config.transport),
            missing_packages,
            endpoint_reachable,
            oauth_configured: config.oauth.is_some(),
            suggestions: suggestions_for(config, snapshot),
        }
    }
}

/// Remediation hints derived from the error classes seen recently.
pub fn suggestions_for(config: &UpstreamConfig, snapshot: &ConnectionSnapshot) -> Vec<String> {
    let mut suggestions = Vec::new();
    let mut seen = std::collections::BTreeSet::new();
    let kinds = snapshot
        .recent_errors
        .iter()
        .map(|e| e.kind)
        .chain(snapshot.last_error_kind);

    for kind in kinds {
        if !seen.insert(kind) {
            continue;
        }
        let suggestion = match kind {
            ErrorKind::MissingDependency => {
                let named = snapshot
                    .recent_errors
                    .iter()
                    .find_map(|e| detect_missing_dependency(&e.message))
                    .filter(|n| !n.is_empty());
                match named {
                    Some(name) => {
                        format!("install the missing dependency '{name}' and retry '{}'", config.name)
                    }
                    None => format!(
                        "verify the command for '{}' is installed and on PATH",
                        config.name
                    ),
                }
            }
            ErrorKind::OauthRequired => {
                format!("authorize '{}' (OAuth flow has not completed)", config.name)
            }
            ErrorKind::OauthToken => {
                format!("re-authorize '{}' (stored token was rejected)", config.name)
            }
            ErrorKind::Network => match config.transport.url() {
                Some(url) => format!("check that {url} is reachable from this host"),
                None => format!("check network access required by '{}'", config.name),
            },
            ErrorKind::Timeout => format!(
                "increase connection_timeout_secs for '{}' or check upstream responsiveness",
                config.name
            ),
            ErrorKind::RateLimit => {
                format!("'{}' is rate limiting; reduce call volume or wait", config.name)
            }
            ErrorKind::Permission => {
                format!("the credentials for '{}' lack required permissions", config.name)
            }
            ErrorKind::Protocol => format!(
                "'{}' does not speak MCP correctly; check its version",
                config.name
            ),
            ErrorKind::UnknownTool | ErrorKind::Unknown => continue,
        };
        suggestions.push(suggestion);
    }

    if suggestions.is_empty() {
        suggestions.push(format!(
            "inspect recent errors for '{}' and retry the connection manually",
            config.name
        ));
    }
    suggestions
}

/// Transport parameters with env-var and header values masked.
fn redact_transport_params(transport: &UpstreamTransport) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    match transport {
        UpstreamTransport::Stdio {
            command,
            args,
            env,
            working_dir,
        } => {
            params.insert("command".into(), command.clone());
            if !args.is_empty() {
                params.insert("args".into(), args.join(" "));
            }
            for key in env.keys() {
                params.insert(format!("env.{key}"), "***".into());
            }
            if let Some(dir) = working_dir {
                params.insert("working_dir".into(), dir.display().to_string());
            }
        }
        UpstreamTransport::DockerStdio { image, args, env } => {
            params.insert("image".into(), image.clone());
            if !args.is_empty() {
                params.insert("args".into(), args.join(" "));
            }
            for key in env.keys() {
                params.insert(format!("env.{key}"), "***".into());
            }
        }
        UpstreamTransport::StreamableHttp { url, headers, .. }
        | UpstreamTransport::Sse { url, headers, .. } => {
            params.insert("url".into(), url.clone());
            for key in headers.keys() {
                params.insert(format!("header.{key}"), "***".into());
            }
        }
    }
    params
}

/// TCP connect probe against the URL's host/port.
async fn probe_endpoint(url: &str) -> Option<bool> {
    let (host, port) = parse_host_port(url)?;
    let reachable = tokio::time::timeout(
        REACHABILITY_PROBE_TIMEOUT,
        tokio::net::TcpStream::connect((host.as_str(), port)),
    )
    .await
    .map(|r| r.is_ok())
    .unwrap_or(false);
    Some(reachable)
}

/// Extract `(host, port)` from an http(s) URL, defaulting the port by
/// scheme. IPv6 literals in brackets are supported.
fn parse_host_port(url: &str) -> Option<(String, u16)> {
    let (default_port, rest) = if let Some(rest) = url.strip_prefix("https://") {
        (443u16, rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        (80u16, rest)
    } else {
        return None;
    };

    let authority = rest.split(['/', '?', '#']).next()?;
    let authority = authority.rsplit('@').next()?;
    if authority.is_empty() {
        return None;
    }

    if let Some(stripped) = authority.strip_prefix('[') {
        let (host, tail) = stripped.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None => default_port,
        };
        return Some((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => Some((host.to_string(), port.parse().ok()?)),
        None => Some((authority.to_string(), default_port)),
    }
}

/// Broadcast-backed event bus.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<FleetEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_BUS_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.sender.subscribe()
    }

    /// Best-effort publish; an event with no subscribers is dropped.
    pub fn publish(&self, event: FleetEvent) {
        let _ = self.sender.send(event);
    }
}
