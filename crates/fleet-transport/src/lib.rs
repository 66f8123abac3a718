//! Byte-channel transports for upstream MCP servers.
//!
//! A [`Transport`] couples a connected rmcp client service with ownership of
//! whatever backs it: a child process group, a Docker container, or a remote
//! HTTP stream. [`TransportFactory`] is the seam the supervisor uses to open
//! one; the default factory dispatches on the configured transport variant.

pub mod docker;
pub mod process;

use std::time::Duration;

use async_trait::async_trait;
use rmcp::RoleClient;
use rmcp::service::{RunningService, ServiceExt};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use fleet_config::{UpstreamConfig, UpstreamTransport};

use crate::docker::ContainerHandle;
use crate::process::{StderrBuffer, spawn_process_group, terminate_process_group};

/// Grace period between SIGTERM and SIGKILL when closing a stdio child.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(3);

/// Failure modes surfaced to the connection supervisor.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("failed to spawn upstream process: {0}")]
    Spawn(String),

    #[error("MCP handshake failed: {0}")]
    Handshake(String),

    #[error("transport closed")]
    Closed,

    #[error("transport operation timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

enum Backend {
    Child {
        child: Box<Child>,
    },
    Docker {
        child: Box<Child>,
        container: ContainerHandle,
    },
    Remote,
    InProcess,
}

/// One open byte channel to an upstream, handshake already complete.
pub struct Transport {
    service: RunningService<RoleClient, ()>,
    stderr: Option<StderrBuffer>,
    backend: Backend,
}

impl Transport {
    /// Wrap an already-connected service with no external lifecycle, e.g. a
    /// loopback upstream living in this process.
    pub fn in_process(service: RunningService<RoleClient, ()>) -> Self {
        Self {
            service,
            stderr: None,
            backend: Backend::InProcess,
        }
    }

    /// The rmcp client service carrying MCP framing for this channel.
    pub fn service(&self) -> &RunningService<RoleClient, ()> {
        &self.service
    }

    /// Used by the manager to order shutdown: docker-backed transports get
    /// extra settle time for container removal.
    pub fn is_docker_backed(&self) -> bool {
        matches!(self.backend, Backend::Docker { .. })
    }

    /// Recent stderr from the backing child, when there is one.
    pub fn stderr_tail(&self) -> Option<String> {
        self.stderr.as_ref().map(StderrBuffer::tail)
    }

    /// Graceful close.
    ///
    /// Cancels the rmcp service first so no frame is in flight, then tears
    /// down the backend: SIGTERM → grace → SIGKILL for the whole process
    /// group, or `docker rm -f` with inspect-poll verification.
    pub async fn close(self, grace: Duration) {
        let Transport {
            service, backend, ..
        } = self;
        let _ = service.cancel().await;

        match backend {
            Backend::Child { mut child } => {
                terminate_process_group(&mut child, grace).await;
            }
            Backend::Docker {
                mut child,
                container,
            } => {
                container.force_remove().await;
                // The `docker run` client exits once the container is gone.
                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(_) => {}
                    Err(_) => {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                    }
                }
            }
            Backend::Remote | Backend::InProcess => {}
        }
    }
}

/// Opens transports for upstream configs.
///
/// The supervisor holds this as a trait object so tests (and embeddings) can
/// substitute in-process upstreams.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, config: &UpstreamConfig) -> Result<Transport, TransportError>;
}

/// Production factory: spawns children, launches containers, dials remotes.
#[derive(Debug, Default)]
pub struct DefaultTransportFactory;

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn connect(&self, config: &UpstreamConfig) -> Result<Transport, TransportError> {
        match &config.transport {
            UpstreamTransport::Stdio {
                command,
                args,
                env,
                working_dir,
            } => {
                let mut cmd = Command::new(command);
                cmd.args(args);
                for (key, value) in env {
                    cmd.env(key, value);
                }
                if let Some(dir) = working_dir {
                    cmd.current_dir(dir);
                }
                connect_child(&config.name, cmd, None).await
            }
            UpstreamTransport::DockerStdio { image, args, env } => {
                let container = ContainerHandle::new(&config.name);
                let cmd = container.run_command(image, args, env);
                connect_child(&config.name, cmd, Some(container)).await
            }
            UpstreamTransport::StreamableHttp {
                url,
                allow_insecure,
                ..
            }
            | UpstreamTransport::Sse {
                url,
                allow_insecure,
                ..
            } => connect_remote(&config.name, url, *allow_insecure).await,
        }
    }
}

/// Spawn a child (plain or `docker run`) and negotiate the MCP handshake
/// over its stdio.
async fn connect_child(
    server: &str,
    cmd: Command,
    container: Option<ContainerHandle>,
) -> Result<Transport, TransportError> {
    let (mut child, stderr) =
        spawn_process_group(cmd).map_err(|e| TransportError::Spawn(e.to_string()))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| TransportError::Spawn(format!("no stdout handle for '{server}'")))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| TransportError::Spawn(format!("no stdin handle for '{server}'")))?;

    debug!(server = %server, pid = child.id(), "spawned upstream process");

    let service = match ().serve((stdout, stdin)).await {
        Ok(service) => service,
        Err(error) => {
            // The child is already broken; reap it before reporting.
            terminate_process_group(&mut child, Duration::from_secs(1)).await;
            if let Some(container) = &container {
                container.force_remove().await;
            }
            return Err(TransportError::Handshake(handshake_message(
                &error.to_string(),
                &stderr.tail(),
            )));
        }
    };

    let backend = match container {
        Some(container) => Backend::Docker {
            child: Box::new(child),
            container,
        },
        None => Backend::Child {
            child: Box::new(child),
        },
    };

    Ok(Transport {
        service,
        stderr: Some(stderr),
        backend,
    })
}

/// Dial a remote MCP endpoint over the streamable HTTP client.
///
/// SSE-configured upstreams go through the same client; the distinction
/// survives in config labels and status output only.
async fn connect_remote(
    server: &str,
    url: &str,
    allow_insecure: bool,
) -> Result<Transport, TransportError> {
    validate_remote_url(server, url, allow_insecure)?;

    info!(server = %server, url = %url, "connecting to remote MCP server");

    let transport = rmcp::transport::StreamableHttpClientTransport::from_uri(url.to_string());
    let service = ()
        .serve(transport)
        .await
        .map_err(|e| TransportError::Handshake(format!("'{server}' at {url}: {e}")))?;

    Ok(Transport {
        service,
        stderr: None,
        backend: Backend::Remote,
    })
}

/// Scheme whitelist plus HTTPS enforcement unless the entry opted into
/// insecure connections.
fn validate_remote_url(
    server: &str,
    url: &str,
    allow_insecure: bool,
) -> Result<(), TransportError> {
    if url.starts_with("https://") {
        return Ok(());
    }
    if url.starts_with("http://") {
        if allow_insecure {
            return Ok(());
        }
        return Err(TransportError::Handshake(format!(
            "server '{server}': insecure url {url} rejected (set allow_insecure to permit http://)"
        )));
    }
    Err(TransportError::Handshake(format!(
        "server '{server}': unsupported url scheme in {url} (expected http:// or https://)"
    )))
}

fn handshake_message(error: &str, stderr_tail: &str) -> String {
    let tail = stderr_tail.trim();
    if tail.is_empty() {
        error.to_string()
    } else {
        format!("{error}; stderr: {tail}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn stdio_config(name: &str, command: &str, args: &[&str]) -> UpstreamConfig {
        UpstreamConfig::new(
            name,
            UpstreamTransport::Stdio {
                command: command.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
                env: HashMap::new(),
                working_dir: None,
            },
        )
    }

    #[test]
    fn remote_url_validation() {
        assert!(validate_remote_url("s", "https://example.com/mcp", false).is_ok());
        assert!(validate_remote_url("s", "http://localhost:1234/mcp", true).is_ok());
        assert!(validate_remote_url("s", "http://localhost:1234/mcp", false).is_err());
        assert!(validate_remote_url("s", "wss://example.com", true).is_err());
    }

    #[test]
    fn handshake_message_appends_stderr() {
        assert_eq!(handshake_message("boom", ""), "boom");
        assert_eq!(
            handshake_message("boom", "ModuleNotFoundError: No module named 'x'\n"),
            "boom; stderr: ModuleNotFoundError: No module named 'x'"
        );
    }

    #[tokio::test]
    async fn spawn_failure_is_a_spawn_error() {
        let factory = DefaultTransportFactory;
        let config = stdio_config("ghost", "/nonexistent/definitely-not-a-binary", &[]);
        match factory.connect(&config).await {
            Err(TransportError::Spawn(message)) => {
                assert!(
                    message.contains("No such file") || message.contains("os error 2"),
                    "unexpected spawn message: {message}"
                );
            }
            other => panic!("expected Spawn error, got {:?}", other.map(|_| "transport")),
        }
    }

    #[tokio::test]
    async fn immediate_exit_fails_handshake() {
        let factory = DefaultTransportFactory;
        let config = stdio_config("false", "/bin/false", &[]);
        let result = tokio::time::timeout(Duration::from_secs(10), factory.connect(&config))
            .await
            .expect("handshake against a dead child must fail promptly");
        match result {
            Err(TransportError::Handshake(_)) => {}
            other => panic!(
                "expected Handshake error, got {:?}",
                other.map(|_| "transport")
            ),
        }
    }
}
