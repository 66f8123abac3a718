//! Docker container lifecycle for docker-stdio upstreams.
//!
//! The container is launched with `docker run --rm -i` under a
//! deterministic name and a `--cidfile`, so removal can target either the
//! name or the recorded id even if the supervisor restarts mid-flight.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, warn};

/// How long `force_remove` polls `docker inspect` for the container to be
/// gone before giving up.
const REMOVAL_VERIFY_TIMEOUT: Duration = Duration::from_secs(5);
const REMOVAL_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Deterministic container name for an upstream, unique per supervisor
/// process so a crashed predecessor's leftovers never collide.
pub fn container_name(server: &str) -> String {
    let mut sanitized = String::with_capacity(server.len());
    for ch in server.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
            sanitized.push(ch);
        } else {
            sanitized.push('_');
        }
    }
    if sanitized.is_empty() {
        sanitized.push_str("unnamed");
    }
    format!("fleet-{}-{}", sanitized, std::process::id())
}

/// Handle to a running (or launching) container.
pub struct ContainerHandle {
    pub name: String,
    pub cid_file: PathBuf,
}

impl ContainerHandle {
    pub fn new(server: &str) -> Self {
        let name = container_name(server);
        let cid_file = std::env::temp_dir().join(format!("{name}.cid"));
        Self { name, cid_file }
    }

    /// Build the `docker run` command for this container.
    ///
    /// `--rm` makes the daemon collect the container on exit; `-i` keeps
    /// stdin open for the MCP byte channel.
    pub fn run_command(
        &self,
        image: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Command {
        // Docker refuses to start when the cidfile already exists.
        let _ = std::fs::remove_file(&self.cid_file);

        let mut cmd = Command::new("docker");
        cmd.arg("run")
            .arg("--rm")
            .arg("-i")
            .arg("--name")
            .arg(&self.name)
            .arg("--cidfile")
            .arg(&self.cid_file);
        for (key, value) in env {
            cmd.arg("-e").arg(format!("{key}={value}"));
        }
        cmd.arg(image);
        cmd.args(args);
        cmd
    }

    /// Container id recorded by the daemon, when the cidfile has appeared.
    pub fn container_id(&self) -> Option<String> {
        std::fs::read_to_string(&self.cid_file)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Force-remove the container and verify it is gone.
    ///
    /// `docker rm -f` targets the recorded id when available (survives a
    /// rename race), the deterministic name otherwise; then `docker inspect`
    /// is polled until it reports the container absent or the verification
    /// window closes.
    pub async fn force_remove(&self) {
        let target = self.container_id().unwrap_or_else(|| self.name.clone());

        let removed = Command::new("docker")
            .arg("rm")
            .arg("-f")
            .arg(&target)
            .output()
            .await;
        match removed {
            Ok(output) if output.status.success() => {
                debug!(container = %target, "docker rm -f succeeded");
            }
            Ok(output) => {
                debug!(
                    container = %target,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "docker rm -f reported failure (container may already be gone)"
                );
            }
            Err(error) => {
                warn!(container = %target, error = %error, "failed to invoke docker rm");
            }
        }

        let deadline = Instant::now() + REMOVAL_VERIFY_TIMEOUT;
        loop {
            match Command::new("docker")
                .arg("inspect")
                .arg(&target)
                .output()
                .await
            {
                // Inspect failing means the container no longer exists.
                Ok(output) if !output.status.success() => break,
                Err(_) => break,
                Ok(_) => {}
            }
            if Instant::now() >= deadline {
                warn!(
                    container = %target,
                    timeout_secs = REMOVAL_VERIFY_TIMEOUT.as_secs(),
                    "container still present after removal window"
                );
                break;
            }
            tokio::time::sleep(REMOVAL_POLL_INTERVAL).await;
        }

        let _ = std::fs::remove_file(&self.cid_file);
    }
}
