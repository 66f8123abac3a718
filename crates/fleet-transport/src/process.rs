//! Child-process lifecycle: spawn in a fresh process group, capture stderr
//! for diagnostics, and tear the whole group down on close.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Upper bound on retained child stderr, enough for a stack trace.
const STDERR_BUFFER_CAP: usize = 8 * 1024;

/// Shared tail of a child's stderr output.
///
/// Spawn failures of interpreted servers (`ModuleNotFoundError`, `command
/// not found`) surface here rather than in the spawn syscall, so the buffer
/// is appended to handshake errors and failure reports.
#[derive(Clone, Default)]
pub struct StderrBuffer {
    inner: Arc<Mutex<String>>,
}

impl StderrBuffer {
    pub fn tail(&self) -> String {
        self.inner.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn push_line(&self, line: &str) {
        if let Ok(mut buf) = self.inner.lock() {
            // Keep the newest output: early lines age out once the cap hits.
            if buf.len() + line.len() + 1 > STDERR_BUFFER_CAP {
                let excess = (buf.len() + line.len() + 1).saturating_sub(STDERR_BUFFER_CAP);
                let cut = buf
                    .char_indices()
                    .map(|(i, _)| i)
                    .find(|&i| i >= excess)
                    .unwrap_or(buf.len());
                buf.drain(..cut);
            }
            buf.push_str(line);
            buf.push('\n');
        }
    }
}

/// Prepare and spawn a server child in its own process group.
///
/// - stdin/stdout piped (the MCP byte channel), stderr piped for capture
/// - `kill_on_drop` as a safety net
/// - `setsid()` in `pre_exec` so the whole tree can be signaled at once
///
/// Returns the child plus a live stderr tail; a background task drains
/// stderr until EOF.
pub fn spawn_process_group(mut cmd: Command) -> std::io::Result<(Child, StderrBuffer)> {
    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    // SAFETY: setsid() is async-signal-safe and runs before exec.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let mut child = cmd.spawn()?;

    let stderr_tail = StderrBuffer::default();
    if let Some(stderr) = child.stderr.take() {
        let tail = stderr_tail.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tail.push_line(&line);
            }
        });
    }

    Ok((child, stderr_tail))
}

/// Terminate a child and everything in its process group.
///
/// SIGTERM to the group, wait up to `grace`, then SIGKILL the group and
/// reap. Falls back to killing only the direct child on non-Unix targets or
/// when the PID is already gone.
pub async fn terminate_process_group(child: &mut Child, grace: Duration) {
    let pid = child.id();

    if let Some(pid) = pid {
        signal_process_group(pid, libc::SIGTERM);
    } else {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(?status, "server child exited after SIGTERM");
            return;
        }
        Ok(Err(error)) => {
            debug!(error = %error, "failed to wait for server child");
            return;
        }
        Err(_) => {
            warn!(
                grace_secs = grace.as_secs(),
                "server child ignored SIGTERM, escalating to SIGKILL"
            );
        }
    }

    if let Some(pid) = pid {
        signal_process_group(pid, libc::SIGKILL);
    } else {
        let _ = child.start_kill();
    }
    let _ = child.wait().await;
}

/// Send a signal to a whole process group.
pub fn signal_process_group(pid: u32, signal: i32) {
    #[cfg(unix)]
    {
        // SAFETY: kill() is async-signal-safe; negative PID targets the group.
        unsafe {
            libc::kill(-(pid as i32), signal);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
    }
}
