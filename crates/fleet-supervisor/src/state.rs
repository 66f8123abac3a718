//! Per-upstream connection state machine and retry clock.
//!
//! All mutation happens under one mutex; the registered callback fires
//! after the state field is updated, never while the lock is held.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::warn;

use fleet_core::types::RECENT_ERROR_CAPACITY;
use fleet_core::{ConnectionSnapshot, ConnectionState, ErrorKind, RecordedError};

/// First-retry delay for the plain backoff series.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// OAuth retries cost the user a browser round-trip, so the series starts
/// at a minute and stretches to an hour.
const OAUTH_BACKOFF_SCHEDULE_SECS: &[u64] = &[60, 300, 900, 1800, 3600];

/// Fired after every transition with `(old, new, snapshot)`.
pub type StateChangeFn = Arc<dyn Fn(ConnectionState, ConnectionState, ConnectionSnapshot) + Send + Sync>;

struct StateInner {
    state: ConnectionState,
    last_error: Option<String>,
    last_error_kind: Option<ErrorKind>,
    retry_count: u32,
    oauth_retry_count: u32,
    last_retry_at: Option<Instant>,
    last_oauth_attempt_at: Option<Instant>,
    consecutive_failures: u32,
    first_attempt_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    auto_disable_threshold: u32,
    auto_disabled: bool,
    auto_disable_reason: Option<String>,
    // Runtime-only operator intent; reset to false on every process start
    // by construction and never persisted.
    user_stopped: bool,
    recent_errors: VecDeque<RecordedError>,
}

pub struct StateManager {
    server: String,
    inner: Mutex<StateInner>,
    callback: Mutex<Option<StateChangeFn>>,
    max_backoff: Duration,
}

impl StateManager {
    pub fn new(server: &str, auto_disable_threshold: u32, max_backoff: Duration) -> Self {
        Self {
            server: server.to_string(),
            inner: Mutex::new(StateInner {
                state: ConnectionState::Disconnected,
                last_error: None,
                last_error_kind: None,
                retry_count: 0,
                oauth_retry_count: 0,
                last_retry_at: None,
                last_oauth_attempt_at: None,
                consecutive_failures: 0,
                first_attempt_at: None,
                last_success_at: None,
                auto_disable_threshold,
                auto_disabled: false,
                auto_disable_reason: None,
                user_stopped: false,
                recent_errors: VecDeque::with_capacity(RECENT_ERROR_CAPACITY),
            }),
            callback: Mutex::new(None),
            max_backoff,
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn set_callback(&self, callback: StateChangeFn) {
        *lock_recover(&self.callback) = Some(callback);
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_auto_disabled(&self) -> bool {
        self.lock().auto_disabled
    }

    pub fn auto_disable_reason(&self) -> Option<String> {
        self.lock().auto_disable_reason.clone()
    }

    pub fn auto_disable_threshold(&self) -> u32 {
        self.lock().auto_disable_threshold
    }

    pub fn is_user_stopped(&self) -> bool {
        self.lock().user_stopped
    }

    pub fn set_user_stopped(&self, stopped: bool) {
        self.lock().user_stopped = stopped;
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    pub fn last_error_kind(&self) -> Option<ErrorKind> {
        self.lock().last_error_kind
    }

    /// Point-in-time copy of the whole bookkeeping block.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        snapshot_of(&self.lock())
    }

    /// Attempt a transition, recording `error` when moving into `Error`.
    ///
    /// Illegal transitions are rejected (and logged) rather than applied;
    /// the caller decides whether that is fatal. `Disconnected` is reachable
    /// from any state (explicit stop).
    pub fn transition(&self, next: ConnectionState, error: Option<&str>) -> anyhow::Result<()> {
        let (old, snapshot) = {
            let mut inner = self.lock();
            let old = inner.state;
            if !legal_transition(old, next) {
                drop(inner);
                warn!(server = %self.server, from = %old, to = %next, "illegal state transition rejected");
                anyhow::bail!(
                    "illegal state transition for '{}': {} -> {}",
                    self.server,
                    old,
                    next
                );
            }

            match next {
                ConnectionState::Connecting => {
                    if inner.first_attempt_at.is_none() {
                        inner.first_attempt_at = Some(Utc::now());
                    }
                }
                ConnectionState::Ready => {
                    mark_success_locked(&mut inner);
                }
                ConnectionState::Error => {
                    record_error_locked(&mut inner, error.unwrap_or("unknown error"));
                }
                _ => {}
            }
            inner.state = next;
            (old, snapshot_of(&inner))
        };

        self.fire(old, next, snapshot);
        Ok(())
    }

    /// Clear the failure counters and stamp the success time.
    pub fn mark_success(&self) {
        mark_success_locked(&mut self.lock());
    }

    /// Record a failed connect, latch auto-disable when the consecutive
    /// failure count reaches the threshold. Returns `true` when this call
    /// newly latched the upstream.
    pub fn record_connect_failure(&self, error: &str) -> bool {
        if self.transition(ConnectionState::Error, Some(error)).is_err() {
            return false;
        }

        let reason = {
            let inner = self.lock();
            if inner.auto_disabled
                || inner.auto_disable_threshold == 0
                || inner.consecutive_failures < inner.auto_disable_threshold
            {
                return false;
            }
            format!(
                "auto-disabled after {} consecutive failures: {}",
                inner.consecutive_failures,
                inner.last_error.as_deref().unwrap_or("unknown error")
            )
        };
        self.set_auto_disabled(&reason)
    }

    /// Idempotent latch: once set, every automatic retry path stays off
    /// until an operator clears the persisted state. Returns `true` when
    /// this call set the latch.
    pub fn set_auto_disabled(&self, reason: &str) -> bool {
        let (old, snapshot) = {
            let mut inner = self.lock();
            if inner.auto_disabled {
                return false;
            }
            let old = inner.state;
            inner.auto_disabled = true;
            inner.auto_disable_reason = Some(reason.to_string());
            inner.state = ConnectionState::Error;
            (old, snapshot_of(&inner))
        };
        self.fire(old, ConnectionState::Error, snapshot);
        true
    }

    /// Restore a latch from persisted state without emitting events.
    pub fn restore_auto_disabled(&self, reason: Option<String>) {
        let mut inner = self.lock();
        inner.auto_disabled = true;
        inner.auto_disable_reason = reason;
        inner.state = ConnectionState::Error;
    }

    /// Whether an automatic retry is due, with OAuth-kind failures gated by
    /// the longer OAuth series.
    pub fn should_retry(&self) -> bool {
        self.should_retry_at(Instant::now())
    }

    pub fn should_retry_at(&self, now: Instant) -> bool {
        let inner = self.lock();
        if !retry_permitted(&inner) {
            return false;
        }
        if inner.last_error_kind.is_some_and(ErrorKind::is_oauth) {
            oauth_retry_due(&inner, now)
        } else {
            plain_retry_due(&inner, now, self.max_backoff)
        }
    }

    /// OAuth-series variant regardless of the recorded kind; used by paths
    /// that know a token just arrived.
    pub fn should_retry_oauth_at(&self, now: Instant) -> bool {
        let inner = self.lock();
        retry_permitted(&inner) && oauth_retry_due(&inner, now)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StateInner> {
        lock_recover(&self.inner)
    }

    fn fire(&self, old: ConnectionState, new: ConnectionState, snapshot: ConnectionSnapshot) {
        let callback = lock_recover(&self.callback).clone();
        if let Some(callback) = callback {
            callback(old, new, snapshot);
        }
    }
}

fn lock_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn retry_permitted(inner: &StateInner) -> bool {
    inner.state == ConnectionState::Error && !inner.user_stopped && !inner.auto_disabled
}

fn plain_retry_due(inner: &StateInner, now: Instant, max_backoff: Duration) -> bool {
    let Some(last) = inner.last_retry_at else {
        return true;
    };
    now.duration_since(last) >= backoff_delay(inner.retry_count, max_backoff)
}

fn oauth_retry_due(inner: &StateInner, now: Instant) -> bool {
    let Some(last) = inner.last_oauth_attempt_at else {
        return true;
    };
    now.duration_since(last) >= oauth_backoff_delay(inner.oauth_retry_count)
}

/// Exponential backoff with up to 20% jitter, capped.
///
/// `retry_count` is the number of failures so far: one failure waits the
/// base delay, doubling from there.
pub fn backoff_delay(retry_count: u32, max_backoff: Duration) -> Duration {
    if retry_count == 0 {
        return Duration::ZERO;
    }
    let exponent = retry_count.saturating_sub(1).min(16);
    let raw = BACKOFF_BASE.saturating_mul(1u32 << exponent).min(max_backoff);
    let jitter = raw.mul_f64(rand::thread_rng().gen_range(0.0..0.2));
    (raw + jitter).min(max_backoff)
}

/// Fixed OAuth retry schedule indexed by attempt count, saturating at the
/// last step.
pub fn oauth_backoff_delay(oauth_retry_count: u32) -> Duration {
    if oauth_retry_count == 0 {
        return Duration::ZERO;
    }
    let idx = (oauth_retry_count as usize - 1).min(OAUTH_BACKOFF_SCHEDULE_SECS.len() - 1);
    Duration::from_secs(OAUTH_BACKOFF_SCHEDULE_SECS[idx])
}

fn mark_success_locked(inner: &mut StateInner) {
    inner.consecutive_failures = 0;
    inner.retry_count = 0;
    inner.oauth_retry_count = 0;
    inner.last_error = None;
    inner.last_error_kind = None;
    inner.last_success_at = Some(Utc::now());
}

fn record_error_locked(inner: &mut StateInner, error: &str) {
    let kind = ErrorKind::classify(error);
    inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
    inner.retry_count = inner.retry_count.saturating_add(1);
    inner.last_retry_at = Some(Instant::now());
    if kind.is_oauth() {
        inner.oauth_retry_count = inner.oauth_retry_count.saturating_add(1);
        inner.last_oauth_attempt_at = Some(Instant::now());
    }
    inner.last_error = Some(error.to_string());
    inner.last_error_kind = Some(kind);
    if inner.recent_errors.len() == RECENT_ERROR_CAPACITY {
        inner.recent_errors.pop_front();
    }
    inner.recent_errors.push_back(RecordedError {
        at: Utc::now(),
        kind,
        message: error.to_string(),
    });
}

fn snapshot_of(inner: &StateInner) -> ConnectionSnapshot {
    ConnectionSnapshot {
        state: inner.state,
        last_error: inner.last_error.clone(),
        last_error_kind: inner.last_error_kind,
        retry_count: inner.retry_count,
        oauth_retry_count: inner.oauth_retry_count,
        consecutive_failures: inner.consecutive_failures,
        auto_disable_threshold: inner.auto_disable_threshold,
        auto_disabled: inner.auto_disabled,
        auto_disable_reason: inner.auto_disable_reason.clone(),
        user_stopped: inner.user_stopped,
        first_attempt_at: inner.first_attempt_at,
        last_success_at: inner.last_success_at,
        recent_errors: inner.recent_errors.iter().cloned().collect(),
    }
}

/// The legal-transition table.
///
/// `Disconnected` is reachable from anywhere (explicit stop). `Error` is
/// reachable from every in-flight stage and from `Ready`.
fn legal_transition(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;
    if to == Disconnected {
        return true;
    }
    match (from, to) {
        (Disconnected, Connecting) => true,
        (Connecting, Authenticating | Discovering | Ready | Error) => true,
        (Authenticating, Discovering | Error) => true,
        (Discovering, Ready | Error) => true,
        (Ready, Error | Sleeping) => true,
        (Disconnected, Sleeping) => true,
        (Sleeping, Connecting) => true,
        (Error, Connecting) => true,
        // Re-entry while already in Error (repeated failures) is a counter
        // update, not a state change, but it must not be rejected.
        (Error, Error) => true,
        _ => false,
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
