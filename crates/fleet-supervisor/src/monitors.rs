//! Long-lived background monitors owned by the manager.
//!
//! Both are cooperative tasks with a cancellation token, joined at
//! shutdown. They hold only a weak reference to the manager so dropping it
//! ends them on their next tick.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleet_core::ErrorKind;

use crate::manager::{Manager, MonitorTask};

/// Processed OAuth events older than this are garbage-collected.
const OAUTH_EVENT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
/// Cleanup runs every N monitor ticks.
const OAUTH_CLEANUP_EVERY: u64 = 100;

pub(crate) fn spawn(manager: &Arc<Manager>) {
    let weak = Arc::downgrade(manager);
    let settings = manager.settings();

    let token = CancellationToken::new();
    let handle = tokio::spawn(oauth_monitor(
        weak.clone(),
        token.clone(),
        settings.oauth_poll_interval(),
        settings.token_retry_cooldown(),
    ));
    manager.register_monitor(MonitorTask { token, handle });

    let token = CancellationToken::new();
    let handle = tokio::spawn(health_monitor(
        weak,
        token.clone(),
        settings.health_interval(),
        settings.max_concurrent_connections,
    ));
    manager.register_monitor(MonitorTask { token, handle });
}

/// Every tick: consume cross-process OAuth completion events, then scan the
/// token store for upstreams stuck in OAuth-kind errors whose token arrived
/// without an event (a sibling process wrote it but could not publish).
async fn oauth_monitor(
    weak: Weak<Manager>,
    token: CancellationToken,
    interval: Duration,
    cooldown: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    // Per-server rate limit for token-scan retries.
    let mut last_token_retry: HashMap<String, Instant> = HashMap::new();
    let mut tick_count: u64 = 0;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(manager) = weak.upgrade() else { break };
        if manager.is_shutting_down() {
            continue;
        }
        tick_count += 1;

        match manager.store().unprocessed_oauth_completions().await {
            Ok(events) => {
                for event in events {
                    if let Some(client) = manager.get_client(&event.server_name) {
                        if !client.is_connected() && !client.is_connecting() {
                            info!(server = %event.server_name, "OAuth completion event, retrying connection");
                            let _ = manager.retry_connection(&event.server_name);
                        }
                    }
                    // Consumed either way; events for unknown or already-up
                    // servers are not replayed.
                    if let Err(error) = manager
                        .store()
                        .mark_oauth_completion_processed(&event.server_name, event.completed_at)
                        .await
                    {
                        warn!(
                            server = %event.server_name,
                            error = %format!("{error:#}"),
                            "failed to mark OAuth event processed"
                        );
                    }
                }
            }
            Err(error) => {
                debug!(error = %format!("{error:#}"), "failed to read OAuth completion events");
            }
        }

        if tick_count % OAUTH_CLEANUP_EVERY == 0 {
            if let Err(error) = manager
                .store()
                .cleanup_old_oauth_completions(OAUTH_EVENT_MAX_AGE)
                .await
            {
                debug!(error = %format!("{error:#}"), "OAuth event cleanup failed");
            }
        }

        for client in manager.snapshot_clients() {
            let state_manager = client.state_manager();
            if !matches!(state_manager.state(), fleet_core::ConnectionState::Error)
                || state_manager.is_auto_disabled()
                || state_manager.is_user_stopped()
            {
                continue;
            }
            if !state_manager
                .last_error_kind()
                .is_some_and(ErrorKind::is_oauth)
            {
                continue;
            }
            let name = client.name().to_string();
            if last_token_retry
                .get(&name)
                .is_some_and(|at| at.elapsed() < cooldown)
            {
                continue;
            }

            let config = client.config();
            match manager.store().get_token(&name, config.transport.url()).await {
                Ok(Some(token)) if token.is_usable() => {
                    info!(server = %name, "stored token found for failed upstream, retrying connection");
                    last_token_retry.insert(name.clone(), Instant::now());
                    let _ = manager.retry_connection(&name);
                }
                Ok(_) => {}
                Err(error) => {
                    debug!(server = %name, error = %format!("{error:#}"), "token lookup failed");
                }
            }
        }
    }
}

/// Every tick: reconnect every client that is eligible (startable, not
/// latched, not user-stopped, not up) and whose backoff window has
/// elapsed, through a bounded worker pool.
async fn health_monitor(
    weak: Weak<Manager>,
    token: CancellationToken,
    interval: Duration,
    pool_size: usize,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(manager) = weak.upgrade() else { break };
        if manager.is_shutting_down() {
            continue;
        }

        let eligible: Vec<_> = manager
            .snapshot_clients()
            .into_iter()
            .filter(|client| {
                let state_manager = client.state_manager();
                client.config().startup_mode.is_startable()
                    && !state_manager.is_auto_disabled()
                    && !state_manager.is_user_stopped()
                    && !client.is_connected()
                    && !client.is_connecting()
                    && state_manager.should_retry()
            })
            .collect();
        if eligible.is_empty() {
            continue;
        }

        info!(count = eligible.len(), "health monitor reconnecting upstreams");
        let permits = Arc::new(Semaphore::new(pool_size.max(1)));
        let mut tasks = JoinSet::new();
        for client in eligible {
            let permits = permits.clone();
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire().await else {
                    return;
                };
                if let Err(error) = client.connect().await {
                    debug!(
                        server = %client.name(),
                        error = %format!("{error:#}"),
                        "health reconnect failed"
                    );
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }
}
