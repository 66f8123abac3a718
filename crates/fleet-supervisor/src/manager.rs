//! Registry and policy layer: batch lifecycle, `server:tool` dispatch,
//! cross-process OAuth monitoring, and shutdown ordering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use rmcp::model::CallToolResult;
use serde::Serialize;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleet_config::{FleetSettings, StartupMode, UpstreamConfig};
use fleet_core::{
    ConnectionSnapshot, ConnectionState, FleetError, ServerState, ToolDescriptor, split_tool_name,
};
use fleet_store::{FailureLog, Store};
use fleet_transport::TransportFactory;

use crate::client::{AutoDisableFn, ClientCallbacks, ClientContext, ManagedClient};
use crate::events::{EventBus, FailureReport, FleetEvent};
use crate::index::ToolIndex;
use crate::monitors;
use crate::oauth::OAuthAgent;
use crate::scheduler::{ConnectSummary, ConnectionScheduler};
use crate::state::StateChangeFn;

/// Settle time after disconnect for Docker removals to finish server-side.
const DOCKER_SETTLE_GRACE: Duration = Duration::from_secs(3);
const LAZY_WAKE_POLL: Duration = Duration::from_millis(50);

/// Invoked when an upstream auto-disables so the registry file can be
/// rewritten with the new startup mode.
pub type ConfigSaveFn = Arc<dyn Fn(&str, StartupMode) + Send + Sync>;

/// Everything the manager needs at construction.
pub struct ManagerConfig {
    pub settings: FleetSettings,
    pub factory: Arc<dyn TransportFactory>,
    pub store: Arc<dyn Store>,
    pub oauth: Arc<dyn OAuthAgent>,
    pub index: Option<Arc<dyn ToolIndex>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub total_servers: usize,
    pub connected: usize,
    pub connecting: usize,
    pub sleeping: usize,
    pub errored: usize,
    pub disabled: usize,
    pub auto_disabled: usize,
    pub total_tools: u64,
}

/// One row of operator-facing status output.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub transport: String,
    pub startup_mode: StartupMode,
    pub state: ConnectionState,
    pub tool_count: u64,
    pub last_error: Option<String>,
    pub auto_disable_reason: Option<String>,
}

pub(crate) struct MonitorTask {
    pub token: CancellationToken,
    pub handle: JoinHandle<()>,
}

pub struct Manager {
    weak: Weak<Manager>,
    settings: FleetSettings,
    ctx: ClientContext,
    store: Arc<dyn Store>,
    clients: StdRwLock<HashMap<String, Arc<ManagedClient>>>,
    event_bus: StdMutex<Option<EventBus>>,
    index: StdMutex<Option<Arc<dyn ToolIndex>>>,
    config_save: StdMutex<Option<ConfigSaveFn>>,
    external_auto_disable: StdMutex<Option<AutoDisableFn>>,
    monitors: StdMutex<Vec<MonitorTask>>,
    shutting_down: AtomicBool,
}

impl Manager {
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        let ManagerConfig {
            settings,
            factory,
            store,
            oauth,
            index,
        } = config;

        let ctx = ClientContext {
            factory,
            store: store.clone(),
            oauth,
            failure_log: FailureLog::new(&settings.data_dir()),
            default_auto_disable_threshold: settings.auto_disable_threshold,
            max_backoff: settings.max_backoff(),
            health_interval: settings.health_interval(),
            tool_cache_ttl: settings.tool_cache_ttl(),
        };

        let manager = Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            settings,
            ctx,
            store,
            clients: StdRwLock::new(HashMap::new()),
            event_bus: StdMutex::new(None),
            index: StdMutex::new(index),
            config_save: StdMutex::new(None),
            external_auto_disable: StdMutex::new(None),
            monitors: StdMutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        });
        monitors::spawn(&manager);
        manager
    }

    pub fn set_event_bus(&self, bus: EventBus) {
        *lock(&self.event_bus) = Some(bus);
    }

    pub fn set_config_save_hook(&self, hook: ConfigSaveFn) {
        *lock(&self.config_save) = Some(hook);
    }

    pub fn set_server_auto_disable_callback(&self, callback: AutoDisableFn) {
        *lock(&self.external_auto_disable) = Some(callback);
    }

    pub(crate) fn settings(&self) -> &FleetSettings {
        &self.settings
    }

    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Register (or refresh) an upstream. Idempotent: a config describing
    /// the same endpoint keeps the live client and its connection; a
    /// changed one replaces the client, disconnecting the old one
    /// asynchronously.
    pub async fn add_server_config(&self, config: UpstreamConfig) -> Result<Arc<ManagedClient>> {
        let name = config.name.clone();

        if let Some(existing) = self.get_client(&name) {
            if existing.config().same_endpoint(&config) {
                debug!(server = %name, "config unchanged, keeping live client");
                existing.swap_config(config);
                return Ok(existing);
            }
            info!(server = %name, "config changed, replacing client");
            write(&self.clients).remove(&name);
            if let Some(index) = lock(&self.index).clone() {
                index.remove_server_tools(&name);
            }
            tokio::spawn(async move {
                let _ = existing.disconnect().await;
            });
        }

        let client = ManagedClient::new(config, &self.ctx);
        match self.store.get_upstream(&name).await {
            Ok(Some(record)) => client.restore_from_record(&record),
            Ok(None) => {}
            Err(error) => {
                warn!(server = %name, error = %format!("{error:#}"), "failed to load persisted record");
            }
        }
        self.wire_client(&client);
        write(&self.clients).insert(name, client.clone());
        Ok(client)
    }

    /// `add_server_config` plus a conditional connect, honoring startup
    /// modes, the user-stop flag, and lazy loading. Connect failures are
    /// the auto-disable machinery's business, not the caller's.
    pub async fn add_server(&self, config: UpstreamConfig) -> Result<()> {
        let client = self.add_server_config(config).await?;
        let state_manager = client.state_manager();
        if !client.config().startup_mode.is_startable()
            || state_manager.is_auto_disabled()
            || state_manager.is_user_stopped()
        {
            return Ok(());
        }
        if client.is_lazy_eligible() {
            if client.get_state() == ConnectionState::Disconnected {
                client.enter_sleep();
            }
            return Ok(());
        }
        if client.is_connected() || client.is_connecting() {
            return Ok(());
        }
        if let Err(error) = client.connect().await {
            warn!(server = %client.name(), error = %format!("{error:#}"), "initial connect failed");
        }
        Ok(())
    }

    /// Synchronous map removal; the disconnect (which may wait on a
    /// half-open connect) runs in the background so removal never blocks.
    pub fn remove_server(&self, name: &str) -> bool {
        let Some(client) = write(&self.clients).remove(name) else {
            return false;
        };
        if let Some(index) = lock(&self.index).clone() {
            index.remove_server_tools(name);
        }
        let store = self.store.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            if let Err(error) = client.disconnect().await {
                debug!(server = %name, error = %format!("{error:#}"), "disconnect after removal failed");
            }
            if let Err(error) = store.delete_upstream(&name).await {
                debug!(server = %name, error = %format!("{error:#}"), "record delete after removal failed");
            }
        });
        true
    }

    /// Connect every eligible upstream through the startup scheduler.
    /// Lazy-loading upstreams with history are parked in `Sleeping`
    /// instead.
    pub async fn connect_all(&self) -> ConnectSummary {
        let mut eligible = Vec::new();
        for client in self.snapshot_clients() {
            let state_manager = client.state_manager();
            if !client.config().startup_mode.is_startable()
                || state_manager.is_auto_disabled()
                || state_manager.is_user_stopped()
                || client.is_connected()
                || client.is_connecting()
            {
                continue;
            }
            if client.is_lazy_eligible() {
                if client.get_state() == ConnectionState::Disconnected {
                    client.enter_sleep();
                }
                continue;
            }
            eligible.push(client);
        }

        let scheduler = ConnectionScheduler::new(
            self.settings.max_concurrent_connections,
            self.settings.max_connection_retries,
            self.settings.max_backoff(),
            self.settings.startup_deadline(),
        );
        scheduler.run(eligible).await
    }

    /// Parallel disconnects under one overall timeout; names every client
    /// that failed to yield in the error.
    pub async fn disconnect_all(&self) -> Result<()> {
        let clients = self.snapshot_clients();
        if clients.is_empty() {
            return Ok(());
        }

        let mut tasks = JoinSet::new();
        for client in clients.clone() {
            tasks.spawn(async move { client.disconnect().await });
        }

        let drained = tokio::time::timeout(self.settings.disconnect_timeout(), async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tasks.abort_all();
            let pending: Vec<String> = clients
                .iter()
                .filter(|c| c.get_state() != ConnectionState::Disconnected)
                .map(|c| c.name().to_string())
                .collect();
            if !pending.is_empty() {
                return Err(FleetError::DisconnectTimeout { servers: pending }.into());
            }
        }
        Ok(())
    }

    /// Tools of every connected upstream, attributed to their servers.
    pub async fn discover_tools(&self) -> Vec<ToolDescriptor> {
        let mut tools = Vec::new();
        for client in self.snapshot_clients() {
            if !client.is_connected() {
                continue;
            }
            match client.list_tools().await {
                Ok(mut found) => tools.append(&mut found),
                Err(error) => {
                    warn!(server = %client.name(), error = %format!("{error:#}"), "tool discovery failed");
                }
            }
        }
        tools.sort_by(|a, b| a.qualified_name().cmp(&b.qualified_name()));
        tools
    }

    /// The aggregate endpoint's view: live tools of connected upstreams
    /// plus cached tools of sleeping ones (their descriptors stay
    /// advertised so a call can wake them).
    pub async fn aggregated_tools(&self) -> Vec<ToolDescriptor> {
        let mut tools = Vec::new();
        for client in self.snapshot_clients() {
            if client.is_connected() {
                if let Ok(mut found) = client.list_tools().await {
                    tools.append(&mut found);
                }
            } else if client.get_state() == ConnectionState::Sleeping {
                tools.extend(client.cached_tool_descriptors());
            }
        }
        tools.sort_by(|a, b| a.qualified_name().cmp(&b.qualified_name()));
        tools
    }

    /// Route a `server:tool` call: resolve the client, reject disabled
    /// upstreams with a structured error, wake lazy-loading ones on
    /// demand, forward, and let call errors surface enriched but never
    /// retried.
    pub async fn call_tool(
        &self,
        qualified: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<CallToolResult> {
        let Some((server, tool)) = split_tool_name(qualified) else {
            return Err(FleetError::InvalidToolName(qualified.to_string()).into());
        };
        let client = self
            .get_client(server)
            .ok_or_else(|| FleetError::UnknownServer(server.to_string()))?;

        let config = client.config();
        let state_manager = client.state_manager();
        if state_manager.is_auto_disabled() || config.startup_mode == StartupMode::AutoDisabled {
            return Err(FleetError::ServerDisabled {
                server: server.to_string(),
                state: ServerState::AutoDisabled,
                reason: state_manager.auto_disable_reason(),
            }
            .into());
        }
        match config.startup_mode {
            StartupMode::Disabled => {
                return Err(FleetError::ServerDisabled {
                    server: server.to_string(),
                    state: ServerState::Disabled,
                    reason: None,
                }
                .into());
            }
            StartupMode::Quarantined => {
                return Err(FleetError::ServerDisabled {
                    server: server.to_string(),
                    state: ServerState::Quarantined,
                    reason: None,
                }
                .into());
            }
            _ => {}
        }

        if !client.is_connected() {
            let state = client.get_state();
            let wake = state == ConnectionState::Sleeping
                || (client.is_lazy_eligible() && state == ConnectionState::Disconnected);
            if !wake {
                return Err(FleetError::NotConnected {
                    server: server.to_string(),
                    state,
                    last_error: client.get_last_error(),
                }
                .into());
            }

            info!(server = %server, tool = %tool, "waking upstream for tool call");
            match client.connect().await {
                Ok(()) => {}
                Err(error)
                    if error
                        .downcast_ref::<FleetError>()
                        .is_some_and(|e| matches!(e, FleetError::AlreadyConnecting(_))) =>
                {
                    self.wait_until_ready(&client, config.connection_timeout())
                        .await?;
                }
                // The caller sees the real failure class, not a generic
                // "not connected".
                Err(error) => return Err(error),
            }
        }

        client.call_tool(tool, arguments).await
    }

    /// Disconnect-then-connect in the background; used by OAuth completion
    /// paths. A client that is already up (or coming up) is left alone.
    pub fn retry_connection(&self, name: &str) -> Result<()> {
        let client = self
            .get_client(name)
            .ok_or_else(|| FleetError::UnknownServer(name.to_string()))?;
        if client.is_connected() || client.is_connecting() {
            debug!(server = %name, "retry skipped, already up or connecting");
            return Ok(());
        }
        if self.is_shutting_down() {
            return Ok(());
        }
        tokio::spawn(async move {
            let _ = client.disconnect().await;
            if let Err(error) = client.connect().await {
                debug!(server = %client.name(), error = %format!("{error:#}"), "retry connect failed");
            }
        });
        Ok(())
    }

    /// Kick off the OAuth flow for one upstream and retry its connection.
    pub async fn start_manual_oauth(&self, name: &str) -> Result<()> {
        let client = self
            .get_client(name)
            .ok_or_else(|| FleetError::UnknownServer(name.to_string()))?;
        client.run_oauth_flow().await?;
        self.retry_connection(name)
    }

    pub fn get_client(&self, name: &str) -> Option<Arc<ManagedClient>> {
        read(&self.clients).get(name).cloned()
    }

    pub fn get_all_server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.clients).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn list_servers(&self) -> Vec<ServerStatus> {
        let mut statuses: Vec<ServerStatus> = self
            .snapshot_clients()
            .into_iter()
            .map(|client| {
                let config = client.config();
                let snapshot = client.get_connection_info();
                ServerStatus {
                    name: client.name().to_string(),
                    transport: config.transport.label().to_string(),
                    startup_mode: config.startup_mode,
                    state: snapshot.state,
                    tool_count: config.tool_count,
                    last_error: snapshot.last_error,
                    auto_disable_reason: snapshot.auto_disable_reason,
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn get_stats(&self) -> ManagerStats {
        let clients = self.snapshot_clients();
        let mut stats = ManagerStats {
            total_servers: clients.len(),
            connected: 0,
            connecting: 0,
            sleeping: 0,
            errored: 0,
            disabled: 0,
            auto_disabled: 0,
            total_tools: 0,
        };
        for client in clients {
            let config = client.config();
            match client.get_state() {
                ConnectionState::Ready => stats.connected += 1,
                ConnectionState::Connecting
                | ConnectionState::Authenticating
                | ConnectionState::Discovering => stats.connecting += 1,
                ConnectionState::Sleeping => stats.sleeping += 1,
                ConnectionState::Error => stats.errored += 1,
                ConnectionState::Disconnected => {}
            }
            if matches!(
                config.startup_mode,
                StartupMode::Disabled | StartupMode::Quarantined
            ) {
                stats.disabled += 1;
            }
            if client.state_manager().is_auto_disabled() {
                stats.auto_disabled += 1;
            }
            stats.total_tools += config.tool_count;
        }
        stats
    }

    /// Orderly teardown:
    /// 1. latch the shutdown flag (refuses new retries),
    /// 2. disconnect everything while transports are still live, so Docker
    ///    containers get removed and child process groups get reaped,
    /// 3. give Docker removals a bounded settle window,
    /// 4. stop and join the background monitors.
    ///
    /// Ancillary subsystems (index, store) are the caller's to close, last.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            anyhow::bail!("manager shutdown invoked twice");
        }

        let mut had_docker = false;
        for client in self.snapshot_clients() {
            if client.is_docker_backed().await {
                had_docker = true;
                break;
            }
        }

        let disconnect_result = self.disconnect_all().await;

        if had_docker {
            tokio::time::sleep(DOCKER_SETTLE_GRACE).await;
        }

        let tasks: Vec<MonitorTask> = std::mem::take(&mut *lock(&self.monitors));
        for task in &tasks {
            task.token.cancel();
        }
        for task in tasks {
            let _ = task.handle.await;
        }

        disconnect_result
    }

    pub(crate) fn register_monitor(&self, task: MonitorTask) {
        lock(&self.monitors).push(task);
    }

    /// Copy the client set under the read lock; never hold the lock across
    /// an await.
    pub(crate) fn snapshot_clients(&self) -> Vec<Arc<ManagedClient>> {
        read(&self.clients).values().cloned().collect()
    }

    fn wire_client(&self, client: &Arc<ManagedClient>) {
        let server = client.name().to_string();
        let weak = self.weak.clone();
        let state_change: StateChangeFn = Arc::new(move |old, new, snapshot| {
            if let Some(manager) = weak.upgrade() {
                manager.on_state_change(&server, old, new, snapshot);
            }
        });

        let weak = self.weak.clone();
        let auto_disable: AutoDisableFn = Arc::new(move |name, snapshot| {
            if let Some(manager) = weak.upgrade() {
                manager.on_auto_disable(name, snapshot);
            }
        });

        client.wire_callbacks(ClientCallbacks {
            state_change: Some(state_change),
            auto_disable: Some(auto_disable),
        });
    }

    fn on_state_change(
        &self,
        server: &str,
        old: ConnectionState,
        new: ConnectionState,
        snapshot: ConnectionSnapshot,
    ) {
        if new == ConnectionState::Ready {
            if let (Some(index), Some(client)) =
                (lock(&self.index).clone(), self.get_client(server))
            {
                index.upsert_server_tools(server, &client.cached_tool_descriptors());
            }
        }
        if let Some(bus) = lock(&self.event_bus).clone() {
            bus.publish(FleetEvent::StateChange {
                server: server.to_string(),
                old,
                new,
                snapshot,
            });
        }
    }

    fn on_auto_disable(&self, server: &str, snapshot: &ConnectionSnapshot) {
        warn!(
            server = %server,
            failures = snapshot.consecutive_failures,
            reason = %snapshot.auto_disable_reason.as_deref().unwrap_or("-"),
            "upstream auto-disabled"
        );
        if let Some(save) = lock(&self.config_save).clone() {
            save(server, StartupMode::AutoDisabled);
        }
        if let Some(callback) = lock(&self.external_auto_disable).clone() {
            callback(server, snapshot);
        }
        if let (Some(bus), Some(client)) = (lock(&self.event_bus).clone(), self.get_client(server))
        {
            let config = client.config();
            let snapshot = snapshot.clone();
            tokio::spawn(async move {
                let report = FailureReport::build(&config, &snapshot).await;
                bus.publish(FleetEvent::FailureReport(report));
            });
        }
    }

    async fn wait_until_ready(&self, client: &Arc<ManagedClient>, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if client.is_connected() {
                return Ok(());
            }
            if client.get_state() == ConnectionState::Error {
                return Err(anyhow!(
                    "upstream '{}' failed to wake: {}",
                    client.name(),
                    client.get_last_error().unwrap_or_default()
                ));
            }
            tokio::time::sleep(LAZY_WAKE_POLL).await;
        }
        Err(FleetError::NotConnected {
            server: client.name().to_string(),
            state: client.get_state(),
            last_error: client.get_last_error(),
        }
        .into())
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read<T>(lock: &StdRwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &StdRwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
