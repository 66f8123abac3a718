//! One upstream: transport + state machine + background health loop.

use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use chrono::Utc;
use rmcp::model::{CallToolRequestParams, CallToolResult};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fleet_config::{StartupMode, UpstreamConfig};
use fleet_core::{
    ConnectionSnapshot, ConnectionState, ErrorKind, FleetError, ServerState, ToolDescriptor,
    tool_list_digest,
};
use fleet_store::{FailureLog, FailureLogEntry, Store, TokenRecord, UpstreamRecord};
use fleet_transport::{DEFAULT_CLOSE_GRACE, Transport, TransportFactory};

use crate::events::suggestions_for;
use crate::oauth::OAuthAgent;
use crate::state::{StateChangeFn, StateManager};

/// Invoked when a client latches auto-disable, after the record and failure
/// log are written.
pub type AutoDisableFn = Arc<dyn Fn(&str, &ConnectionSnapshot) + Send + Sync>;

/// Shared collaborators and tunables handed to every client.
#[derive(Clone)]
pub struct ClientContext {
    pub factory: Arc<dyn TransportFactory>,
    pub store: Arc<dyn Store>,
    pub oauth: Arc<dyn OAuthAgent>,
    pub failure_log: FailureLog,
    pub default_auto_disable_threshold: u32,
    pub max_backoff: Duration,
    pub health_interval: Duration,
    pub tool_cache_ttl: Duration,
}

/// Callback bundle wired by the manager when a client is registered.
#[derive(Clone, Default)]
pub struct ClientCallbacks {
    pub state_change: Option<StateChangeFn>,
    pub auto_disable: Option<AutoDisableFn>,
}

struct ToolCache {
    tools: Vec<ToolDescriptor>,
    digest: String,
    fetched_at: Instant,
}

struct HealthTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ManagedClient {
    name: String,
    /// Self-reference handed to the health loop so the loop never keeps the
    /// client alive on its own.
    weak: Weak<ManagedClient>,
    config: RwLock<UpstreamConfig>,
    state: Arc<StateManager>,
    factory: Arc<dyn TransportFactory>,
    store: Arc<dyn Store>,
    oauth: Arc<dyn OAuthAgent>,
    failure_log: FailureLog,
    transport: AsyncMutex<Option<Transport>>,
    /// Single-flight gate: at most one connect in flight per upstream, no
    /// matter how many retry paths dispatch one.
    connect_lock: AsyncMutex<()>,
    tool_cache: StdMutex<Option<ToolCache>>,
    tool_cache_ttl: Duration,
    health_interval: Duration,
    health_task: StdMutex<Option<HealthTask>>,
    auto_disable_cb: StdMutex<Option<AutoDisableFn>>,
}

impl ManagedClient {
    pub fn new(config: UpstreamConfig, ctx: &ClientContext) -> Arc<Self> {
        let threshold = if config.auto_disable_threshold > 0 {
            config.auto_disable_threshold
        } else {
            ctx.default_auto_disable_threshold
        };
        let state = Arc::new(StateManager::new(&config.name, threshold, ctx.max_backoff));
        if config.startup_mode == StartupMode::AutoDisabled {
            state.restore_auto_disabled(None);
        }

        Arc::new_cyclic(|weak| Self {
            name: config.name.clone(),
            weak: weak.clone(),
            config: RwLock::new(config),
            state,
            factory: ctx.factory.clone(),
            store: ctx.store.clone(),
            oauth: ctx.oauth.clone(),
            failure_log: ctx.failure_log.clone(),
            transport: AsyncMutex::new(None),
            connect_lock: AsyncMutex::new(()),
            tool_cache: StdMutex::new(None),
            tool_cache_ttl: ctx.tool_cache_ttl,
            health_interval: ctx.health_interval,
            health_task: StdMutex::new(None),
            auto_disable_cb: StdMutex::new(None),
        })
    }

    pub fn wire_callbacks(&self, callbacks: ClientCallbacks) {
        if let Some(state_change) = callbacks.state_change {
            self.state.set_callback(state_change);
        }
        *lock_std(&self.auto_disable_cb) = callbacks.auto_disable;
    }

    /// Merge persisted history into the live config and restore any latch.
    pub fn restore_from_record(&self, record: &UpstreamRecord) {
        {
            let mut config = write_std(&self.config);
            config.ever_connected |= record.ever_connected;
            if config.last_successful_connection.is_none() {
                config.last_successful_connection = record.last_successful_connection;
            }
            if config.tool_count == 0 {
                config.tool_count = record.tool_count;
            }
        }
        if record.server_state == ServerState::AutoDisabled {
            write_std(&self.config).startup_mode = StartupMode::AutoDisabled;
            self.state
                .restore_auto_disabled(record.auto_disable_reason.clone());
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> UpstreamConfig {
        read_std(&self.config).clone()
    }

    /// Replace the config without touching the connection (used when a
    /// re-added config is endpoint-identical). Connection history earned by
    /// the live client is carried over.
    pub fn swap_config(&self, mut config: UpstreamConfig) {
        let mut current = write_std(&self.config);
        config.ever_connected |= current.ever_connected;
        if config.last_successful_connection.is_none() {
            config.last_successful_connection = current.last_successful_connection;
        }
        if config.tool_count == 0 {
            config.tool_count = current.tool_count;
        }
        *current = config;
    }

    pub fn state_manager(&self) -> &Arc<StateManager> {
        &self.state
    }

    pub fn get_state(&self) -> ConnectionState {
        self.state.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state.state().is_ready()
    }

    pub fn is_connecting(&self) -> bool {
        self.state.state().is_connecting() || self.connect_lock.try_lock().is_err()
    }

    pub fn get_last_error(&self) -> Option<String> {
        self.state.last_error()
    }

    pub fn get_connection_info(&self) -> ConnectionSnapshot {
        self.state.snapshot()
    }

    /// Lazy-loading rule: a previously known upstream with tools sleeps at
    /// startup instead of connecting.
    pub fn is_lazy_eligible(&self) -> bool {
        let config = read_std(&self.config);
        config.startup_mode == StartupMode::LazyLoading
            && config.ever_connected
            && config.tool_count > 0
    }

    /// Park the client in `Sleeping` (startup of a lazy-loading upstream).
    pub fn enter_sleep(&self) {
        if let Err(error) = self.state.transition(ConnectionState::Sleeping, None) {
            debug!(server = %self.name, error = %error, "could not enter sleep");
        }
    }

    /// Connect this upstream: open the transport, handshake, discover
    /// tools, persist the refreshed record, start the health loop.
    ///
    /// Single-flight: a second call while one is in flight returns
    /// `AlreadyConnecting` immediately.
    pub async fn connect(&self) -> Result<()> {
        let _guard = match self.connect_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => return Err(FleetError::AlreadyConnecting(self.name.clone()).into()),
        };

        if self.state.state().is_ready() {
            return Ok(());
        }
        if self.state.is_auto_disabled() {
            return Err(FleetError::ServerDisabled {
                server: self.name.clone(),
                state: ServerState::AutoDisabled,
                reason: self.state.auto_disable_reason(),
            }
            .into());
        }
        if self.state.is_user_stopped() {
            anyhow::bail!("upstream '{}' was stopped by the operator", self.name);
        }

        self.state.transition(ConnectionState::Connecting, None)?;

        let config = self.config();
        let timeout = config.connection_timeout();

        if self.oauth.should_use_oauth(&config) {
            self.state.transition(ConnectionState::Authenticating, None)?;
            let token = match self
                .store
                .get_token(&config.name, config.transport.url())
                .await
            {
                Ok(token) => token,
                Err(error) => {
                    return Err(self.fail_connect(format!("token lookup failed: {error:#}")).await);
                }
            };
            let usable = token.as_ref().is_some_and(TokenRecord::is_usable);
            if !usable {
                if let Err(error) = self.oauth.start_flow(&config).await {
                    return Err(self.fail_connect(format!("{error:#}")).await);
                }
            }
        }

        let transport = match tokio::time::timeout(timeout, self.factory.connect(&config)).await {
            Ok(Ok(transport)) => transport,
            Ok(Err(error)) => return Err(self.fail_connect(error.to_string()).await),
            Err(_) => {
                return Err(self
                    .fail_connect(format!("connect timed out after {}s", timeout.as_secs()))
                    .await);
            }
        };

        if let Err(error) = self.state.transition(ConnectionState::Discovering, None) {
            // A racing disconnect moved the state; never leak the channel.
            transport.close(DEFAULT_CLOSE_GRACE).await;
            return Err(error);
        }

        let tools = match tokio::time::timeout(timeout, transport.service().list_tools(None)).await
        {
            Ok(Ok(result)) => result.tools,
            Ok(Err(error)) => {
                transport.close(DEFAULT_CLOSE_GRACE).await;
                return Err(self.fail_connect(format!("tools/list failed: {error}")).await);
            }
            Err(_) => {
                transport.close(DEFAULT_CLOSE_GRACE).await;
                return Err(self
                    .fail_connect(format!("tools/list timed out after {}s", timeout.as_secs()))
                    .await);
            }
        };

        let descriptors: Vec<ToolDescriptor> = tools
            .iter()
            .map(|tool| descriptor_from_tool(&self.name, tool))
            .collect();

        // A disconnect can race a connect; never resurrect a stopped client.
        if self.state.state() != ConnectionState::Discovering {
            transport.close(DEFAULT_CLOSE_GRACE).await;
            anyhow::bail!("upstream '{}' was disconnected during connect", self.name);
        }

        *self.transport.lock().await = Some(transport);
        self.store_tool_cache(descriptors.clone());
        {
            let mut config = write_std(&self.config);
            config.ever_connected = true;
            config.last_successful_connection = Some(Utc::now());
            config.tool_count = descriptors.len() as u64;
        }

        if let Err(error) = self.state.transition(ConnectionState::Ready, None) {
            if let Some(transport) = self.transport.lock().await.take() {
                transport.close(DEFAULT_CLOSE_GRACE).await;
            }
            return Err(error);
        }
        info!(server = %self.name, tools = descriptors.len(), "upstream connected");

        if let Err(error) = self.persist_record().await {
            warn!(server = %self.name, error = %format!("{error:#}"), "failed to persist upstream record");
        }

        if read_std(&self.config).health_check {
            self.start_health_loop();
        }
        Ok(())
    }

    /// Stop monitoring, drop the transport (tearing down the child process
    /// group or container), and return to `Disconnected`. Failure counters
    /// survive for reports.
    pub async fn disconnect(&self) -> Result<()> {
        self.stop_health_loop().await;
        let _ = self.state.transition(ConnectionState::Disconnected, None);
        if let Some(transport) = self.transport.lock().await.take() {
            transport.close(DEFAULT_CLOSE_GRACE).await;
        }
        Ok(())
    }

    pub async fn is_docker_backed(&self) -> bool {
        self.transport
            .lock()
            .await
            .as_ref()
            .is_some_and(Transport::is_docker_backed)
    }

    /// Forward one tool call. Fails fast when not `Ready`; never retries.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> Result<CallToolResult> {
        let state = self.state.state();
        if !state.is_ready() {
            return Err(FleetError::NotConnected {
                server: self.name.clone(),
                state,
                last_error: self.state.last_error(),
            }
            .into());
        }

        if let Some(args) = arguments.as_ref() {
            self.check_required_arguments(tool, args)?;
        }

        let guard = self.transport.lock().await;
        let Some(transport) = guard.as_ref() else {
            return Err(FleetError::NotConnected {
                server: self.name.clone(),
                state: self.state.state(),
                last_error: self.state.last_error(),
            }
            .into());
        };

        match transport
            .service()
            .call_tool({
                let mut params = CallToolRequestParams::new(tool.to_string());
                params.arguments = arguments;
                params
            })
            .await
        {
            Ok(result) => Ok(result),
            Err(error) => Err(self.enrich_call_error(tool, &error.to_string())),
        }
    }

    /// Tool descriptors with a TTL'd cache keyed by a digest over
    /// names+descriptions+schemas. Stale data is still served while the
    /// upstream is asleep or broken; it is refreshed on every Ready
    /// re-entry.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        if let Some(tools) = self.cached_tools(Some(self.tool_cache_ttl)) {
            return Ok(tools);
        }

        if !self.state.state().is_ready() {
            if let Some(tools) = self.cached_tools(None) {
                return Ok(tools);
            }
            return Err(FleetError::NotConnected {
                server: self.name.clone(),
                state: self.state.state(),
                last_error: self.state.last_error(),
            }
            .into());
        }

        let guard = self.transport.lock().await;
        let Some(transport) = guard.as_ref() else {
            return Err(FleetError::NotConnected {
                server: self.name.clone(),
                state: self.state.state(),
                last_error: self.state.last_error(),
            }
            .into());
        };
        let result = transport
            .service()
            .list_tools(None)
            .await
            .map_err(|error| anyhow!("tools/list for '{}' failed: {error}", self.name))?;
        drop(guard);

        let descriptors: Vec<ToolDescriptor> = result
            .tools
            .iter()
            .map(|tool| descriptor_from_tool(&self.name, tool))
            .collect();
        self.store_tool_cache(descriptors.clone());
        Ok(descriptors)
    }

    /// Cached descriptors regardless of freshness; empty when never listed.
    pub fn cached_tool_descriptors(&self) -> Vec<ToolDescriptor> {
        self.cached_tools(None).unwrap_or_default()
    }

    /// Run the OAuth flow for this upstream, regardless of current state.
    pub async fn run_oauth_flow(&self) -> Result<()> {
        let config = self.config();
        self.oauth.start_flow(&config).await
    }

    pub async fn persist_record(&self) -> Result<()> {
        let record = self.build_record();
        self.store.save_upstream(&record).await
    }

    fn build_record(&self) -> UpstreamRecord {
        let config = self.config();
        let snapshot = self.state.snapshot();
        let mut record = UpstreamRecord::from_config(&config);
        if snapshot.auto_disabled {
            record.server_state = ServerState::AutoDisabled;
            record.auto_disable_reason = snapshot.auto_disable_reason;
        }
        record.auto_disable_threshold = snapshot.auto_disable_threshold;
        record
    }

    /// Record a failed connect and handle a freshly latched auto-disable:
    /// flip the startup mode, persist, append the failure log, and notify.
    async fn fail_connect(&self, message: String) -> anyhow::Error {
        warn!(server = %self.name, error = %message, "connect failed");
        let latched = self.state.record_connect_failure(&message);
        if latched {
            self.handle_auto_disable().await;
        }
        let kind = self.state.last_error_kind().unwrap_or(ErrorKind::Unknown);
        anyhow!("failed to connect to '{}' ({kind}): {message}", self.name)
    }

    async fn handle_auto_disable(&self) {
        write_std(&self.config).startup_mode = StartupMode::AutoDisabled;
        let snapshot = self.state.snapshot();
        let config = self.config();

        if let Err(error) = self.persist_record().await {
            warn!(server = %self.name, error = %format!("{error:#}"), "failed to persist auto-disable");
        }

        let entry = FailureLogEntry {
            timestamp: Utc::now(),
            server: self.name.clone(),
            error_kind: snapshot.last_error_kind.unwrap_or(ErrorKind::Unknown),
            consecutive_failures: snapshot.consecutive_failures,
            first_failure_at: snapshot.first_attempt_at,
            last_error: snapshot.last_error.clone().unwrap_or_default(),
            suggestions: suggestions_for(&config, &snapshot),
        };
        if let Err(error) = self.failure_log.append(&entry).await {
            warn!(server = %self.name, error = %format!("{error:#}"), "failed to append failure log");
        }

        let callback = lock_std(&self.auto_disable_cb).clone();
        if let Some(callback) = callback {
            callback(&self.name, &snapshot);
        }
    }

    /// Structural argument check: the advertised schema's `required` keys
    /// must be present. Anything deeper is left to the upstream.
    fn check_required_arguments(
        &self,
        tool: &str,
        args: &serde_json::Map<String, Value>,
    ) -> Result<()> {
        let Some(descriptor) = self
            .cached_tool_descriptors()
            .into_iter()
            .find(|d| d.name == tool)
        else {
            return Ok(());
        };
        let Some(required) = descriptor.params_schema.get("required").and_then(Value::as_array)
        else {
            return Ok(());
        };
        let missing: Vec<&str> = required
            .iter()
            .filter_map(Value::as_str)
            .filter(|key| !args.contains_key(*key))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            anyhow::bail!(
                "tool '{}' on '{}' requires missing argument(s): {}",
                tool,
                self.name,
                missing.join(", ")
            )
        }
    }

    /// Classify an upstream call error and wrap it with remediation text
    /// that names the server and tool.
    fn enrich_call_error(&self, tool: &str, message: &str) -> anyhow::Error {
        let kind = ErrorKind::classify(message);
        let hint = match kind {
            ErrorKind::OauthRequired | ErrorKind::OauthToken => {
                format!("authorize server '{}' and retry", self.name)
            }
            ErrorKind::Permission => format!(
                "the credentials for '{}' lack the scope needed by '{tool}'",
                self.name
            ),
            ErrorKind::RateLimit => format!(
                "server '{}' is rate limiting; back off before calling '{tool}' again",
                self.name
            ),
            ErrorKind::Network => format!(
                "server '{}' became unreachable while calling '{tool}'",
                self.name
            ),
            ErrorKind::UnknownTool => format!(
                "tool '{tool}' is not advertised by server '{}'; refresh the tool list",
                self.name
            ),
            _ => format!("call '{}:{tool}' failed upstream", self.name),
        };
        anyhow!("{message} ({kind}; {hint})")
    }

    fn cached_tools(&self, max_age: Option<Duration>) -> Option<Vec<ToolDescriptor>> {
        let cache = lock_std(&self.tool_cache);
        let cache = cache.as_ref()?;
        if let Some(max_age) = max_age {
            if cache.fetched_at.elapsed() >= max_age {
                return None;
            }
        }
        Some(cache.tools.clone())
    }

    fn store_tool_cache(&self, tools: Vec<ToolDescriptor>) {
        let digest = tool_list_digest(&tools);
        let mut cache = lock_std(&self.tool_cache);
        if let Some(previous) = cache.as_ref() {
            if previous.digest != digest {
                debug!(server = %self.name, "tool list changed since last discovery");
            }
        }
        *cache = Some(ToolCache {
            tools,
            digest,
            fetched_at: Instant::now(),
        });
    }

    fn start_health_loop(&self) {
        let mut guard = lock_std(&self.health_task);
        if guard.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let weak = self.weak.clone();
        let loop_token = token.clone();
        let interval = self.health_interval;
        let handle = tokio::spawn(async move {
            health_loop(weak, loop_token, interval).await;
        });
        *guard = Some(HealthTask { token, handle });
    }

    async fn stop_health_loop(&self) {
        let task = lock_std(&self.health_task).take();
        if let Some(task) = task {
            task.token.cancel();
            let _ = task.handle.await;
        }
    }
}

/// Periodic per-client health tick: when the client sits in `Error` and its
/// backoff window has elapsed, dispatch a reconnect (the single-flight lock
/// dedupes against every other retry source). Ends on cancellation or when
/// the client is dropped.
async fn health_loop(weak: Weak<ManagedClient>, token: CancellationToken, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // interval fires immediately once; consume that tick.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(client) = weak.upgrade() else { break };
        if client.state.state() == ConnectionState::Error
            && client.state.should_retry()
            && !client.is_connecting()
        {
            debug!(server = %client.name(), "health loop dispatching reconnect");
            tokio::spawn(async move {
                if let Err(error) = client.connect().await {
                    debug!(error = %format!("{error:#}"), "health reconnect failed");
                }
            });
        }
    }
}

/// Convert an rmcp tool into a descriptor via its serialized form, which is
/// stable across SDK field additions.
fn descriptor_from_tool(server: &str, tool: &rmcp::model::Tool) -> ToolDescriptor {
    let value = serde_json::to_value(tool).unwrap_or(Value::Null);
    let name = value
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| tool.name.to_string());
    let description = value
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let schema = value
        .get("inputSchema")
        .cloned()
        .or_else(|| value.get("input_schema").cloned())
        .unwrap_or_else(|| serde_json::json!({ "type": "object", "properties": {} }));
    ToolDescriptor::new(server, &name, &description, schema)
}

fn lock_std<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read_std<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_std<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
