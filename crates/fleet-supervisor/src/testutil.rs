//! Shared test helpers: in-process MCP upstreams and scripted factories.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, ListToolsResult, PaginatedRequestParam,
    ServerCapabilities, ServerInfo, Tool,
};
use rmcp::service::{RequestContext, ServiceExt};
use rmcp::{ErrorData as McpError, RoleServer, ServerHandler};
use serde_json::json;
use tokio::sync::Notify;

use fleet_config::{UpstreamConfig, UpstreamTransport};
use fleet_store::FileStore;
use fleet_transport::{Transport, TransportError, TransportFactory};

use crate::client::ClientContext;
use crate::oauth::NoopOAuthAgent;

/// Build an rmcp tool from JSON so test code survives SDK field additions.
pub fn tool(name: &str, description: &str, schema: serde_json::Value) -> Tool {
    serde_json::from_value(json!({
        "name": name,
        "description": description,
        "inputSchema": schema,
    }))
    .expect("test tool must deserialize")
}

pub fn default_tools() -> Vec<Tool> {
    vec![
        tool("ping", "Reply with pong", json!({"type": "object", "properties": {}})),
        tool(
            "read_file",
            "Read a file",
            json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"],
            }),
        ),
    ]
}

/// Minimal MCP server used as the far end of in-process transports.
#[derive(Clone)]
pub struct EchoUpstream {
    pub tools: Vec<Tool>,
}

impl ServerHandler for EchoUpstream {
    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult::with_all_items(self.tools.clone()))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        if !self.tools.iter().any(|t| t.name == request.name) {
            return Err(McpError::invalid_params(
                format!("unknown tool: {}", request.name),
                None,
            ));
        }
        Ok(CallToolResult::success(vec![Content::text("pong")]))
    }

    fn get_info(&self) -> ServerInfo {
        let mut info = ServerInfo::default();
        info.server_info.name = "echo-upstream".to_string();
        info.capabilities = ServerCapabilities::builder().enable_tools().build();
        info
    }
}

/// Factory producing in-process transports against an [`EchoUpstream`].
pub struct InProcessFactory {
    pub tools: Vec<Tool>,
    pub connects: AtomicUsize,
}

impl InProcessFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tools: default_tools(),
            connects: AtomicUsize::new(0),
        })
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportFactory for InProcessFactory {
    async fn connect(&self, _config: &UpstreamConfig) -> Result<Transport, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        connect_in_process(EchoUpstream {
            tools: self.tools.clone(),
        })
        .await
    }
}

/// Open a duplex pair, serve `handler` on one end, handshake a client on
/// the other.
pub async fn connect_in_process(handler: EchoUpstream) -> Result<Transport, TransportError> {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let (server_read, server_write) = tokio::io::split(server_io);
    tokio::spawn(async move {
        let running = rmcp::service::serve_directly(handler, (server_read, server_write), None);
        let _ = running.waiting().await;
    });

    let (client_read, client_write) = tokio::io::split(client_io);
    let service = ()
        .serve((client_read, client_write))
        .await
        .map_err(|e| TransportError::Handshake(e.to_string()))?;
    Ok(Transport::in_process(service))
}

/// Factory that always fails with a fixed message, recording the order of
/// attempted servers.
pub struct FailingFactory {
    pub message: String,
    pub connects: AtomicUsize,
    pub order: std::sync::Mutex<Vec<String>>,
}

impl FailingFactory {
    pub fn new(message: &str) -> Arc<Self> {
        Arc::new(Self {
            message: message.to_string(),
            connects: AtomicUsize::new(0),
            order: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn attempt_order(&self) -> Vec<String> {
        self.order.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl TransportFactory for FailingFactory {
    async fn connect(&self, config: &UpstreamConfig) -> Result<Transport, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut order) = self.order.lock() {
            order.push(config.name.clone());
        }
        Err(TransportError::Handshake(self.message.clone()))
    }
}

/// Factory that parks in `connect` until released, to exercise
/// single-flight behavior.
pub struct BlockingFactory {
    pub entered: Notify,
    pub release: Notify,
}

impl BlockingFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entered: Notify::new(),
            release: Notify::new(),
        })
    }
}

#[async_trait]
impl TransportFactory for BlockingFactory {
    async fn connect(&self, _config: &UpstreamConfig) -> Result<Transport, TransportError> {
        self.entered.notify_one();
        self.release.notified().await;
        connect_in_process(EchoUpstream {
            tools: default_tools(),
        })
        .await
    }
}

pub fn stdio_config(name: &str) -> UpstreamConfig {
    UpstreamConfig::new(
        name,
        UpstreamTransport::Stdio {
            command: "true".to_string(),
            args: vec![],
            env: HashMap::new(),
            working_dir: None,
        },
    )
}

/// A [`ClientContext`] against a temp-dir store with fast timers.
pub fn test_context(
    dir: &std::path::Path,
    factory: Arc<dyn TransportFactory>,
) -> (ClientContext, Arc<FileStore>) {
    let store = Arc::new(FileStore::open(dir).expect("test store"));
    let failure_log = store.failure_log();
    (
        ClientContext {
            factory,
            store: store.clone(),
            oauth: Arc::new(NoopOAuthAgent),
            failure_log,
            default_auto_disable_threshold: 3,
            max_backoff: Duration::from_secs(300),
            health_interval: Duration::from_secs(60),
            tool_cache_ttl: Duration::from_secs(300),
        },
        store,
    )
}
