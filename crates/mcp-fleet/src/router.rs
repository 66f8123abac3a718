//! The aggregate MCP endpoint: one `ServerHandler` routing `server:tool`
//! calls through the manager.

use std::sync::Arc;

use rmcp::model::{
    CallToolRequestParam, CallToolResult, ListToolsResult, PaginatedRequestParam,
    ServerCapabilities, ServerInfo, Tool,
};
use rmcp::service::RequestContext;
use rmcp::{ErrorData as McpError, RoleServer, ServerHandler};
use serde_json::json;

use fleet_core::{FleetError, ToolDescriptor};
use fleet_supervisor::Manager;

#[derive(Clone)]
pub struct FleetRouter {
    manager: Arc<Manager>,
}

impl FleetRouter {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self { manager }
    }
}

fn to_rmcp_tool(descriptor: &ToolDescriptor) -> Option<Tool> {
    serde_json::from_value(json!({
        "name": descriptor.qualified_name(),
        "description": descriptor.description,
        "inputSchema": descriptor.params_schema,
    }))
    .ok()
}

impl ServerHandler for FleetRouter {
    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        let tools: Vec<Tool> = self
            .manager
            .aggregated_tools()
            .await
            .iter()
            .filter_map(to_rmcp_tool)
            .collect();
        Ok(ListToolsResult::with_all_items(tools))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        match self
            .manager
            .call_tool(request.name.as_ref(), request.arguments)
            .await
        {
            Ok(result) => Ok(result),
            Err(error) => match error.downcast_ref::<FleetError>() {
                Some(FleetError::InvalidToolName(_) | FleetError::UnknownServer(_)) => {
                    Err(McpError::invalid_params(format!("{error:#}"), None))
                }
                _ => Err(McpError::internal_error(format!("{error:#}"), None)),
            },
        }
    }

    fn get_info(&self) -> ServerInfo {
        let mut info = ServerInfo::default();
        info.server_info.name = "mcp-fleet".to_string();
        info.server_info.version = env!("CARGO_PKG_VERSION").to_string();
        info.capabilities = ServerCapabilities::builder().enable_tools().build();
        info
    }
}
