//! Command handlers behind the CLI.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use fleet_config::{FleetRegistry, FleetSettings};
use fleet_core::split_tool_name;
use fleet_store::FileStore;
use fleet_supervisor::{Manager, ManagerConfig, MemoryIndex, NoopOAuthAgent};
use fleet_transport::DefaultTransportFactory;

use crate::router::FleetRouter;

/// Assemble the manager from settings + registry and register every
/// configured upstream (without connecting).
pub(crate) async fn build_manager(config_override: Option<PathBuf>) -> Result<Arc<Manager>> {
    let settings = FleetSettings::load()?;
    let registry_path = match config_override {
        Some(path) => path,
        None => FleetSettings::registry_path()?,
    };
    let registry = if registry_path.exists() {
        FleetRegistry::load_from_path(&registry_path)?
    } else {
        warn!(path = %registry_path.display(), "no fleet registry found, starting empty");
        FleetRegistry::default()
    };

    let store = Arc::new(FileStore::open(&settings.data_dir())?);
    let manager = Manager::new(ManagerConfig {
        settings,
        factory: Arc::new(DefaultTransportFactory),
        store,
        oauth: Arc::new(NoopOAuthAgent),
        index: Some(Arc::new(MemoryIndex::new())),
    });

    // Auto-disable writes back into the registry file so the latch
    // survives restarts.
    let hook_path = registry_path.clone();
    manager.set_config_save_hook(Arc::new(move |server, mode| {
        match FleetRegistry::load_from_path(&hook_path) {
            Ok(mut registry) => {
                if registry.set_startup_mode(server, mode) {
                    if let Err(error) = registry.save_to_path(&hook_path) {
                        warn!(server = %server, error = %format!("{error:#}"), "failed to save registry");
                    }
                }
            }
            Err(error) => {
                warn!(server = %server, error = %format!("{error:#}"), "failed to reload registry");
            }
        }
    }));

    for server in registry.servers {
        manager.add_server_config(server).await?;
    }
    Ok(manager)
}

/// Connect the fleet, then serve its union over stdio until the client
/// disconnects or the process is interrupted.
pub(crate) async fn handle_serve(config: Option<PathBuf>) -> Result<()> {
    let manager = build_manager(config).await?;

    let summary = manager.connect_all().await;
    info!(
        total = summary.total,
        successful = summary.successful,
        failed = summary.failed,
        "fleet startup complete"
    );

    let router = FleetRouter::new(manager.clone());
    let running = rmcp::service::serve_directly(
        router,
        (tokio::io::stdin(), tokio::io::stdout()),
        None,
    );

    tokio::select! {
        result = running.waiting() => {
            if let Err(error) = result {
                warn!(error = %error, "MCP endpoint stopped with error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }

    manager.shutdown().await
}

pub(crate) async fn handle_check(config: Option<PathBuf>, json: bool) -> Result<()> {
    let manager = build_manager(config).await?;
    let summary = manager.connect_all().await;
    let servers = manager.list_servers();

    if json {
        let payload = serde_json::json!({
            "summary": summary,
            "servers": servers,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else if servers.is_empty() {
        println!("no servers configured");
    } else {
        for server in &servers {
            let detail = server
                .auto_disable_reason
                .as_deref()
                .or(server.last_error.as_deref())
                .unwrap_or("");
            println!(
                "{:<20} {:<16} {:<14} tools={:<4} {}",
                server.name, server.transport, server.state, server.tool_count, detail
            );
        }
        println!(
            "\n{}/{} connected ({} failed, {} retried) in {:.1}s",
            summary.successful,
            summary.total,
            summary.failed,
            summary.retried,
            summary.duration.as_secs_f64()
        );
    }

    manager.shutdown().await
}

pub(crate) async fn handle_tools(config: Option<PathBuf>, json: bool) -> Result<()> {
    let manager = build_manager(config).await?;
    manager.connect_all().await;
    let tools = manager.aggregated_tools().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&tools)?);
    } else if tools.is_empty() {
        println!("no tools discovered");
    } else {
        for tool in &tools {
            println!("{:<40} {}", tool.qualified_name(), tool.description);
        }
    }

    manager.shutdown().await
}

pub(crate) async fn handle_call(
    config: Option<PathBuf>,
    tool: String,
    args: String,
) -> Result<()> {
    let arguments = serde_json::from_str::<serde_json::Value>(&args)
        .context("--args must be a JSON object")?
        .as_object()
        .cloned()
        .context("--args must be a JSON object")?;

    let manager = build_manager(config).await?;

    // One-shot: bring up only the target server.
    if let Some((server, _)) = split_tool_name(&tool) {
        if let Some(client) = manager.get_client(server) {
            if let Err(error) = client.connect().await {
                warn!(server = %server, error = %format!("{error:#}"), "connect failed");
            }
        }
    }

    let call_result = manager.call_tool(&tool, Some(arguments)).await;
    let shutdown_result = manager.shutdown().await;

    let result = call_result?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    shutdown_result
}
