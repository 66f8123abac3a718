//! End-to-end scenarios against real child-process upstreams: a shell
//! script speaking newline-delimited JSON-RPC over stdio stands in for a
//! production MCP server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use fleet_config::{FleetSettings, UpstreamConfig, UpstreamTransport};
use fleet_core::ConnectionState;
use fleet_store::{FileStore, Store};
use fleet_supervisor::{Manager, ManagerConfig, MemoryIndex, NoopOAuthAgent};
use fleet_transport::DefaultTransportFactory;

fn write_mock_server(dir: &std::path::Path, marker: &str) -> Result<std::path::PathBuf> {
    let path = dir.join(format!("mock-mcp-{marker}.sh"));
    std::fs::write(
        &path,
        r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([^,}]*\).*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"mock","version":"0.1.0"}}}\n' "$id"
      ;;
    *\"notifications/initialized\"*)
      ;;
    *\"tools/list\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo_tool","description":"echo","inputSchema":{"type":"object","properties":{}}}]}}\n' "$id"
      ;;
    *\"tools/call\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id"
      ;;
  esac
done
"#,
    )?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&path)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms)?;
    }

    Ok(path)
}

fn stdio_upstream(name: &str, command: &str, args: Vec<String>) -> UpstreamConfig {
    let mut config = UpstreamConfig::new(
        name,
        UpstreamTransport::Stdio {
            command: command.to_string(),
            args,
            env: HashMap::new(),
            working_dir: None,
        },
    );
    config.connection_timeout_secs = Some(5);
    config
}

struct Fixture {
    manager: Arc<Manager>,
    store: Arc<FileStore>,
    index: Arc<MemoryIndex>,
    dir: tempfile::TempDir,
}

fn fixture(tune: impl FnOnce(&mut FleetSettings)) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = FleetSettings {
        data_dir: Some(dir.path().to_path_buf()),
        ..FleetSettings::default()
    };
    tune(&mut settings);

    let store = Arc::new(FileStore::open(dir.path()).unwrap());
    let index = Arc::new(MemoryIndex::new());
    let manager = Manager::new(ManagerConfig {
        settings,
        factory: Arc::new(DefaultTransportFactory),
        store: store.clone(),
        oauth: Arc::new(NoopOAuthAgent),
        index: Some(index.clone()),
    });
    Fixture {
        manager,
        store,
        index,
        dir,
    }
}

async fn count_processes_matching(marker: &str) -> usize {
    let output = tokio::process::Command::new("pgrep")
        .arg("-f")
        .arg(marker)
        .output()
        .await
        .expect("pgrep must be runnable");
    if !output.status.success() {
        return 0;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|l| !l.trim().is_empty())
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mixed_startup_connects_the_healthy_and_latches_the_broken() {
    let f = fixture(|settings| {
        settings.max_concurrent_connections = 2;
        settings.max_connection_retries = 2;
        settings.auto_disable_threshold = 2;
    });
    let script = write_mock_server(f.dir.path(), "mixed").unwrap();

    f.manager
        .add_server_config(stdio_upstream(
            "alpha",
            "sh",
            vec![script.to_string_lossy().into_owned()],
        ))
        .await
        .unwrap();
    f.manager
        .add_server_config(stdio_upstream("beta", "/bin/false", vec![]))
        .await
        .unwrap();
    let mut refused = UpstreamConfig::new(
        "gamma",
        UpstreamTransport::StreamableHttp {
            url: "http://127.0.0.1:1/mcp".to_string(),
            headers: HashMap::new(),
            allow_insecure: true,
        },
    );
    refused.connection_timeout_secs = Some(2);
    f.manager.add_server_config(refused).await.unwrap();

    let summary = f.manager.connect_all().await;
    assert_eq!(summary.total, 3);
    assert_eq!(summary.successful, 1);
    assert_eq!(summary.failed, 2);

    // The healthy upstream serves its tools through the aggregate view.
    let alpha = f.manager.get_client("alpha").unwrap();
    assert_eq!(alpha.get_state(), ConnectionState::Ready);
    let tools = f.manager.aggregated_tools().await;
    assert!(
        tools
            .iter()
            .any(|t| t.qualified_name() == "alpha:echo_tool"),
        "{tools:?}"
    );
    assert_eq!(f.index.server_tools("alpha").len(), 1);

    // Both broken upstreams are latched with persisted reasons.
    for name in ["beta", "gamma"] {
        let client = f.manager.get_client(name).unwrap();
        assert!(
            client.state_manager().is_auto_disabled(),
            "{name} should be auto-disabled"
        );
        let record = f.store.get_upstream(name).await.unwrap().unwrap();
        assert_eq!(record.server_state, fleet_core::ServerState::AutoDisabled);
        assert!(
            record
                .auto_disable_reason
                .as_deref()
                .unwrap()
                .contains("consecutive failures")
        );
    }

    // Exactly one failure-log line per latched upstream.
    let log_lines = f.store.failure_log().tail(10).await.unwrap();
    assert_eq!(log_lines.len(), 2, "{log_lines:?}");

    f.manager.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tool_calls_round_trip_through_a_real_child() {
    let f = fixture(|_| {});
    let script = write_mock_server(f.dir.path(), "roundtrip").unwrap();

    f.manager
        .add_server(stdio_upstream(
            "mock",
            "sh",
            vec![script.to_string_lossy().into_owned()],
        ))
        .await
        .unwrap();

    let result = f.manager.call_tool("mock:echo_tool", None).await.unwrap();
    assert_eq!(
        result.content[0].as_text().map(|t| t.text.as_str()),
        Some("pong")
    );

    // History lands in the store with the auto-disable fields present.
    let record = f.store.get_upstream("mock").await.unwrap().unwrap();
    assert!(record.ever_connected);
    assert_eq!(record.tool_count, 1);
    assert_eq!(record.server_state, fleet_core::ServerState::Active);

    f.manager.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_all_reaps_child_process_groups() {
    let f = fixture(|_| {});
    let marker = format!("reap-{}", std::process::id());
    let script = write_mock_server(f.dir.path(), &marker).unwrap();

    f.manager
        .add_server(stdio_upstream(
            "mock",
            "sh",
            vec![script.to_string_lossy().into_owned()],
        ))
        .await
        .unwrap();
    assert!(f.manager.get_client("mock").unwrap().is_connected());
    assert!(count_processes_matching(&marker).await >= 1);

    f.manager.disconnect_all().await.unwrap();

    // The whole process group is gone, not just detached.
    let mut remaining = usize::MAX;
    for _ in 0..40 {
        remaining = count_processes_matching(&marker).await;
        if remaining == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(remaining, 0, "mock upstream process still alive");

    f.manager.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lazy_upstream_wakes_through_a_real_child() {
    let f = fixture(|_| {});
    let script = write_mock_server(f.dir.path(), "lazy").unwrap();

    let mut lazy = stdio_upstream("lazy", "sh", vec![script.to_string_lossy().into_owned()]);
    lazy.startup_mode = fleet_config::StartupMode::LazyLoading;
    lazy.ever_connected = true;
    lazy.tool_count = 1;
    f.manager.add_server_config(lazy).await.unwrap();

    let summary = f.manager.connect_all().await;
    assert_eq!(summary.total, 0);
    let client = f.manager.get_client("lazy").unwrap();
    assert_eq!(client.get_state(), ConnectionState::Sleeping);

    let result = f.manager.call_tool("lazy:echo_tool", None).await.unwrap();
    assert_eq!(
        result.content[0].as_text().map(|t| t.text.as_str()),
        Some("pong")
    );
    assert_eq!(client.get_state(), ConnectionState::Ready);

    f.manager.shutdown().await.unwrap();
}
