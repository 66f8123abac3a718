use super::*;
use std::collections::HashMap;

fn stdio_config(name: &str) -> UpstreamConfig {
    UpstreamConfig::new(
        name,
        UpstreamTransport::Stdio {
            command: "uvx".to_string(),
            args: vec!["mcp-server-git".to_string()],
            env: HashMap::new(),
            working_dir: None,
        },
    )
}

#[test]
fn parses_tagged_stdio() {
    let registry: FleetRegistry = toml::from_str(
        r#"
[[servers]]
name = "git"
type = "stdio"
command = "uvx"
args = ["mcp-server-git"]

[[servers]]
name = "memory"
type = "stdio"
command = "npx"
args = ["-y", "@modelcontextprotocol/server-memory"]
env = { MEMORY_DIR = "/tmp/memory" }
"#,
    )
    .unwrap();

    assert_eq!(registry.servers.len(), 2);
    assert!(registry.servers[0].is_stdio());
    match &registry.servers[1].transport {
        UpstreamTransport::Stdio { command, env, .. } => {
            assert_eq!(command, "npx");
            assert_eq!(env.get("MEMORY_DIR").unwrap(), "/tmp/memory");
        }
        other => panic!("expected Stdio, got {other:?}"),
    }
}

#[test]
fn parses_legacy_untyped_stdio() {
    let registry: FleetRegistry = toml::from_str(
        r#"
[[servers]]
name = "git"
command = "uvx"
args = ["mcp-server-git"]
"#,
    )
    .unwrap();
    assert!(registry.servers[0].is_stdio());
}

#[test]
fn parses_docker_stdio() {
    let registry: FleetRegistry = toml::from_str(
        r#"
[[servers]]
name = "sandboxed"
type = "docker-stdio"
image = "mcp/filesystem:latest"
args = ["/data"]
env = { LOG_LEVEL = "debug" }
"#,
    )
    .unwrap();
    let server = &registry.servers[0];
    assert!(server.is_docker());
    assert_eq!(server.transport.label(), "docker-stdio");
}

#[test]
fn parses_streamable_http_and_http_alias() {
    let registry: FleetRegistry = toml::from_str(
        r#"
[[servers]]
name = "canonical"
type = "streamable-http"
url = "https://mcp.example.com/mcp"

[[servers]]
name = "aliased"
type = "http"
url = "https://mcp.example.org/mcp"
headers = { Authorization = "Bearer token123" }
"#,
    )
    .unwrap();

    for server in &registry.servers {
        assert!(server.is_remote());
        assert_eq!(server.transport.label(), "streamable-http");
    }
    match &registry.servers[1].transport {
        UpstreamTransport::StreamableHttp { headers, .. } => {
            assert_eq!(headers.get("Authorization").unwrap(), "Bearer token123");
        }
        other => panic!("expected StreamableHttp, got {other:?}"),
    }
}

#[test]
fn parses_sse_with_distinct_label() {
    let registry: FleetRegistry = toml::from_str(
        r#"
[[servers]]
name = "legacy"
type = "sse"
url = "https://example.com/sse"
allow_insecure = false
"#,
    )
    .unwrap();
    assert_eq!(registry.servers[0].transport.label(), "sse");
    assert_eq!(
        registry.servers[0].transport.url(),
        Some("https://example.com/sse")
    );
}

#[test]
fn parses_startup_modes_and_history() {
    let registry: FleetRegistry = toml::from_str(
        r#"
[[servers]]
name = "slow"
type = "stdio"
command = "uvx"
startup_mode = "lazy_loading"
ever_connected = true
tool_count = 4

[[servers]]
name = "broken"
type = "stdio"
command = "uvx"
startup_mode = "auto_disabled"
"#,
    )
    .unwrap();

    assert_eq!(registry.servers[0].startup_mode, StartupMode::LazyLoading);
    assert!(registry.servers[0].ever_connected);
    assert_eq!(registry.servers[0].tool_count, 4);
    assert_eq!(registry.servers[1].startup_mode, StartupMode::AutoDisabled);
    assert!(!registry.servers[1].startup_mode.is_startable());
}

#[test]
fn missing_type_and_command_fails() {
    let err = toml::from_str::<FleetRegistry>(
        r#"
[[servers]]
name = "bad"
url = "https://example.com"
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("missing 'type' field"), "{err}");
}

#[test]
fn unknown_type_fails() {
    let err = toml::from_str::<FleetRegistry>(
        r#"
[[servers]]
name = "bad"
type = "websocket"
url = "wss://example.com"
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("unknown transport type"), "{err}");
}

#[test]
fn http_without_url_fails() {
    let err = toml::from_str::<FleetRegistry>(
        r#"
[[servers]]
name = "bad"
type = "streamable-http"
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("requires 'url' field"), "{err}");
}

#[test]
fn docker_without_image_fails() {
    let err = toml::from_str::<FleetRegistry>(
        r#"
[[servers]]
name = "bad"
type = "docker-stdio"
"#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("requires 'image' field"), "{err}");
}

#[test]
fn connection_timeout_defaults_and_overrides() {
    let mut config = stdio_config("git");
    assert_eq!(
        config.connection_timeout(),
        std::time::Duration::from_secs(DEFAULT_CONNECTION_TIMEOUT_SECS)
    );
    config.connection_timeout_secs = Some(5);
    assert_eq!(
        config.connection_timeout(),
        std::time::Duration::from_secs(5)
    );
}

#[test]
fn same_endpoint_ignores_history_fields() {
    let a = stdio_config("git");
    let mut b = stdio_config("git");
    b.ever_connected = true;
    b.tool_count = 12;
    b.connection_timeout_secs = Some(60);
    assert!(a.same_endpoint(&b));
}

#[test]
fn same_endpoint_detects_transport_change() {
    let a = stdio_config("git");
    let mut b = stdio_config("git");
    b.transport = UpstreamTransport::StreamableHttp {
        url: "https://example.com/mcp".to_string(),
        headers: HashMap::new(),
        allow_insecure: false,
    };
    assert!(!a.same_endpoint(&b));

    let mut c = stdio_config("git");
    c.startup_mode = StartupMode::LazyLoading;
    assert!(!a.same_endpoint(&c));
}

#[test]
fn registry_save_and_reload_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("servers.toml");

    let mut registry = FleetRegistry {
        servers: vec![stdio_config("git"), stdio_config("memory")],
    };
    registry.servers[1].startup_mode = StartupMode::Disabled;
    registry.save_to_path(&path).unwrap();

    let reloaded = FleetRegistry::load_from_path(&path).unwrap();
    assert_eq!(reloaded, registry);
}

#[test]
fn set_startup_mode_updates_and_reports_unknown() {
    let mut registry = FleetRegistry {
        servers: vec![stdio_config("git")],
    };
    assert!(registry.set_startup_mode("git", StartupMode::AutoDisabled));
    assert_eq!(registry.servers[0].startup_mode, StartupMode::AutoDisabled);
    assert!(!registry.set_startup_mode("absent", StartupMode::Disabled));
}

#[test]
fn serialize_emits_tagged_form() {
    let registry = FleetRegistry {
        servers: vec![stdio_config("git")],
    };
    let rendered = toml::to_string(&registry).unwrap();
    assert!(rendered.contains("type = \"stdio\""));
    assert!(rendered.contains("command = \"uvx\""));
}
