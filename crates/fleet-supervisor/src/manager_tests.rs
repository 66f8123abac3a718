use super::*;
use std::sync::Arc;

use fleet_config::OAuthConfig;
use fleet_store::{FileStore, OAuthCompletionEvent, TokenRecord, UpstreamRecord};
use fleet_transport::TransportFactory;

use crate::index::MemoryIndex;
use crate::oauth::NoopOAuthAgent;
use crate::testutil::{FailingFactory, InProcessFactory, stdio_config};

struct Harness {
    manager: Arc<Manager>,
    store: Arc<FileStore>,
    index: Arc<MemoryIndex>,
    _dir: tempfile::TempDir,
}

fn harness_with(factory: Arc<dyn TransportFactory>, tune: impl FnOnce(&mut FleetSettings)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = FleetSettings {
        data_dir: Some(dir.path().to_path_buf()),
        ..FleetSettings::default()
    };
    // Keep scheduler retries snappy; individual tests tune the rest.
    settings.startup_deadline_secs = 30;
    tune(&mut settings);

    let store = Arc::new(FileStore::open(dir.path()).unwrap());
    let index = Arc::new(MemoryIndex::new());
    let manager = Manager::new(ManagerConfig {
        settings,
        factory,
        store: store.clone(),
        oauth: Arc::new(NoopOAuthAgent),
        index: Some(index.clone()),
    });
    Harness {
        manager,
        store,
        index,
        _dir: dir,
    }
}

async fn wait_for(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

#[tokio::test]
async fn add_server_config_is_idempotent_for_identical_configs() {
    let factory = InProcessFactory::new();
    let h = harness_with(factory.clone(), |_| {});
    let bus = EventBus::default();
    h.manager.set_event_bus(bus.clone());

    h.manager.add_server(stdio_config("echo")).await.unwrap();
    let first = h.manager.get_client("echo").unwrap();
    assert!(first.is_connected());
    assert_eq!(factory.connect_count(), 1);

    let mut rx = bus.subscribe();
    // Drain everything from the initial connect.
    while rx.try_recv().is_ok() {}

    // Identical config: same client, connection untouched, no events.
    h.manager
        .add_server_config(stdio_config("echo"))
        .await
        .unwrap();
    let second = h.manager.get_client("echo").unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert!(second.is_connected());
    assert_eq!(factory.connect_count(), 1);
    assert!(rx.try_recv().is_err());

    h.manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn add_server_config_replaces_client_when_endpoint_changes() {
    let factory = InProcessFactory::new();
    let h = harness_with(factory.clone(), |_| {});

    h.manager.add_server(stdio_config("echo")).await.unwrap();
    let first = h.manager.get_client("echo").unwrap();

    let mut changed = stdio_config("echo");
    match &mut changed.transport {
        fleet_config::UpstreamTransport::Stdio { command, .. } => {
            *command = "different".to_string();
        }
        _ => unreachable!(),
    }
    h.manager.add_server_config(changed).await.unwrap();
    let second = h.manager.get_client("echo").unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert!(
        wait_for(Duration::from_secs(2), || {
            first.get_state() == ConnectionState::Disconnected
        })
        .await,
        "replaced client should be disconnected in the background"
    );
    h.manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn connect_all_mixes_success_and_auto_disable() {
    // One healthy upstream and one that always fails, with a threshold of
    // two so the scheduler's retries push it over the edge.
    let dir = tempfile::tempdir().unwrap();
    let settings = FleetSettings {
        data_dir: Some(dir.path().to_path_buf()),
        auto_disable_threshold: 2,
        max_connection_retries: 2,
        ..FleetSettings::default()
    };
    let store = Arc::new(FileStore::open(dir.path()).unwrap());
    let index = Arc::new(MemoryIndex::new());

    let good_factory = InProcessFactory::new();
    let bad_factory = FailingFactory::new("tcp connect error: Connection refused");

    // Two managers would be wrong; instead route by server name through a
    // composite factory.
    struct SplitFactory {
        good: Arc<InProcessFactory>,
        bad: Arc<FailingFactory>,
    }
    #[async_trait::async_trait]
    impl TransportFactory for SplitFactory {
        async fn connect(
            &self,
            config: &fleet_config::UpstreamConfig,
        ) -> Result<fleet_transport::Transport, fleet_transport::TransportError> {
            if config.name.starts_with("good") {
                self.good.connect(config).await
            } else {
                self.bad.connect(config).await
            }
        }
    }

    let manager = Manager::new(ManagerConfig {
        settings,
        factory: Arc::new(SplitFactory {
            good: good_factory.clone(),
            bad: bad_factory.clone(),
        }),
        store: store.clone(),
        oauth: Arc::new(NoopOAuthAgent),
        index: Some(index.clone()),
    });

    manager
        .add_server_config(stdio_config("good"))
        .await
        .unwrap();
    manager.add_server_config(stdio_config("bad")).await.unwrap();

    let summary = manager.connect_all().await;
    assert_eq!(summary.total, 2);
    assert_eq!(summary.successful, 1);
    assert_eq!(summary.failed, 1);

    // The healthy server's tools are indexed; the broken one is latched
    // with a persisted reason and a failure-log line.
    assert_eq!(index.server_tools("good").len(), 2);
    assert!(index.server_tools("bad").is_empty());

    let record = store.get_upstream("bad").await.unwrap().unwrap();
    assert_eq!(record.server_state, ServerState::AutoDisabled);
    assert!(
        record
            .auto_disable_reason
            .as_deref()
            .unwrap()
            .contains("consecutive failures")
    );

    let log_lines = store.failure_log().tail(10).await.unwrap();
    assert_eq!(log_lines.len(), 1);
    assert!(log_lines[0].contains("server=bad"));

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn call_tool_routes_on_first_colon() {
    let h = harness_with(InProcessFactory::new(), |_| {});
    h.manager.add_server(stdio_config("echo")).await.unwrap();

    let result = h.manager.call_tool("echo:ping", None).await.unwrap();
    assert_eq!(
        result.content[0].as_text().map(|t| t.text.as_str()),
        Some("pong")
    );

    h.manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn call_tool_structured_errors() {
    let h = harness_with(InProcessFactory::new(), |_| {});
    h.manager.add_server(stdio_config("echo")).await.unwrap();

    let err = h.manager.call_tool("no-colon", None).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<FleetError>(),
        Some(FleetError::InvalidToolName(_))
    ));

    let err = h.manager.call_tool("ghost:ping", None).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<FleetError>(),
        Some(FleetError::UnknownServer(name)) if name == "ghost"
    ));

    let mut disabled = stdio_config("off");
    disabled.startup_mode = StartupMode::Disabled;
    h.manager.add_server(disabled).await.unwrap();
    let err = h.manager.call_tool("off:ping", None).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<FleetError>(),
        Some(FleetError::ServerDisabled {
            state: ServerState::Disabled,
            ..
        })
    ));

    h.manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn lazy_upstream_sleeps_then_wakes_on_call() {
    let factory = InProcessFactory::new();
    let h = harness_with(factory.clone(), |_| {});

    let mut lazy = stdio_config("lazy");
    lazy.startup_mode = StartupMode::LazyLoading;
    lazy.ever_connected = true;
    lazy.tool_count = 4;
    h.manager.add_server_config(lazy).await.unwrap();

    let summary = h.manager.connect_all().await;
    assert_eq!(summary.total, 0, "lazy upstream must not be scheduled");
    let client = h.manager.get_client("lazy").unwrap();
    assert_eq!(client.get_state(), ConnectionState::Sleeping);
    assert_eq!(factory.connect_count(), 0);

    // First call wakes it with exactly one connect, then forwards.
    let result = h.manager.call_tool("lazy:ping", None).await.unwrap();
    assert_eq!(
        result.content[0].as_text().map(|t| t.text.as_str()),
        Some("pong")
    );
    assert_eq!(factory.connect_count(), 1);
    assert_eq!(client.get_state(), ConnectionState::Ready);

    h.manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn sleeping_tools_stay_advertised() {
    let h = harness_with(InProcessFactory::new(), |_| {});

    let mut lazy = stdio_config("lazy");
    lazy.startup_mode = StartupMode::LazyLoading;
    h.manager.add_server_config(lazy).await.unwrap();
    let client = h.manager.get_client("lazy").unwrap();

    // Connect once so the descriptors are cached, then park it asleep.
    client.connect().await.unwrap();
    client.disconnect().await.unwrap();
    client.enter_sleep();

    let tools = h.manager.aggregated_tools().await;
    let names: Vec<String> = tools.iter().map(|t| t.qualified_name()).collect();
    assert!(names.contains(&"lazy:ping".to_string()), "{names:?}");

    h.manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn remove_server_is_synchronous_and_cleans_up() {
    let h = harness_with(InProcessFactory::new(), |_| {});
    h.manager.add_server(stdio_config("echo")).await.unwrap();
    assert_eq!(h.index.server_tools("echo").len(), 2);

    assert!(h.manager.remove_server("echo"));
    assert!(h.manager.get_client("echo").is_none());
    assert!(h.index.server_tools("echo").is_empty());

    let mut record_deleted = false;
    for _ in 0..40 {
        if h.store.get_upstream("echo").await.unwrap().is_none() {
            record_deleted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(record_deleted, "record should be deleted in the background");
    assert!(!h.manager.remove_server("echo"));
    h.manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn connect_all_skips_user_stopped_and_disabled() {
    let factory = InProcessFactory::new();
    let h = harness_with(factory.clone(), |_| {});

    let mut off = stdio_config("off");
    off.startup_mode = StartupMode::Disabled;
    h.manager.add_server_config(off).await.unwrap();

    h.manager
        .add_server_config(stdio_config("stopped"))
        .await
        .unwrap();
    h.manager
        .get_client("stopped")
        .unwrap()
        .state_manager()
        .set_user_stopped(true);

    let summary = h.manager.connect_all().await;
    assert_eq!(summary.total, 0);
    assert_eq!(factory.connect_count(), 0);
    h.manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn persisted_auto_disable_is_restored_on_add() {
    let factory = InProcessFactory::new();
    let h = harness_with(factory.clone(), |_| {});

    let mut record = UpstreamRecord::from_config(&stdio_config("broken"));
    record.server_state = ServerState::AutoDisabled;
    record.auto_disable_reason = Some("auto-disabled after 3 consecutive failures: x".into());
    h.store.save_upstream(&record).await.unwrap();

    h.manager
        .add_server_config(stdio_config("broken"))
        .await
        .unwrap();
    let client = h.manager.get_client("broken").unwrap();
    assert!(client.state_manager().is_auto_disabled());

    let summary = h.manager.connect_all().await;
    assert_eq!(summary.total, 0);
    assert_eq!(factory.connect_count(), 0);

    let err = h.manager.call_tool("broken:ping", None).await.unwrap_err();
    match err.downcast_ref::<FleetError>() {
        Some(FleetError::ServerDisabled { state, reason, .. }) => {
            assert_eq!(*state, ServerState::AutoDisabled);
            assert!(reason.as_deref().unwrap().contains("consecutive failures"));
        }
        other => panic!("expected ServerDisabled, got {other:?}"),
    }
    h.manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn state_change_events_reach_subscribers_in_order() {
    let h = harness_with(InProcessFactory::new(), |_| {});
    let bus = EventBus::default();
    h.manager.set_event_bus(bus.clone());
    let mut rx = bus.subscribe();

    h.manager.add_server(stdio_config("echo")).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let FleetEvent::StateChange { new, snapshot, .. } = event {
            assert_eq!(snapshot.state, new);
            seen.push(new);
        }
    }
    assert_eq!(
        seen,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Discovering,
            ConnectionState::Ready,
        ]
    );
    h.manager.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn token_arrival_without_event_triggers_one_retry() {
    let factory = InProcessFactory::new();
    let h = harness_with(factory.clone(), |settings| {
        settings.oauth_poll_interval_secs = 1;
        settings.token_retry_cooldown_secs = 1;
    });

    let mut gated = stdio_config("gated");
    gated.oauth = Some(OAuthConfig::default());
    h.manager.add_server(gated).await.unwrap();

    let client = h.manager.get_client("gated").unwrap();
    assert_eq!(client.get_state(), ConnectionState::Error);
    assert_eq!(
        client.get_connection_info().last_error_kind,
        Some(fleet_core::ErrorKind::OauthRequired)
    );
    assert_eq!(factory.connect_count(), 0);

    // Token written by an external process, no completion event published.
    h.store
        .save_token(&TokenRecord {
            server_name: "gated".into(),
            server_url: None,
            access_token: "tok".into(),
            refresh_token: None,
            expires_at: None,
        })
        .await
        .unwrap();

    let client_poll = client.clone();
    assert!(
        wait_for(Duration::from_secs(10), move || client_poll.is_connected()).await,
        "token scan should have revived the upstream"
    );
    assert_eq!(factory.connect_count(), 1);

    // No duplicate retries follow; the upstream is Ready and stays so.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(factory.connect_count(), 1);
    h.manager.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oauth_completion_event_is_consumed_once() {
    let h = harness_with(InProcessFactory::new(), |settings| {
        settings.oauth_poll_interval_secs = 1;
    });

    let mut gated = stdio_config("gated");
    gated.oauth = Some(OAuthConfig::default());
    h.manager.add_server(gated).await.unwrap();
    assert_eq!(
        h.manager.get_client("gated").unwrap().get_state(),
        ConnectionState::Error
    );

    let event = OAuthCompletionEvent::new("gated");
    h.store.record_oauth_completion(&event).await.unwrap();

    let mut consumed = false;
    for _ in 0..100 {
        if h.store.unprocessed_oauth_completions().await.unwrap().is_empty() {
            consumed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(
        consumed,
        "event should be marked processed even when the retry fails"
    );
    h.manager.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_monitor_counts_failures_up_to_the_latch_then_stops() {
    let factory = FailingFactory::new("tcp connect error: Connection refused");
    let h = harness_with(factory.clone(), |settings| {
        settings.health_interval_secs = 1;
        settings.auto_disable_threshold = 3;
    });

    h.manager.add_server(stdio_config("flaky")).await.unwrap();
    let client = h.manager.get_client("flaky").unwrap();
    assert_eq!(client.get_state(), ConnectionState::Error);
    assert_eq!(factory.connect_count(), 1);

    // Health ticks keep counting consecutive failures until the third
    // latches the upstream.
    let sm = client.state_manager().clone();
    assert!(
        wait_for(Duration::from_secs(15), move || sm.is_auto_disabled()).await,
        "health monitor retries should reach the auto-disable threshold"
    );
    assert_eq!(factory.connect_count(), 3);

    // Once latched, the monitor leaves it alone.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(factory.connect_count(), 3);
    h.manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn disconnect_all_brings_everything_down() {
    let h = harness_with(InProcessFactory::new(), |_| {});
    for name in ["a", "b", "c"] {
        h.manager.add_server(stdio_config(name)).await.unwrap();
    }
    assert_eq!(h.manager.get_stats().connected, 3);

    h.manager.disconnect_all().await.unwrap();
    for name in ["a", "b", "c"] {
        assert_eq!(
            h.manager.get_client(name).unwrap().get_state(),
            ConnectionState::Disconnected
        );
    }
    h.manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn stats_and_listing_reflect_the_fleet() {
    let h = harness_with(InProcessFactory::new(), |_| {});
    h.manager.add_server(stdio_config("up")).await.unwrap();
    let mut off = stdio_config("off");
    off.startup_mode = StartupMode::Disabled;
    h.manager.add_server(off).await.unwrap();

    let stats = h.manager.get_stats();
    assert_eq!(stats.total_servers, 2);
    assert_eq!(stats.connected, 1);
    assert_eq!(stats.disabled, 1);
    assert_eq!(stats.total_tools, 2);

    let names = h.manager.get_all_server_names();
    assert_eq!(names, vec!["off".to_string(), "up".to_string()]);

    let statuses = h.manager.list_servers();
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0].name, "off");
    assert_eq!(statuses[0].state, ConnectionState::Disconnected);
    assert_eq!(statuses[1].name, "up");
    assert_eq!(statuses[1].state, ConnectionState::Ready);

    h.manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_is_single_shot() {
    let h = harness_with(InProcessFactory::new(), |_| {});
    h.manager.add_server(stdio_config("echo")).await.unwrap();
    h.manager.shutdown().await.unwrap();
    assert!(h.manager.shutdown().await.is_err());
}
