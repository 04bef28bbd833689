/// Persistence and restart tests
///
/// State survives the process: a second orchestrator over the same work
/// directory and runtime must reach the same records, bindings and history,
/// re-reserve the recorded public ports, adopt snapshot images that lost
/// their record, and refuse to start from state it cannot trust.
use devbox::orchestrator::{CreateOptions, StopOptions};
use devbox::relay::InMemoryRelay;
use devbox::runtime::InMemoryRuntime;
use devbox::snapshot::RECOVERED_MESSAGE;
use devbox::{Config, ErrorKind, LifecycleState, Orchestrator, Parser, StateStore};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const CONFIG: &str = r#"
ports: { start: 10000, end: 10099 }
relay: { kind: memory }
"#;

const IMAGE: &str = "ubuntu:22.04";

fn create_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

fn config(yaml: &str) -> Config {
    Parser::new().parse_config(yaml).expect("Failed to parse config")
}

async fn build(
    config: Config,
    dir: &Path,
    runtime: &Arc<InMemoryRuntime>,
    relay: &Arc<InMemoryRelay>,
) -> devbox::Result<Orchestrator> {
    Orchestrator::builder()
        .config(config)
        .work_dir(dir.to_path_buf())
        .runtime(runtime.clone())
        .relay(relay.clone())
        .build()
        .await
}

/// Restarting over unchanged state changes nothing
#[tokio::test]
async fn test_restart_restores_identical_state() {
    let dir = create_test_dir();
    let runtime = Arc::new(InMemoryRuntime::new());
    let relay = Arc::new(InMemoryRelay::new());

    let first = build(config(CONFIG), dir.path(), &runtime, &relay)
        .await
        .unwrap();
    first
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap();
    first
        .create("c2", IMAGE, CreateOptions::default())
        .await
        .unwrap();
    first
        .stop(
            "c2",
            StopOptions {
                keep_history: true,
                commit_message: Some("before restart".into()),
            },
        )
        .await
        .unwrap();
    first.shutdown().await;
    let before = first.export_state();
    drop(first);

    let second = build(config(CONFIG), dir.path(), &runtime, &relay)
        .await
        .unwrap();

    assert_eq!(second.export_state(), before);
    assert!(!second.has_unsaved_changes());
    assert_eq!(second.list_snapshots("c2").unwrap()[0].message, "before restart");

    // Initializing again is a no-op
    second.initialize().await.unwrap();
    assert_eq!(second.export_state(), before);
}

/// Ports recorded in state are never handed out twice after a restart
#[tokio::test]
async fn test_restart_reserves_recorded_ports() {
    let dir = create_test_dir();
    let runtime = Arc::new(InMemoryRuntime::new());
    let relay = Arc::new(InMemoryRelay::new());

    let first = build(config(CONFIG), dir.path(), &runtime, &relay)
        .await
        .unwrap();
    let c1 = first
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap();
    first.shutdown().await;
    drop(first);

    let second = build(config(CONFIG), dir.path(), &runtime, &relay)
        .await
        .unwrap();
    assert_eq!(second.port_usage().allocated, 3);
    let c2 = second
        .create("c2", IMAGE, CreateOptions::default())
        .await
        .unwrap();

    let old: BTreeSet<u16> = c1.ports.values().copied().collect();
    let new: BTreeSet<u16> = c2.ports.values().copied().collect();
    assert!(old.is_disjoint(&new));
    assert_eq!(relay.tunnel_count(), 6);
}

/// Drift that happened while devbox was down is corrected at startup
#[tokio::test]
async fn test_startup_reconciles_against_runtime() {
    let dir = create_test_dir();
    let runtime = Arc::new(InMemoryRuntime::new());
    let relay = Arc::new(InMemoryRelay::new());

    let first = build(config(CONFIG), dir.path(), &runtime, &relay)
        .await
        .unwrap();
    first
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap();
    first.shutdown().await;
    drop(first);

    runtime.simulate_removal("c1");
    let second = build(config(CONFIG), dir.path(), &runtime, &relay)
        .await
        .unwrap();

    let state = second.export_state();
    assert_eq!(state.containers["c1"].state, LifecycleState::Stale);
    assert!(state.bindings("c1").is_empty());
    assert_eq!(second.port_usage().allocated, 0);
    assert_eq!(relay.tunnel_count(), 0);
    // The correction was saved
    let on_disk = second.store().load().unwrap();
    assert_eq!(on_disk.containers["c1"].state, LifecycleState::Stale);
}

/// A snapshot image whose record was lost in a crash is adopted
#[tokio::test]
async fn test_orphan_snapshot_image_is_adopted() {
    let dir = create_test_dir();
    let runtime = Arc::new(InMemoryRuntime::new());
    let relay = Arc::new(InMemoryRelay::new());

    let first = build(config(CONFIG), dir.path(), &runtime, &relay)
        .await
        .unwrap();
    first
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap();
    first
        .stop(
            "c1",
            StopOptions {
                keep_history: true,
                commit_message: None,
            },
        )
        .await
        .unwrap();
    first.shutdown().await;
    drop(first);

    let orphan = "devbox-snapshot/c1:v2_20300101_120000";
    runtime.add_image(orphan);
    let second = build(config(CONFIG), dir.path(), &runtime, &relay)
        .await
        .unwrap();

    let history = second.list_snapshots("c1").unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].image_ref, orphan);
    assert_eq!(history[0].version_tag, "v2_20300101_120000");
    assert_eq!(history[0].message, RECOVERED_MESSAGE);
    assert_eq!(second.store().load().unwrap().history("c1").len(), 2);

    // The adopted snapshot can be restored
    let restored = second
        .start_from_snapshot("c1", None)
        .await
        .unwrap();
    assert_eq!(restored.image, orphan);
}

#[tokio::test]
async fn test_unreadable_state_file_refuses_to_start() {
    let dir = create_test_dir();
    let state_dir = dir.path().join(".devbox");
    std::fs::create_dir_all(&state_dir).unwrap();
    std::fs::write(state_dir.join("tunnels.json"), "{ not json").unwrap();

    let err = build(
        config(CONFIG),
        dir.path(),
        &Arc::new(InMemoryRuntime::new()),
        &Arc::new(InMemoryRelay::new()),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::CorruptState);
    // Nothing was overwritten
    assert_eq!(
        std::fs::read_to_string(state_dir.join("tunnels.json")).unwrap(),
        "{ not json"
    );
}

/// Two containers claiming one public port is ambiguous state
#[tokio::test]
async fn test_double_booked_port_refuses_to_start() {
    let dir = create_test_dir();
    let runtime = Arc::new(InMemoryRuntime::new());
    let relay = Arc::new(InMemoryRelay::new());

    let first = build(config(CONFIG), dir.path(), &runtime, &relay)
        .await
        .unwrap();
    first
        .create("a", IMAGE, CreateOptions::default())
        .await
        .unwrap();
    first
        .create("b", IMAGE, CreateOptions::default())
        .await
        .unwrap();
    first.shutdown().await;

    let mut state = first.export_state();
    let taken = state.tunnels["a"][0].public_port;
    state.tunnels.get_mut("b").unwrap()[0].public_port = taken;
    let store = StateStore::new(first.store().tunnel_path(), first.store().image_path());
    store.save(&state).await.unwrap();
    drop(first);

    let err = build(config(CONFIG), dir.path(), &runtime, &relay)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptState);
}

#[tokio::test]
async fn test_state_file_layout() {
    let dir = create_test_dir();
    let runtime = Arc::new(InMemoryRuntime::new());
    let relay = Arc::new(InMemoryRelay::new());
    let orchestrator = build(config(CONFIG), dir.path(), &runtime, &relay)
        .await
        .unwrap();
    orchestrator
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap();

    let tunnels: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join(".devbox/tunnels.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(tunnels["containers"]["c1"]["state"], "running");
    let bindings = tunnels["tunnels"]["c1"].as_array().unwrap();
    assert_eq!(bindings.len(), 3);
    for binding in bindings {
        assert!(binding["public_port"].as_u64().is_some());
        assert!(binding["tunnel_id"].as_str().is_some());
        assert!(binding["service_type"].as_str().is_some());
    }
}

/// With save-on-mutation off, changes reach disk on the autosave tick
#[tokio::test]
async fn test_autosave_flushes_pending_changes() {
    let dir = create_test_dir();
    let runtime = Arc::new(InMemoryRuntime::new());
    let relay = Arc::new(InMemoryRelay::new());
    let yaml = r#"
ports: { start: 10000, end: 10099 }
persistence:
  save_on_mutation: false
  autosave_interval: 100ms
relay: { kind: memory }
"#;
    let orchestrator = Arc::new(
        build(config(yaml), dir.path(), &runtime, &relay)
            .await
            .unwrap(),
    );
    assert!(orchestrator.start_autosave().await);

    orchestrator
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap();
    assert!(orchestrator.has_unsaved_changes());
    assert!(orchestrator.store().load().unwrap().containers.is_empty());

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(!orchestrator.has_unsaved_changes());
    assert!(orchestrator
        .store()
        .load()
        .unwrap()
        .containers
        .contains_key("c1"));

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_flushes_without_autosave() {
    let dir = create_test_dir();
    let runtime = Arc::new(InMemoryRuntime::new());
    let relay = Arc::new(InMemoryRelay::new());
    let yaml = r#"
persistence:
  save_on_mutation: false
  autosave_interval: 1h
relay: { kind: memory }
"#;
    let orchestrator = build(config(yaml), dir.path(), &runtime, &relay)
        .await
        .unwrap();
    orchestrator
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap();
    assert!(orchestrator.store().load().unwrap().containers.is_empty());

    orchestrator.shutdown().await;
    assert!(orchestrator
        .store()
        .load()
        .unwrap()
        .containers
        .contains_key("c1"));
}
