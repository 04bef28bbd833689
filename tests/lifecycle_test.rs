/// End-to-end lifecycle tests against the in-memory runtime and relay
///
/// These drive the public `Orchestrator` API through create, stop, start,
/// snapshot, restore and delete, and check the three resources it keeps in
/// step: runtime containers, relay tunnels, and the public port pool.
use devbox::orchestrator::{CreateOptions, StopOptions};
use devbox::relay::InMemoryRelay;
use devbox::runtime::{InMemoryRuntime, RuntimeOp};
use devbox::{ErrorKind, LifecycleState, Orchestrator, Parser, ServiceKind};
use std::collections::BTreeSet;
use std::sync::Arc;

const CONFIG: &str = r#"
ports:
  start: 10000
  end: 10049
  strategy: sequential
services:
  ssh: { port: 22 }
  notebook: { port: 8888 }
  app: { port: 8080 }
snapshots:
  max_history: 5
relay:
  kind: memory
"#;

const IMAGE: &str = "nvidia/cuda:12.2.0-devel-ubuntu22.04";

struct Harness {
    orchestrator: Orchestrator,
    runtime: Arc<InMemoryRuntime>,
    relay: Arc<InMemoryRelay>,
    _dir: tempfile::TempDir,
}

async fn harness(config: &str) -> Harness {
    let config = Parser::new()
        .parse_config(config)
        .expect("Failed to parse config");
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let runtime = Arc::new(InMemoryRuntime::new());
    let relay = Arc::new(InMemoryRelay::new());

    let orchestrator = Orchestrator::builder()
        .config(config)
        .work_dir(dir.path().to_path_buf())
        .runtime(runtime.clone())
        .relay(relay.clone())
        .build()
        .await
        .expect("Failed to build orchestrator");

    Harness {
        orchestrator,
        runtime,
        relay,
        _dir: dir,
    }
}

fn keep_history() -> StopOptions {
    StopOptions {
        keep_history: true,
        commit_message: None,
    }
}

/// Creating a container publishes every configured service on its own port
#[tokio::test]
async fn test_create_publishes_all_services() {
    let h = harness(CONFIG).await;

    let created = h
        .orchestrator
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap();

    assert_eq!(created.state, LifecycleState::Running);
    assert_eq!(created.ports.len(), 3);
    let distinct: BTreeSet<u16> = created.ports.values().copied().collect();
    assert_eq!(distinct.len(), 3, "public ports must be distinct");
    assert!(created.container_id.is_some());
    assert!(h.runtime.container("c1").unwrap().running);
    assert_eq!(h.runtime.calls(RuntimeOp::Start), 1);
    assert_eq!(h.relay.tunnel_count(), 3);

    // Credentials were generated and handed to the container
    assert!(created.credentials.root_password.is_some());
    assert!(created.credentials.notebook_token.is_some());

    let state = h.orchestrator.export_state();
    assert_eq!(state.containers["c1"].state, LifecycleState::Running);
    assert_eq!(state.bindings("c1").len(), 3);
    let notebook = state
        .bindings("c1")
        .iter()
        .find(|b| b.service_type == ServiceKind::Notebook)
        .unwrap();
    assert_eq!(notebook.internal_port, 8888);
    assert_eq!(notebook.public_port, created.ports[&ServiceKind::Notebook]);

    // Persisted because save_on_mutation defaults to on
    assert!(!h.orchestrator.has_unsaved_changes());
    let on_disk = h.orchestrator.store().load().unwrap();
    assert_eq!(on_disk.bindings("c1").len(), 3);
}

/// The first refresh after a create finds nothing to correct
#[tokio::test]
async fn test_create_then_status_is_in_sync() {
    let h = harness(CONFIG).await;
    let created = h
        .orchestrator
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap();
    let registered = h.relay.register_calls();

    let status = h.orchestrator.get_status("c1").await.unwrap();

    assert_eq!(status.state, LifecycleState::Running);
    assert_eq!(status.bindings.len(), 3);
    assert!(status.ip_address.is_some());
    assert_eq!(h.relay.tunnel_count(), 3);
    assert_eq!(h.relay.register_calls(), registered);
    assert_eq!(h.orchestrator.export_state().bindings("c1").len(), 3);
    assert_eq!(
        h.orchestrator.port_usage().allocated,
        created.ports.len()
    );
}

#[tokio::test]
async fn test_create_start_failure_leaves_nothing_behind() {
    let h = harness(CONFIG).await;
    h.runtime.fail_next(RuntimeOp::Start);

    let err = h
        .orchestrator
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RuntimeFailure);
    assert!(h.orchestrator.export_state().containers.is_empty());
    assert!(h.runtime.container("c1").is_none());
    assert_eq!(h.relay.register_calls(), 0);
    assert_eq!(h.orchestrator.port_usage().allocated, 0);
}

#[tokio::test]
async fn test_create_existing_name_is_conflict() {
    let h = harness(CONFIG).await;
    h.orchestrator
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap();

    let err = h
        .orchestrator
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(h.relay.tunnel_count(), 3);
}

#[tokio::test]
async fn test_create_rejects_invalid_name() {
    let h = harness(CONFIG).await;
    let err = h
        .orchestrator
        .create("-bad name", IMAGE, CreateOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(h.runtime.calls(RuntimeOp::Create), 0);
}

/// Stopping with history commits a snapshot and releases every port
#[tokio::test]
async fn test_stop_with_history_releases_ports() {
    let h = harness(CONFIG).await;
    let created = h
        .orchestrator
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap();

    let stopped = h.orchestrator.stop("c1", keep_history()).await.unwrap();

    assert_eq!(stopped.state, LifecycleState::Stopped);
    let mut released = stopped.released_ports.clone();
    released.sort_unstable();
    let mut published: Vec<u16> = created.ports.values().copied().collect();
    published.sort_unstable();
    assert_eq!(released, published);

    let snapshot = stopped.snapshot.expect("snapshot recorded");
    assert!(snapshot.version_tag.starts_with("v1_"));
    assert!(h.runtime.has_image(&snapshot.image_ref));

    assert_eq!(h.relay.tunnel_count(), 0);
    assert_eq!(h.orchestrator.port_usage().allocated, 0);
    let state = h.orchestrator.export_state();
    assert!(state.bindings("c1").is_empty());
    assert_eq!(state.history("c1").len(), 1);
    assert_eq!(state.containers["c1"].state, LifecycleState::Stopped);
    assert!(!h.runtime.container("c1").unwrap().running);
}

/// Restarting hands out fresh ports while unused ones remain
#[tokio::test]
async fn test_start_after_stop_uses_new_ports() {
    let h = harness(CONFIG).await;
    let created = h
        .orchestrator
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap();
    h.orchestrator
        .stop("c1", StopOptions::default())
        .await
        .unwrap();

    let started = h.orchestrator.start("c1").await.unwrap();

    assert_eq!(started.state, LifecycleState::Running);
    assert_eq!(started.ports.len(), 3);
    let before: BTreeSet<u16> = created.ports.values().copied().collect();
    let after: BTreeSet<u16> = started.ports.values().copied().collect();
    assert!(before.is_disjoint(&after));
    assert_eq!(h.relay.tunnel_count(), 3);
    // Same runtime container, started again
    assert_eq!(started.container_id, created.container_id);
    assert_eq!(started.credentials, created.credentials);
}

#[tokio::test]
async fn test_start_running_container_is_conflict() {
    let h = harness(CONFIG).await;
    h.orchestrator
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap();
    let err = h.orchestrator.start("c1").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_operations_on_missing_container_are_not_found() {
    let h = harness(CONFIG).await;
    assert_eq!(
        h.orchestrator.start("ghost").await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(
        h.orchestrator
            .stop("ghost", StopOptions::default())
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::NotFound
    );
    assert_eq!(
        h.orchestrator.delete("ghost", false).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(
        h.orchestrator.get_status("ghost").await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

/// History is capped; the oldest snapshot and its image go away
#[tokio::test]
async fn test_snapshot_history_is_capped() {
    let h = harness(CONFIG).await;
    h.orchestrator
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap();
    h.orchestrator
        .stop("c1", StopOptions::default())
        .await
        .unwrap();

    let mut taken = Vec::new();
    for i in 1..=6 {
        let result = h
            .orchestrator
            .snapshot("c1", &format!("checkpoint {}", i))
            .await
            .unwrap();
        taken.push(result);
    }

    let history = h.orchestrator.list_snapshots("c1").unwrap();
    assert_eq!(history.len(), 5);
    // Newest first
    assert!(history[0].version_tag.starts_with("v6_"));
    assert!(history[4].version_tag.starts_with("v2_"));

    let first = &taken[0].snapshot;
    assert!(!history.iter().any(|r| r.image_ref == first.image_ref));
    assert!(!h.runtime.has_image(&first.image_ref));
    assert_eq!(taken[5].evicted.len(), 1);
    assert_eq!(taken[5].evicted[0], *first);
    assert_eq!(h.runtime.image_count(), 5);
}

#[tokio::test]
async fn test_snapshot_of_running_container_is_conflict() {
    let h = harness(CONFIG).await;
    h.orchestrator
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap();
    let err = h.orchestrator.snapshot("c1", "too early").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(h.runtime.calls(RuntimeOp::Commit), 0);
}

/// Restoring replaces the runtime container with one built from the snapshot
#[tokio::test]
async fn test_restore_from_snapshot() {
    let h = harness(CONFIG).await;
    let created = h
        .orchestrator
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap();
    let first = h
        .orchestrator
        .stop("c1", keep_history())
        .await
        .unwrap()
        .snapshot
        .unwrap();
    h.orchestrator.snapshot("c1", "second").await.unwrap();

    let restored = h
        .orchestrator
        .start_from_snapshot("c1", Some(&first.version_tag))
        .await
        .unwrap();

    assert_eq!(restored.state, LifecycleState::Running);
    assert_eq!(restored.image, first.image_ref);
    assert_ne!(restored.container_id, created.container_id);
    assert_eq!(h.runtime.container_spec("c1").unwrap().image, first.image_ref);
    assert_eq!(h.relay.tunnel_count(), 3);

    let status = h.orchestrator.get_status("c1").await.unwrap();
    assert_eq!(status.base_image, IMAGE);
    assert_eq!(status.image, first.image_ref);
    assert_eq!(status.snapshots, 2);
}

#[tokio::test]
async fn test_restore_unknown_tag_is_not_found() {
    let h = harness(CONFIG).await;
    h.orchestrator
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap();
    h.orchestrator.stop("c1", keep_history()).await.unwrap();

    let err = h
        .orchestrator
        .start_from_snapshot("c1", Some("v9_20200101_000000"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(
        h.orchestrator.export_state().containers["c1"].state,
        LifecycleState::Stopped
    );
}

#[tokio::test]
async fn test_delete_running_container() {
    let h = harness(CONFIG).await;
    h.orchestrator
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap();
    h.orchestrator.stop("c1", keep_history()).await.unwrap();
    h.orchestrator.start("c1").await.unwrap();

    let deleted = h.orchestrator.delete("c1", false).await.unwrap();

    assert_eq!(deleted.released_ports.len(), 3);
    assert!(deleted.removed_snapshots.is_empty());
    assert!(h.runtime.container("c1").is_none());
    assert_eq!(h.relay.tunnel_count(), 0);
    assert_eq!(h.orchestrator.port_usage().allocated, 0);

    let state = h.orchestrator.export_state();
    assert!(!state.containers.contains_key("c1"));
    // History outlives the container unless asked otherwise
    assert_eq!(state.history("c1").len(), 1);
    assert_eq!(h.orchestrator.list_snapshots("c1").unwrap().len(), 1);
}

#[tokio::test]
async fn test_delete_with_snapshots_removes_images() {
    let h = harness(CONFIG).await;
    h.orchestrator
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap();
    let snapshot = h
        .orchestrator
        .stop("c1", keep_history())
        .await
        .unwrap()
        .snapshot
        .unwrap();

    let deleted = h.orchestrator.delete("c1", true).await.unwrap();

    assert_eq!(deleted.removed_snapshots.len(), 1);
    assert!(deleted.unremoved_images.is_empty());
    assert!(!h.runtime.has_image(&snapshot.image_ref));
    assert_eq!(
        h.orchestrator.list_snapshots("c1").unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

/// A relay refusal part way through publishing undoes the whole create
#[tokio::test]
async fn test_create_rolls_back_on_relay_failure() {
    let h = harness(CONFIG).await;
    h.relay.fail_register_after(1);

    let err = h
        .orchestrator
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RelayFailure);
    assert!(h.runtime.container("c1").is_none());
    assert_eq!(h.relay.tunnel_count(), 0);
    assert_eq!(h.orchestrator.port_usage().allocated, 0);
    assert!(!h.orchestrator.export_state().containers.contains_key("c1"));

    // The name is free again
    h.orchestrator
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_create_rolls_back_on_exhausted_pool() {
    let h = harness(
        r#"
ports: { start: 10000, end: 10001, strategy: sequential }
relay: { kind: memory }
"#,
    )
    .await;

    let err = h
        .orchestrator
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ExhaustedPool);
    assert!(h.runtime.container("c1").is_none());
    assert_eq!(h.relay.tunnel_count(), 0);
    assert_eq!(h.orchestrator.port_usage().available, 2);
}

#[tokio::test]
async fn test_create_runtime_failure_leaves_no_record() {
    let h = harness(CONFIG).await;
    h.runtime.fail_next(RuntimeOp::Create);

    let err = h
        .orchestrator
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RuntimeFailure);
    assert!(h.orchestrator.export_state().containers.is_empty());
    assert_eq!(h.relay.register_calls(), 0);
}

/// Compensation that itself fails is reported for manual cleanup
#[tokio::test]
async fn test_failed_compensation_is_partial_failure() {
    let h = harness(CONFIG).await;
    h.relay.fail_next_register();
    h.runtime.fail_next(RuntimeOp::Remove);

    let err = h
        .orchestrator
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PartialFailure);
    assert_eq!(err.root_cause().kind(), ErrorKind::RelayFailure);
    assert!(err.to_string().contains("container c1"));
    assert_eq!(
        h.orchestrator.export_state().containers["c1"].state,
        LifecycleState::Unknown
    );
    // The container that could not be removed is still there
    assert!(h.runtime.container("c1").is_some());
}

/// A tunnel the relay accepted without reporting its id may be live: its
/// port stays allocated and is listed for manual cleanup
#[tokio::test]
async fn test_unconfirmed_tunnel_keeps_its_port() {
    let h = harness(CONFIG).await;
    h.relay.lose_next_tunnel_id();

    let err = h
        .orchestrator
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PartialFailure);
    assert_eq!(err.root_cause().kind(), ErrorKind::RelayFailure);
    assert!(err.to_string().contains("unconfirmed tunnel on public port 10000"));
    assert_eq!(
        h.orchestrator.export_state().containers["c1"].state,
        LifecycleState::Unknown
    );
    assert_eq!(h.relay.tunnel_count(), 1);
    let usage = h.orchestrator.port_usage();
    assert_eq!(usage.allocated, 1);

    // Another container never receives the port of the live tunnel
    let other = h
        .orchestrator
        .create("c2", IMAGE, CreateOptions::default())
        .await
        .unwrap();
    assert!(other.ports.values().all(|port| *port != 10000));
}

#[tokio::test]
async fn test_failed_start_returns_to_stopped() {
    let h = harness(CONFIG).await;
    h.orchestrator
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap();
    h.orchestrator
        .stop("c1", StopOptions::default())
        .await
        .unwrap();
    h.relay.fail_register_after(2);

    let err = h.orchestrator.start("c1").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RelayFailure);
    assert_eq!(
        h.orchestrator.export_state().containers["c1"].state,
        LifecycleState::Stopped
    );
    assert!(!h.runtime.container("c1").unwrap().running);
    assert_eq!(h.relay.tunnel_count(), 0);
    assert_eq!(h.orchestrator.port_usage().allocated, 0);
}

/// A failed stop puts the tunnels back up
#[tokio::test]
async fn test_failed_stop_republishes_tunnels() {
    let h = harness(CONFIG).await;
    h.orchestrator
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap();
    h.runtime.fail_next(RuntimeOp::Stop);

    let err = h
        .orchestrator
        .stop("c1", StopOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RuntimeFailure);
    let state = h.orchestrator.export_state();
    assert_eq!(state.containers["c1"].state, LifecycleState::Running);
    assert_eq!(state.bindings("c1").len(), 3);
    assert_eq!(h.relay.tunnel_count(), 3);
    assert!(h.runtime.container("c1").unwrap().running);
}

#[tokio::test]
async fn test_failed_snapshot_on_stop_is_partial_failure() {
    let h = harness(CONFIG).await;
    h.orchestrator
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap();
    h.runtime.fail_next(RuntimeOp::Commit);

    let err = h.orchestrator.stop("c1", keep_history()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PartialFailure);
    // The stop itself happened
    let state = h.orchestrator.export_state();
    assert_eq!(state.containers["c1"].state, LifecycleState::Stopped);
    assert!(state.history("c1").is_empty());
    assert_eq!(h.relay.tunnel_count(), 0);
}

#[tokio::test]
async fn test_port_usage_reports_by_container() {
    let h = harness(CONFIG).await;
    let a = h
        .orchestrator
        .create("a", IMAGE, CreateOptions::default())
        .await
        .unwrap();
    h.orchestrator
        .create("b", IMAGE, CreateOptions::default())
        .await
        .unwrap();

    let usage = h.orchestrator.port_usage();
    assert_eq!(usage.allocated, 6);
    assert_eq!(usage.total, 50);
    assert_eq!(usage.by_container.len(), 2);
    assert_eq!(usage.by_container["a"], a.ports);
}
