/// Concurrency tests for per-name operation exclusion
///
/// At most one lifecycle operation runs per container name. These tests
/// stall a runtime call so two operations overlap deterministically:
/// - The second operation on the same name fails fast as busy
/// - Operations on different names proceed side by side
/// - A status read during an operation reports the recorded state
use devbox::orchestrator::{CreateOptions, StopOptions};
use devbox::relay::InMemoryRelay;
use devbox::runtime::{InMemoryRuntime, RuntimeOp};
use devbox::{Error, ErrorKind, LifecycleState, Orchestrator, Parser};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const CONFIG: &str = r#"
ports: { start: 10000, end: 10099 }
relay: { kind: memory }
"#;

const IMAGE: &str = "ubuntu:22.04";

/// Returns the orchestrator, its runtime, and the temp dir (to keep it alive)
async fn create_test_orchestrator(
) -> (Arc<Orchestrator>, Arc<InMemoryRuntime>, tempfile::TempDir) {
    let config = Parser::new()
        .parse_config(CONFIG)
        .expect("Failed to parse config");
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let runtime = Arc::new(InMemoryRuntime::new());

    let orchestrator = Orchestrator::builder()
        .config(config)
        .work_dir(temp_dir.path().to_path_buf())
        .runtime(runtime.clone())
        .relay(Arc::new(InMemoryRelay::new()))
        .build()
        .await
        .expect("Failed to build orchestrator");

    (Arc::new(orchestrator), runtime, temp_dir)
}

/// Concurrent stop and delete of the same container: the first one in wins,
/// the other is rejected as busy and succeeds when retried.
#[tokio::test]
async fn test_concurrent_stop_and_delete_one_is_busy() {
    let (orchestrator, runtime, _dir) = create_test_orchestrator().await;
    orchestrator
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap();
    runtime.delay(RuntimeOp::Stop, Duration::from_millis(300));

    let stop = orchestrator.stop("c1", StopOptions::default());
    let delete = async {
        sleep(Duration::from_millis(50)).await;
        orchestrator.delete("c1", false).await
    };
    let (stopped, deleted) = tokio::join!(stop, delete);

    let stopped = stopped.expect("stop holds the name and completes");
    assert_eq!(stopped.state, LifecycleState::Stopped);
    let err = deleted.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    match err {
        Error::Busy { operation, .. } => assert_eq!(operation, "stop"),
        other => panic!("expected busy, got {:?}", other),
    }

    // The caller retries once the stop is done
    runtime.clear_delay(RuntimeOp::Stop);
    orchestrator.delete("c1", false).await.unwrap();
    assert!(orchestrator.export_state().containers.is_empty());
}

#[tokio::test]
async fn test_concurrent_create_of_same_name() {
    let (orchestrator, runtime, _dir) = create_test_orchestrator().await;
    runtime.delay(RuntimeOp::Create, Duration::from_millis(200));

    let first = orchestrator.create("c1", IMAGE, CreateOptions::default());
    let second = async {
        sleep(Duration::from_millis(50)).await;
        orchestrator.create("c1", IMAGE, CreateOptions::default()).await
    };
    let (first, second) = tokio::join!(first, second);

    assert!(first.is_ok());
    assert_eq!(second.unwrap_err().kind(), ErrorKind::Conflict);
    assert_eq!(runtime.calls(RuntimeOp::Create), 1);
}

/// Different names never wait on each other and never share a port
#[tokio::test]
async fn test_different_names_run_concurrently() {
    let (orchestrator, runtime, _dir) = create_test_orchestrator().await;
    runtime.delay(RuntimeOp::Create, Duration::from_millis(100));

    let mut handles = Vec::new();
    for i in 0..4 {
        let orchestrator = Arc::clone(&orchestrator);
        handles.push(tokio::spawn(async move {
            orchestrator
                .create(&format!("c{}", i), IMAGE, CreateOptions::default())
                .await
        }));
    }

    let mut ports = BTreeSet::new();
    for handle in handles {
        let created = handle.await.unwrap().unwrap();
        ports.extend(created.ports.values().copied());
    }
    assert_eq!(ports.len(), 12, "no public port may be handed out twice");
    assert_eq!(orchestrator.port_usage().allocated, 12);
}

/// A status read while an operation holds the container does not wait
#[tokio::test]
async fn test_status_during_operation_reports_busy() {
    let (orchestrator, runtime, _dir) = create_test_orchestrator().await;
    orchestrator
        .create("c1", IMAGE, CreateOptions::default())
        .await
        .unwrap();
    runtime.delay(RuntimeOp::Stop, Duration::from_millis(300));
    let inspects_before = runtime.calls(RuntimeOp::Inspect);

    let stop = orchestrator.stop("c1", StopOptions::default());
    let status = async {
        sleep(Duration::from_millis(50)).await;
        orchestrator.get_status("c1").await
    };
    let (stopped, status) = tokio::join!(stop, status);

    stopped.unwrap();
    let status = status.unwrap();
    assert_eq!(status.busy, Some("stop"));
    // Tunnels were already down when the status was read
    assert!(status.bindings.is_empty());
    // No refresh ran against the runtime
    assert_eq!(runtime.calls(RuntimeOp::Inspect), inspects_before);
}

#[tokio::test]
async fn test_reconcile_skips_busy_containers() {
    let (orchestrator, runtime, _dir) = create_test_orchestrator().await;
    for name in ["a", "b"] {
        orchestrator
            .create(name, IMAGE, CreateOptions::default())
            .await
            .unwrap();
    }
    runtime.delay(RuntimeOp::Stop, Duration::from_millis(300));

    let stop = orchestrator.stop("a", StopOptions::default());
    let reconcile = async {
        sleep(Duration::from_millis(50)).await;
        orchestrator.reconcile().await
    };
    let (stopped, report) = tokio::join!(stop, reconcile);

    stopped.unwrap();
    assert_eq!(report.skipped_busy, vec!["a".to_string()]);
    assert_eq!(report.checked, 1);
    assert!(report.drifted.is_empty());
}
