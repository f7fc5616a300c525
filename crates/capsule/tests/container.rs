//! End-to-end tests against the real `capsule-worker` binary.

use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::time::Duration;

use capsule::bridge::protocol::MessageCount;
use capsule::supervisor::process_exists;
use capsule::{Container, ContainerConfig, ContainerError, ContainerState, TraceService};

const WORKER: &str = env!("CARGO_BIN_EXE_capsule-worker");

fn config() -> ContainerConfig {
    ContainerConfig::new(WORKER)
        .with_passthrough(false)
        .with_log_spy(true)
        .with_accept_timeout(Some(Duration::from_secs(30)))
        .with_kill_timeout(Duration::from_secs(5))
}

async fn start(config: ContainerConfig) -> Container {
    Container::start(config).await.unwrap()
}

#[tokio::test]
async fn clean_round_trip() {
    let mut container = start(config()).await;
    assert_eq!(container.state(), ContainerState::Running);
    assert_ne!(container.ui_port(), 0);

    let pid = container.pid().unwrap();
    let data_dir = container.data_dir().unwrap().to_path_buf();
    assert!(data_dir.exists());
    assert!(process_exists(pid));

    container.execute_app("noop").await.unwrap();
    let count = container.check_and_reset().await.unwrap();
    assert_eq!(count, MessageCount::default());

    container.close(false).await.unwrap();
    assert_eq!(container.state(), ContainerState::Closed);
    assert!(!data_dir.exists());
    assert!(!process_exists(pid));
}

#[tokio::test]
async fn occupied_service_port_fails_startup() {
    let occupied = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = occupied.local_addr().unwrap().port();

    let err = Container::start(config().with_ui_port(port))
        .await
        .err()
        .unwrap();

    match err {
        ContainerError::StartupFailed {
            pid, control_port, ..
        } => {
            assert!(!process_exists(pid.unwrap()));
            let control_port = control_port.unwrap();
            assert!(TcpStream::connect((Ipv4Addr::LOCALHOST, control_port)).is_err());
        }
        other => panic!("expected StartupFailed, got {other}"),
    }
}

#[tokio::test]
async fn borrowed_data_dir_survives_close() {
    let dir = tempfile::tempdir().unwrap();
    let mut container = start(config().with_data_dir(dir.path())).await;
    assert_eq!(container.data_dir(), Some(dir.path()));

    container.close(false).await.unwrap();
    assert!(dir.path().exists());
}

#[tokio::test]
async fn kill_terminates_worker_without_rendezvous() {
    let mut container = start(config()).await;
    let pid = container.pid().unwrap();

    container.kill().await.unwrap();
    assert_eq!(container.state(), ContainerState::Closed);
    assert!(!process_exists(pid));

    // Killing or closing again is a no-op.
    container.kill().await.unwrap();
    container.close(true).await.unwrap();
}

#[tokio::test]
async fn shared_container_ignores_plain_close() {
    let mut container = start(config().with_shared(true)).await;
    let pid = container.pid().unwrap();

    container.close(false).await.unwrap();
    assert_eq!(container.state(), ContainerState::Running);
    assert!(process_exists(pid));
    container.execute_app("noop").await.unwrap();

    container.close(true).await.unwrap();
    assert_eq!(container.state(), ContainerState::Closed);
    assert!(!process_exists(pid));
}

#[tokio::test]
async fn close_is_idempotent_and_operations_fail_after() {
    let mut container = start(config()).await;

    container.close(false).await.unwrap();
    container.close(false).await.unwrap();

    let err = container.execute_app("noop").await.unwrap_err();
    assert!(matches!(
        err,
        ContainerError::NotRunning(ContainerState::Closed)
    ));
    assert!(container.check_and_reset().await.is_err());
    assert!(container.trace_service().is_err());
}

#[tokio::test]
async fn console_output_is_counted() {
    let mut container = start(config()).await;
    container.execute_app("warn:console check").await.unwrap();

    container.close(false).await.unwrap();
    assert!(container.num_console_bytes() > 0);
}

#[tokio::test]
async fn slow_worker_hits_handshake_timeout() {
    let err = Container::start(
        config()
            .with_extra_args(["--connect-delay-ms=5000"])
            .with_accept_timeout(Some(Duration::from_millis(200))),
    )
    .await
    .err()
    .unwrap();

    match err {
        ContainerError::HandshakeTimeout {
            pid, control_port, ..
        } => {
            assert!(!process_exists(pid.unwrap()));
            assert!(TcpStream::connect((Ipv4Addr::LOCALHOST, control_port)).is_err());
        }
        other => panic!("expected HandshakeTimeout, got {other}"),
    }
}

#[tokio::test]
async fn missing_worker_is_launch_failed() {
    let err = Container::start(ContainerConfig::new("/nonexistent/capsule-worker"))
        .await
        .err()
        .unwrap();

    assert!(matches!(err, ContainerError::LaunchFailed { .. }));
}

#[tokio::test]
async fn log_spy_reports_expected_and_unexpected_messages() {
    let mut container = start(config()).await;

    container
        .add_expected_log_message("capsule_worker::app", "disk full")
        .await
        .unwrap();
    container.execute_app("warn:disk full soon").await.unwrap();
    container.check_and_reset().await.unwrap();

    container.execute_app("warn:surprise").await.unwrap();
    let err = container.check_and_reset().await.unwrap_err();
    assert_eq!(err.to_string(), "One or more unexpected messages were logged");

    container
        .add_expected_log_message("capsule_worker::app", "never logged")
        .await
        .unwrap();
    let err = container.check_and_reset().await.unwrap_err();
    assert_eq!(err.to_string(), "One or more expected messages were not logged");

    container.close(false).await.unwrap();
}

#[tokio::test]
async fn disabled_log_spy_rejects_expectations() {
    let mut container = start(config().with_log_spy(false)).await;

    let err = container
        .add_expected_log_message("capsule_worker::app", "x")
        .await
        .unwrap_err();
    assert!(matches!(err, ContainerError::Assertion(_)));

    container.execute_app("warn:ignored").await.unwrap();
    assert!(container.check_and_reset().await.unwrap().is_clean());

    container.close(false).await.unwrap();
}

#[tokio::test]
async fn interrupt_reaches_running_workload() {
    let mut container = start(config()).await;

    let (executed, interrupted) = tokio::join!(container.execute_app("spin"), async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        container.interrupt_app().await
    });
    executed.unwrap();
    interrupted.unwrap();

    assert_eq!(
        container
            .trace_service()
            .unwrap()
            .num_active_traces()
            .await
            .unwrap(),
        0
    );

    container.close(false).await.unwrap();
}

#[tokio::test]
async fn heartbeats_mark_worker_responsive() {
    let mut container = start(config()).await;

    tokio::time::timeout(Duration::from_secs(10), async {
        while !container.is_responsive(Duration::from_secs(5)) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap();

    container.close(false).await.unwrap();
    assert!(!container.is_responsive(Duration::from_secs(5)));
}
