#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::{Json, Router};
use backend_opencode::supervisor::{
    ServerNotice, ServerStatus, ServerSupervisor, SupervisorConfig,
};
use bridge_protocol::BridgeError;
use bridge_resolver::DefaultResolver;
use tokio::net::TcpListener;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Health-only endpoint standing in for a booted agent server. Returns the
/// port it listens on.
async fn spawn_health_server() -> u16 {
    let app = Router::new().route(
        "/global/health",
        get(|| async { Json(serde_json::json!({ "healthy": true })) }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind health server");
    let port = listener.local_addr().expect("health server addr").port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve health server");
    });
    port
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind probe");
    listener.local_addr().expect("probe addr").port()
}

/// Stub agent binary that accepts `serve --port N` and then sleeps. The
/// accompanying health server answers in its place.
fn write_sleeping_server(dir: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("opencode");
    std::fs::write(&path, "#!/bin/sh\nsleep 60\n").expect("write stub server");
    let mut permissions = path.metadata().expect("stub metadata").permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).expect("chmod stub server");
}

fn supervisor_for(port: u16, binary_dir: Option<&Path>) -> ServerSupervisor {
    let resolver = match binary_dir {
        Some(dir) => DefaultResolver::new(vec![dir.to_path_buf()]),
        None => DefaultResolver::new(vec![std::env::temp_dir().join("definitely-empty-bin-dir")]),
    };
    ServerSupervisor::new(
        SupervisorConfig {
            port,
            startup_timeout: Duration::from_millis(800),
            shutdown_timeout: Duration::from_millis(500),
            ..SupervisorConfig::default()
        },
        Arc::new(resolver),
    )
}

#[tokio::test]
async fn ensure_running_adopts_external_server_without_spawning() {
    let port = spawn_health_server().await;
    // No resolvable binary anywhere: any spawn attempt would error out.
    let supervisor = supervisor_for(port, None);

    supervisor.ensure_running().await.expect("first ensure");
    supervisor.ensure_running().await.expect("second ensure");

    let view = supervisor.state_view().await;
    assert_eq!(view.status, ServerStatus::Running);
    assert!(!view.we_started, "adopted server must not be owned");
    assert_eq!(view.pid, None, "adopted server pid is unknown");
}

#[tokio::test]
async fn shutdown_never_kills_an_adopted_server() {
    let port = spawn_health_server().await;
    let supervisor = supervisor_for(port, None);
    supervisor.ensure_running().await.expect("adopt server");

    supervisor.shutdown().await.expect("shutdown");
    assert_eq!(supervisor.state_view().await.status, ServerStatus::Stopped);

    // The external server is still there; adopting again succeeds.
    supervisor.ensure_running().await.expect("re-adopt server");
    assert_eq!(supervisor.state_view().await.status, ServerStatus::Running);
}

#[tokio::test]
async fn startup_timeout_rejects_and_reaps_the_child() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_sleeping_server(dir.path());
    // Nothing answers health on this port.
    let port = free_port().await;
    let supervisor = supervisor_for(port, Some(dir.path()));

    let error = supervisor.start().await.expect_err("must time out");
    assert!(matches!(error, BridgeError::Timeout(_)));

    let view = supervisor.state_view().await;
    assert_eq!(view.status, ServerStatus::Error);
    assert_eq!(view.pid, None, "timed-out child must be reaped");
}

#[tokio::test]
async fn external_kill_of_our_child_raises_a_crash_notice() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_sleeping_server(dir.path());
    // The health server answers on the supervisor's port while the stub
    // child just sleeps, so startup succeeds with our own pid on record.
    let port = spawn_health_server().await;
    let supervisor = supervisor_for(port, Some(dir.path()));
    let mut notices = supervisor.subscribe();

    supervisor.start().await.expect("start stub server");
    let view = supervisor.state_view().await;
    assert_eq!(view.status, ServerStatus::Running);
    assert!(view.we_started);
    let pid = view.pid.expect("own child pid");

    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .expect("kill stub server");

    let notice = timeout(TEST_TIMEOUT, notices.recv())
        .await
        .expect("crash notice timeout")
        .expect("crash notice");
    assert!(matches!(notice, ServerNotice::Crashed { pid: crashed } if crashed == pid));
    assert_eq!(supervisor.state_view().await.status, ServerStatus::Stopped);
}

#[tokio::test]
async fn clean_shutdown_raises_no_crash_notice() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_sleeping_server(dir.path());
    let port = spawn_health_server().await;
    let supervisor = supervisor_for(port, Some(dir.path()));
    let mut notices = supervisor.subscribe();

    supervisor.start().await.expect("start stub server");
    supervisor.shutdown().await.expect("shutdown");

    let view = supervisor.state_view().await;
    assert_eq!(view.status, ServerStatus::Stopped);
    assert!(!view.we_started);

    // Give the exit watcher time to misfire if it were going to.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(
        matches!(
            notices.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ),
        "clean shutdown must not look like a crash"
    );
}

#[tokio::test]
async fn second_start_waits_for_the_first_instead_of_double_spawning() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_sleeping_server(dir.path());
    let port = spawn_health_server().await;
    let supervisor = Arc::new(supervisor_for(port, Some(dir.path())));

    let first = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.start().await })
    };
    let second = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.start().await })
    };
    first.await.expect("join first").expect("first start");
    second.await.expect("join second").expect("second start");

    assert_eq!(supervisor.state_view().await.status, ServerStatus::Running);
    supervisor.shutdown().await.expect("shutdown");
}
