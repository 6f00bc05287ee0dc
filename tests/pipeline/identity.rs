use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::support::fakes::{FlipProbe, SequenceProbe};
use crate::support::helpers::{
    broken_daemon_script, fake_daemon_script, fast_config_with, init_tracing, seed_endpoints,
};
use pagehaul::{HaulConfig, IdentityManager};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn arc_config(config: HaulConfig) -> Arc<HaulConfig> {
    Arc::new(config)
}

// An unreaped zombie answers kill -0 but is no longer running, so consult
// the procfs state where available.
fn process_alive(pid: i32) -> bool {
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        if let Some(after_name) = stat.rsplit(')').next() {
            if let Some(state) = after_name.trim_start().chars().next() {
                return state != 'Z' && state != 'X';
            }
        }
    }
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scripted_daemon_connect_and_disconnect() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    seed_endpoints(dir.path(), 2);
    let daemon = fake_daemon_script(dir.path());

    let config = arc_config(fast_config_with(dir.path(), "ph-ident-connect", |builder| {
        builder.daemon_binary(daemon.to_str().unwrap())
    }));

    // Guard check sees the endpoint down, the first readiness poll sees it
    // up; teardown verification then reads down again.
    let probe = SequenceProbe::new([false, true], false);
    let mut manager = IdentityManager::with_probe(
        config.clone(),
        None,
        CancellationToken::new(),
        Box::new(probe),
    )
    .unwrap();

    let target = manager.store().list().unwrap()[0].clone();
    assert!(manager.connect(Some(target.clone())).await);

    let session = manager.session().expect("session after connect");
    assert_eq!(session.config().name(), target.name());
    let daemon_pid = session.pid().expect("daemon pid recorded");
    assert!(process_alive(daemon_pid), "daemon process must be running");

    assert!(
        !manager.paths().secret_file().exists(),
        "credential file must be deleted once the launch completed"
    );
    assert!(manager.paths().pid_file().exists());

    manager.disconnect().await;

    assert!(manager.session().is_none());
    assert!(manager.current_config().is_none());
    assert!(!manager.paths().pid_file().exists());

    // The termination ladder must actually have stopped the process.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!process_alive(daemon_pid), "daemon must be terminated");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn readiness_timeout_reports_failure_and_cleans_the_secret() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    seed_endpoints(dir.path(), 1);
    let daemon = fake_daemon_script(dir.path());

    let config = arc_config(fast_config_with(dir.path(), "ph-ident-timeout", |builder| {
        builder
            .daemon_binary(daemon.to_str().unwrap())
            .readiness_timeout(Duration::from_millis(150))
    }));

    // The endpoint never comes up.
    let probe = SequenceProbe::new([], false);
    let mut manager = IdentityManager::with_probe(
        config,
        None,
        CancellationToken::new(),
        Box::new(probe),
    )
    .unwrap();

    assert!(!manager.connect(None).await);
    assert!(manager.session().is_none());
    assert!(
        !manager.paths().secret_file().exists(),
        "credential file must be deleted on the failure path too"
    );

    // Cleanup: reap the scripted daemon the failed attempt left behind.
    manager.disconnect().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn immediately_exiting_daemon_is_a_boolean_failure() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    seed_endpoints(dir.path(), 1);
    let daemon = broken_daemon_script(dir.path());

    let config = arc_config(fast_config_with(dir.path(), "ph-ident-broken", |builder| {
        builder.daemon_binary(daemon.to_str().unwrap())
    }));

    let probe = SequenceProbe::new([], false);
    let mut manager = IdentityManager::with_probe(
        config,
        None,
        CancellationToken::new(),
        Box::new(probe),
    )
    .unwrap();

    assert!(!manager.connect(None).await);
    assert!(manager.session().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn is_connected_tracks_the_probe_after_external_changes() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    seed_endpoints(dir.path(), 1);

    let config = arc_config(fast_config_with(dir.path(), "ph-ident-probe", |b| b));
    let (probe, flag) = FlipProbe::new(true);
    let mut manager = IdentityManager::with_probe(
        config,
        None,
        CancellationToken::new(),
        Box::new(probe),
    )
    .unwrap();

    assert!(manager.connect(None).await, "live endpoint satisfies connect");
    assert!(manager.is_connected().await);

    // The endpoint dies without the manager's involvement.
    flag.store(false, Ordering::SeqCst);
    assert!(!manager.is_connected().await);

    // And comes back, equally without the manager's involvement.
    flag.store(true, Ordering::SeqCst);
    assert!(manager.is_connected().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rotation_moves_to_the_next_configuration_in_order() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let names = seed_endpoints(dir.path(), 3);
    let daemon = fake_daemon_script(dir.path());

    let config = arc_config(fast_config_with(dir.path(), "ph-ident-rotate", |builder| {
        builder.daemon_binary(daemon.to_str().unwrap())
    }));

    // connect: guard down, poll up. reconnect: still up, teardown verified
    // down, new connect guard down, new poll up.
    let probe = SequenceProbe::new([false, true, true, false, false, true], false);
    let mut manager = IdentityManager::with_probe(
        config,
        None,
        CancellationToken::new(),
        Box::new(probe),
    )
    .unwrap();

    let first = manager.store().list().unwrap()[0].clone();
    assert!(manager.connect(Some(first)).await);
    let first_pid = manager.session().unwrap().pid().unwrap();

    assert!(manager.reconnect_with_new_config().await);

    let session = manager.session().expect("session after rotation");
    assert_eq!(
        session.config().name(),
        names[1],
        "rotation must advance to the successor configuration"
    );
    assert_eq!(
        manager.current_config().unwrap().name(),
        names[1]
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        !process_alive(first_pid),
        "the previous daemon instance must be gone after rotation"
    );

    manager.disconnect().await;
}
