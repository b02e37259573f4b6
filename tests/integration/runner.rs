use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use agentsvc::manifest::SubServiceManifest;
use agentsvc::placeholder::ExpanderContext;
use agentsvc::runner::spawn_monitored;
use agentsvc::state::StatePublisher;
use agentsvc::subservice::{SubServiceHandle, SubServiceState};
use tempfile::tempdir;

fn wait_until(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    predicate()
}

#[test]
fn a_quickly_exiting_command_pauses_instead_of_restarting_forever() {
    let dir = tempdir().expect("tempdir");
    let manifest = Arc::new(SubServiceManifest {
        name: "quick".into(),
        run: "true".into(),
        retry_stable_sec: 0,
        ..Default::default()
    });
    let publisher = Arc::new(StatePublisher::new(dir.path().join("state.bin"), None));
    let handle = Arc::new(SubServiceHandle::new(manifest, publisher));
    let ctx = Arc::new(ExpanderContext::new(
        Default::default(),
        dir.path().to_path_buf(),
        vec![],
    ));

    let control = spawn_monitored(handle.clone(), "true".to_string(), ctx);
    handle.set_runner(control.clone());

    let reached_pause = wait_until(
        || handle.state() == SubServiceState::Paused,
        Duration::from_secs(5),
    );
    assert!(reached_pause, "expected the sub-service to reach Paused after exiting with retryStableSec=0");

    control.abort(0);
    let stopped = wait_until(|| !handle.has_runner(), Duration::from_secs(5));
    assert!(stopped, "runner did not clear itself after abort");
}

#[test]
fn aborting_a_running_child_terminates_it_and_clears_the_runner() {
    let dir = tempdir().expect("tempdir");
    let manifest = Arc::new(SubServiceManifest {
        name: "sleeper".into(),
        run: "sleep 30".into(),
        retry_stable_sec: 60,
        ..Default::default()
    });
    let publisher = Arc::new(StatePublisher::new(dir.path().join("state.bin"), None));
    let handle = Arc::new(SubServiceHandle::new(manifest, publisher));
    let ctx = Arc::new(ExpanderContext::new(
        Default::default(),
        dir.path().to_path_buf(),
        vec![],
    ));

    let control = spawn_monitored(handle.clone(), "sleep 30".to_string(), ctx);
    handle.set_runner(control.clone());

    let running = wait_until(
        || handle.state() == SubServiceState::Running,
        Duration::from_secs(5),
    );
    assert!(running, "expected sub-service to reach Running before abort");

    control.abort(1);
    let stopped = wait_until(|| !handle.has_runner(), Duration::from_secs(5));
    assert!(stopped, "aborted runner should clear itself promptly");
}
