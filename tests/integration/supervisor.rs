#[path = "common/mod.rs"]
mod common;

use std::{fs, time::Duration};

use agentsvc::state::read_snapshot;
use agentsvc::supervisor::Supervisor;
use common::HomeEnvGuard;
use tempfile::tempdir;

fn wait_until(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    predicate()
}

/// E1 (level ordering): a level-20 sub-service's blocking `wait` action only
/// runs after `start()` has moved past the level-10 barrier.
#[test]
fn level_20_starts_only_after_level_10_reaches_running() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let _guard = HomeEnvGuard::set(&home);

    let manifest_dir = temp.path().join("manifests");
    fs::create_dir_all(&manifest_dir).unwrap();
    let marker = temp.path().join("marker");

    fs::write(
        manifest_dir.join("first.yaml"),
        "name: first\nlevel: 10\nrun: sleep 300\n",
    )
    .unwrap();
    fs::write(
        manifest_dir.join("second.yaml"),
        format!(
            "name: second\nlevel: 20\nstart:\n  - \"wait:touch {}\"\n",
            marker.display()
        ),
    )
    .unwrap();

    let supervisor = Supervisor::new(Some(manifest_dir), None).expect("construct supervisor");
    supervisor.start().expect("start");

    assert!(
        marker.exists(),
        "level-20 wait action should have completed by the time start() returns"
    );

    supervisor.stop().expect("stop");
}

/// After `stop()` the state file is removed and a fresh `read_snapshot`
/// reports no sub-services.
#[test]
fn stop_removes_the_state_file() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let _guard = HomeEnvGuard::set(&home);

    let manifest_dir = temp.path().join("manifests");
    fs::create_dir_all(&manifest_dir).unwrap();
    fs::write(
        manifest_dir.join("svc.yaml"),
        "name: svc\nlevel: 10\nrun: sleep 300\n",
    )
    .unwrap();

    let supervisor = Supervisor::new(Some(manifest_dir), None).expect("construct supervisor");
    let state_path = supervisor.state_publisher().state_path().to_path_buf();
    supervisor.start().expect("start");

    let published = wait_until(|| state_path.exists(), Duration::from_secs(5));
    assert!(published, "expected a state file once the supervisor has started");

    supervisor.stop().expect("stop");
    assert!(!state_path.exists());

    let snapshot = read_snapshot(&state_path).expect("read after stop");
    assert!(snapshot.services.is_empty());
}

/// A pre-existing state file with a foreign magic is left untouched, and
/// the supervisor publishes to a fresh fallback path instead of failing
/// construction outright.
#[test]
fn foreign_magic_state_file_falls_back_to_a_fresh_path_instead_of_erroring() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let _guard = HomeEnvGuard::set(&home);

    let manifest_dir = temp.path().join("manifests");
    fs::create_dir_all(&manifest_dir).unwrap();

    let state_path = temp.path().join("state.bin");
    fs::write(&state_path, b"not-ours-at-all").unwrap();

    let settings_path = temp.path().join("settings.yaml");
    fs::write(
        &settings_path,
        format!("stateFile: {}\n", state_path.display()),
    )
    .unwrap();

    let supervisor = Supervisor::new(Some(manifest_dir), Some(settings_path))
        .expect("construction should fall back instead of erroring");

    let used_path = supervisor.state_publisher().state_path().to_path_buf();
    assert_ne!(used_path, state_path, "should publish to a fresh path");
    assert!(used_path.to_string_lossy().contains("state.bin."));

    // The foreign file must still be exactly as it was.
    assert_eq!(fs::read(&state_path).unwrap(), b"not-ours-at-all");
}

/// Resuming with no sub-services loaded is a harmless no-op, not an error.
#[test]
fn resume_before_start_is_a_harmless_no_op() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let _guard = HomeEnvGuard::set(&home);

    let manifest_dir = temp.path().join("manifests");
    fs::create_dir_all(&manifest_dir).unwrap();

    let supervisor = Supervisor::new(Some(manifest_dir), None).expect("construct supervisor");
    let resumed = supervisor.resume(None).expect("resume");
    assert_eq!(resumed, 0);
}
