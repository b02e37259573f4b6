use std::{fs, sync::Arc};

use agentsvc::constants::STATE_FILE_MAGIC;
use agentsvc::error::StateError;
use agentsvc::manifest::SubServiceManifest;
use agentsvc::state::{StatePublisher, fallback_path, read_snapshot, validate_existing};
use agentsvc::subservice::{SubServiceHandle, SubServiceState};
use tempfile::tempdir;

#[test]
fn publish_reflects_every_registered_sub_service_in_order() {
    let dir = tempdir().expect("tempdir");
    let state_path = dir.path().join("state.bin");
    let publisher = Arc::new(StatePublisher::new(state_path.clone(), None));

    let web = Arc::new(SubServiceHandle::new(
        Arc::new(SubServiceManifest {
            name: "web".into(),
            ..Default::default()
        }),
        publisher.clone(),
    ));
    let worker = Arc::new(SubServiceHandle::new(
        Arc::new(SubServiceManifest {
            name: "worker".into(),
            ..Default::default()
        }),
        publisher.clone(),
    ));
    web.set_state(SubServiceState::Running, "PID=100");
    worker.set_state(SubServiceState::Paused, "Wait 2 sec");

    let registry: Arc<Vec<Arc<SubServiceHandle>>> = Arc::new(vec![web, worker]);
    publisher.bind_registry(Arc::downgrade(&registry));
    publisher.publish().unwrap();

    let snapshot = read_snapshot(&state_path).unwrap();
    assert_eq!(snapshot.services.len(), 2);
    assert_eq!(snapshot.services[0].name, "web");
    assert_eq!(snapshot.services[0].state, "Running");
    assert_eq!(snapshot.services[1].name, "worker");
    assert_eq!(snapshot.services[1].state, "Paused");
}

#[test]
fn finalize_stopped_removes_the_state_file() {
    let dir = tempdir().expect("tempdir");
    let state_path = dir.path().join("state.bin");
    let publisher = Arc::new(StatePublisher::new(state_path.clone(), None));
    let registry: Arc<Vec<Arc<SubServiceHandle>>> = Arc::new(vec![]);
    publisher.bind_registry(Arc::downgrade(&registry));
    publisher.publish().unwrap();
    assert!(state_path.exists());

    publisher.finalize_stopped().unwrap();
    assert!(!state_path.exists());
}

#[test]
fn an_existing_file_with_a_foreign_magic_is_never_touched() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("state.bin");
    fs::write(&path, b"not-ours-at-all").unwrap();

    let err = validate_existing(&path).unwrap_err();
    assert!(matches!(err, StateError::InvalidMagic { .. }));

    let fallback = fallback_path(&path);
    assert_ne!(fallback, path);
    assert!(fallback.to_string_lossy().contains("state.bin."));

    // The original file must be untouched.
    let bytes = fs::read(&path).unwrap();
    assert_eq!(bytes, b"not-ours-at-all");
    assert_ne!(&bytes[..4.min(bytes.len())], &STATE_FILE_MAGIC[..]);
}
