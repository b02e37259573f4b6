#[path = "common/mod.rs"]
mod common;

use std::fs;

use agentsvc::manifest::{self, ManifestError};
use common::HomeEnvGuard;
use tempfile::tempdir;

#[test]
fn loads_a_directory_of_manifests_skipping_non_matching_extensions() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let _guard = HomeEnvGuard::set(&home);

    let manifests_dir = temp.path().join("manifests");
    fs::create_dir_all(&manifests_dir).unwrap();
    fs::write(
        manifests_dir.join("web.yaml"),
        "name: web\nlevel: 10\nrun: /usr/bin/web\n",
    )
    .unwrap();
    fs::write(
        manifests_dir.join("worker.yaml"),
        "name: worker\nlevel: 20\nrun: /usr/bin/worker\n",
    )
    .unwrap();
    fs::write(manifests_dir.join("README.txt"), "not a manifest").unwrap();

    let manifests = manifest::load_manifests(&manifests_dir, "yaml").expect("load");
    assert_eq!(manifests.len(), 2);
    let names: Vec<_> = manifests.iter().map(|m| m.name.clone()).collect();
    assert!(names.contains(&"web".to_string()));
    assert!(names.contains(&"worker".to_string()));
}

#[test]
fn duplicate_case_insensitive_names_name_both_offending_files() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let _guard = HomeEnvGuard::set(&home);

    let manifests_dir = temp.path().join("manifests");
    fs::create_dir_all(&manifests_dir).unwrap();
    fs::write(manifests_dir.join("a.yaml"), "name: Web\nlevel: 10\n").unwrap();
    fs::write(manifests_dir.join("b.yaml"), "name: web\nlevel: 20\n").unwrap();

    let err = manifest::load_manifests(&manifests_dir, "yaml").unwrap_err();
    match err {
        ManifestError::DuplicateName { name, file_a, file_b } => {
            assert_eq!(name, "web");
            assert!(file_a.ends_with("a.yaml"));
            assert!(file_b.ends_with("b.yaml"));
        }
        other => panic!("expected DuplicateName, got {other:?}"),
    }
}

#[test]
fn settings_env_var_references_are_expanded_before_parsing() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let _guard = HomeEnvGuard::set(&home);

    unsafe {
        std::env::set_var("AGENTSVC_TEST_MANIFEST_DIR", "/srv/manifests");
    }

    let settings_path = temp.path().join("settings.yaml");
    fs::write(
        &settings_path,
        "manifestDir: \"${AGENTSVC_TEST_MANIFEST_DIR}\"\nstartTimeoutSec: 45\n",
    )
    .unwrap();

    let settings = manifest::load_settings(&settings_path).expect("load settings");
    assert_eq!(settings.manifest_dir.as_deref(), Some("/srv/manifests"));
    assert_eq!(settings.start_timeout_sec, Some(45));

    unsafe {
        std::env::remove_var("AGENTSVC_TEST_MANIFEST_DIR");
    }
}

#[test]
fn new_manifest_scaffolder_is_loadable_by_load_manifests() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let _guard = HomeEnvGuard::set(&home);

    let manifests_dir = temp.path().join("manifests");
    manifest::write_new_manifest(
        &manifests_dir,
        "yaml",
        "api",
        "/usr/bin/api",
        &["--port".to_string(), "8080".to_string()],
        10,
    )
    .expect("write new manifest");

    let manifests = manifest::load_manifests(&manifests_dir, "yaml").expect("load");
    assert_eq!(manifests.len(), 1);
    assert_eq!(manifests[0].name, "api");
    assert_eq!(manifests[0].run, "/usr/bin/api --port 8080");
    assert!(manifests[0].is_enabled());
}
