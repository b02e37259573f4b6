#[path = "common/mod.rs"]
mod common;

use std::path::PathBuf;

use agentsvc::error::ExpandError;
use agentsvc::manifest::{SubServiceManifest, SupervisorSettings};
use agentsvc::placeholder::{ExpanderContext, expand};
use common::HomeEnvGuard;
use tempfile::tempdir;

fn manifest() -> SubServiceManifest {
    SubServiceManifest {
        name: "worker".into(),
        run: "/usr/bin/worker".into(),
        ..Default::default()
    }
}

#[test]
fn system_path_tokens_resolve_under_the_active_runtime_context() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    std::fs::create_dir_all(&home).unwrap();
    let _guard = HomeEnvGuard::set(&home);

    let ctx = ExpanderContext::new(SupervisorSettings::default(), PathBuf::from("/manifests"), vec![]);

    let out = expand("%UserData%/cache", &manifest(), &ctx).unwrap();
    assert_eq!(out, format!("{}/cache", home.display()));

    let log = expand("%Log%/worker.log", &manifest(), &ctx).unwrap();
    assert!(log.ends_with("/worker.log"));
}

#[test]
fn agl_folder_and_ext_reflect_the_expander_context() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    std::fs::create_dir_all(&home).unwrap();
    let _guard = HomeEnvGuard::set(&home);

    let mut settings = SupervisorSettings::default();
    settings.manifest_ext = Some("yml".into());
    let ctx = ExpanderContext::new(settings, PathBuf::from("/opt/manifests"), vec!["--flag".into()]);

    assert_eq!(
        expand("%agl.folder%", &manifest(), &ctx).unwrap(),
        "/opt/manifests"
    );
    assert_eq!(expand("%agl.ext%", &manifest(), &ctx).unwrap(), "yml");
    assert_eq!(expand("%agl.params%", &manifest(), &ctx).unwrap(), "--flag");
}

#[test]
fn recursion_depth_is_bounded() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    std::fs::create_dir_all(&home).unwrap();
    let _guard = HomeEnvGuard::set(&home);

    let ctx = ExpanderContext::new(SupervisorSettings::default(), PathBuf::from("/manifests"), vec![]);
    let mut m = manifest();
    // %description% expands to the literal string "%description%", which can
    // never reach a fixed point; the expander must bail out rather than loop
    // forever.
    m.description = "%description%".into();

    let err = expand("%description%", &m, &ctx).unwrap_err();
    assert!(matches!(err, ExpandError::RecursionDepthExceeded(_)));
}
