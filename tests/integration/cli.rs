#[path = "common/mod.rs"]
mod common;

use std::fs;

use assert_cmd::Command;
use common::HomeEnvGuard;
use predicates::prelude::*;
use tempfile::tempdir;

#[test]
fn new_writes_a_manifest_discoverable_by_settings() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let _guard = HomeEnvGuard::set(&home);

    let manifest_dir = temp.path().join("manifests");

    Command::new(assert_cmd::cargo::cargo_bin!("agentsvc"))
        .env("HOME", &home)
        .arg("--manifest-dir")
        .arg(&manifest_dir)
        .arg("new")
        .arg("worker")
        .arg("/usr/bin/worker")
        .arg("--level")
        .arg("20")
        .arg("--")
        .arg("--flag")
        .assert()
        .success()
        .stdout(predicate::str::contains("wrote manifest"));

    let manifest_path = manifest_dir.join("worker.yaml");
    assert!(manifest_path.exists());
    let contents = fs::read_to_string(&manifest_path).unwrap();
    assert!(contents.contains("name: worker"));
    assert!(contents.contains("level: 20"));

    Command::new(assert_cmd::cargo::cargo_bin!("agentsvc"))
        .env("HOME", &home)
        .arg("--manifest-dir")
        .arg(&manifest_dir)
        .arg("settings")
        .assert()
        .success()
        .stdout(predicate::str::contains("1 sub-service"))
        .stdout(predicate::str::contains("1 enabled"));
}

#[test]
fn new_rejects_a_duplicate_name() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let _guard = HomeEnvGuard::set(&home);

    let manifest_dir = temp.path().join("manifests");

    Command::new(assert_cmd::cargo::cargo_bin!("agentsvc"))
        .env("HOME", &home)
        .arg("--manifest-dir")
        .arg(&manifest_dir)
        .arg("new")
        .arg("worker")
        .arg("/usr/bin/worker")
        .assert()
        .success();

    Command::new(assert_cmd::cargo::cargo_bin!("agentsvc"))
        .env("HOME", &home)
        .arg("--manifest-dir")
        .arg(&manifest_dir)
        .arg("new")
        .arg("worker")
        .arg("/usr/bin/other")
        .assert()
        .failure();
}

#[test]
fn list_on_a_fresh_home_reports_no_sub_services() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let _guard = HomeEnvGuard::set(&home);

    Command::new(assert_cmd::cargo::cargo_bin!("agentsvc"))
        .env("HOME", &home)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("no sub-services found"));
}

#[test]
fn list_json_emits_an_empty_array_on_a_fresh_home() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let _guard = HomeEnvGuard::set(&home);

    Command::new(assert_cmd::cargo::cargo_bin!("agentsvc"))
        .env("HOME", &home)
        .arg("list")
        .arg("--json")
        .assert()
        .success()
        .stdout(predicate::eq("[]\n"));
}

#[test]
fn stop_and_resume_without_a_running_supervisor_do_not_fail() {
    let temp = tempdir().expect("tempdir");
    let home = temp.path().join("home");
    fs::create_dir_all(&home).unwrap();
    let _guard = HomeEnvGuard::set(&home);

    Command::new(assert_cmd::cargo::cargo_bin!("agentsvc"))
        .env("HOME", &home)
        .arg("stop")
        .assert()
        .success();

    Command::new(assert_cmd::cargo::cargo_bin!("agentsvc"))
        .env("HOME", &home)
        .arg("resume")
        .assert()
        .success();
}

#[test]
fn sys_flag_requires_root_privileges() {
    if nix::unistd::Uid::effective().is_root() {
        return;
    }

    let output = Command::new(assert_cmd::cargo::cargo_bin!("agentsvc"))
        .arg("--sys")
        .arg("list")
        .output()
        .expect("failed to invoke agentsvc");

    assert!(
        !output.status.success(),
        "--sys should fail when invoked without root"
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("--sys requires root"),
        "stderr should mention missing root privileges: {stderr}"
    );
}
