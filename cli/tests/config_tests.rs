use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;

#[test]
fn validate_rejects_a_config_with_no_hosts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    fs::write(&path, "poll_interval_seconds: 2\n").unwrap();

    Command::cargo_bin("yggdrasil")
        .unwrap()
        .args(["--config", path.to_str().unwrap(), "config", "validate"])
        .assert()
        .failure();
}

#[test]
fn validate_accepts_a_config_with_one_host() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    fs::write(
        &path,
        r#"
hosts:
  - name: fenrir-chat
    url: "http://fenrir.local:5000"
    capabilities: ["general"]
    priority: 1
    timeout_seconds: 30
"#,
    )
    .unwrap();

    Command::cargo_bin("yggdrasil")
        .unwrap()
        .args(["--config", path.to_str().unwrap(), "config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("configuration is valid"));
}

#[test]
fn show_prints_the_merged_yaml() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    fs::write(
        &path,
        r#"
poll_interval_seconds: 7
hosts:
  - name: fenrir-chat
    url: "http://fenrir.local:5000"
    capabilities: ["general"]
    priority: 1
    timeout_seconds: 30
"#,
    )
    .unwrap();

    Command::cargo_bin("yggdrasil")
        .unwrap()
        .args(["--config", path.to_str().unwrap(), "config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("poll_interval_seconds: 7"));
}
