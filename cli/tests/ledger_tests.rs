use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;

fn write_config(dir: &tempfile::TempDir, file_name: &str, ledger_path: &std::path::Path) -> std::path::PathBuf {
    let config = format!(
        r#"
hosts:
  - name: fenrir-chat
    url: "http://fenrir.local:5000"
    capabilities: ["general"]
    priority: 1
    timeout_seconds: 30
ledger_path: "{}"
"#,
        ledger_path.display()
    );
    let path = dir.path().join(file_name);
    fs::write(&path, config).unwrap();
    path
}

fn config_path(dir: &tempfile::TempDir, ledger_path: &std::path::Path) -> std::path::PathBuf {
    write_config(dir, "config.yaml", ledger_path)
}

#[test]
fn create_then_show_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let ledger_path = dir.path().join("ledger.db");
    let config = config_path(&dir, &ledger_path);

    Command::cargo_bin("yggdrasil")
        .unwrap()
        .args(["--config", config.to_str().unwrap(), "ledger", "create", "--id", "t1", "--type", "text-processing"])
        .assert()
        .success()
        .stdout(predicate::str::contains("created task t1"));

    Command::cargo_bin("yggdrasil")
        .unwrap()
        .args(["--config", config.to_str().unwrap(), "ledger", "show", "t1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("text-processing"));
}

#[test]
fn list_reflects_created_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let ledger_path = dir.path().join("ledger.db");
    let config = config_path(&dir, &ledger_path);

    for id in ["a", "b"] {
        Command::cargo_bin("yggdrasil")
            .unwrap()
            .args(["--config", config.to_str().unwrap(), "ledger", "create", "--id", id, "--type", "embedding"])
            .assert()
            .success();
    }

    Command::cargo_bin("yggdrasil")
        .unwrap()
        .args(["--config", config.to_str().unwrap(), "ledger", "list", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"id\":\"a\"").and(predicate::str::contains("\"id\":\"b\"")));
}

#[test]
fn show_missing_task_fails_with_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let ledger_path = dir.path().join("ledger.db");
    let config = config_path(&dir, &ledger_path);

    Command::cargo_bin("yggdrasil")
        .unwrap()
        .args(["--config", config.to_str().unwrap(), "ledger", "show", "nope"])
        .assert()
        .failure();
}

#[test]
fn export_then_import_round_trips_into_a_fresh_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let ledger_path = dir.path().join("ledger.db");
    let config = config_path(&dir, &ledger_path);

    Command::cargo_bin("yggdrasil")
        .unwrap()
        .args(["--config", config.to_str().unwrap(), "ledger", "create", "--id", "t1", "--type", "text-processing"])
        .assert()
        .success();

    let export_path = dir.path().join("export.jsonl");
    Command::cargo_bin("yggdrasil")
        .unwrap()
        .args(["--config", config.to_str().unwrap(), "ledger", "export", export_path.to_str().unwrap()])
        .assert()
        .success();

    let second_ledger = dir.path().join("ledger2.db");
    let second_config = write_config(&dir, "config2.yaml", &second_ledger);

    Command::cargo_bin("yggdrasil")
        .unwrap()
        .args(["--config", second_config.to_str().unwrap(), "ledger", "import", export_path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("imported 1 task"));
}
