// End-to-end checks of the tenant-onboarding binary over a file store

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{json, Value};
use tempfile::TempDir;

fn onboarding(temp_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("tenant-onboarding").unwrap();
    cmd.current_dir(temp_dir.path())
        .env("ONBOARDING_STORAGE__BACKEND", "file")
        .env("ONBOARDING_STORAGE__DIRECTORY", temp_dir.path().join("state"))
        .env("ONBOARDING_OBSERVABILITY__JSON", "false")
        .env("RUST_LOG", "warn");
    cmd
}

fn stdout_json(cmd: &mut Command) -> Value {
    let output = cmd.output().unwrap();
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_help_lists_commands() {
    let temp_dir = TempDir::new().unwrap();
    onboarding(&temp_dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("start"))
        .stdout(predicate::str::contains("resume"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("sweep"));
}

#[test]
fn test_start_resume_status_across_invocations() {
    let temp_dir = TempDir::new().unwrap();

    let started = stdout_json(onboarding(&temp_dir).args([
        "start",
        "--tenant-id",
        "t-cli",
        "--tenant-name",
        "Cli Corp",
        "--tenant-config",
        r#"{"tier":"basic"}"#,
    ]));
    assert_eq!(started["execution"]["state"], json!("RUNNING_PROVISION"));
    let token = started["execution"]["activeCallbackTokenId"]
        .as_str()
        .unwrap()
        .to_string();
    let execution_id = started["execution"]["id"]
        .as_str()
        .unwrap()
        .to_string();
    let requested = started["events"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|e| e["detailType"] == json!("provisioning-requested"))
        .count();
    assert_eq!(requested, 1);

    let resumed = stdout_json(onboarding(&temp_dir).args([
        "resume",
        "--token",
        &token,
        "--outcome",
        "success",
        "--data",
        r#"{"stackId":"s-cli"}"#,
    ]));
    assert_eq!(resumed["response"]["accepted"], json!(true));

    let replayed = stdout_json(onboarding(&temp_dir).args([
        "resume",
        "--token",
        &token,
        "--outcome",
        "success",
    ]));
    assert_eq!(replayed["response"]["accepted"], json!(false));
    assert_eq!(replayed["response"]["reason"], json!("AlreadyConsumed"));

    let tenant = stdout_json(onboarding(&temp_dir).args(["status", "--tenant-id", "t-cli"]));
    assert_eq!(tenant["tenant"]["status"], json!("ACTIVE"));
    assert_eq!(tenant["executions"].as_array().unwrap().len(), 1);

    let execution =
        stdout_json(onboarding(&temp_dir).args(["status", "--execution-id", &execution_id]));
    assert_eq!(execution["execution"]["state"], json!("SUCCEEDED"));
    assert_eq!(execution["deadline"], Value::Null);
}

#[test]
fn test_start_rejects_non_object_config() {
    let temp_dir = TempDir::new().unwrap();
    onboarding(&temp_dir)
        .args([
            "start",
            "--tenant-id",
            "t-bad",
            "--tenant-name",
            "Bad",
            "--tenant-config",
            "[1,2]",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("must be a JSON object"));
}

#[test]
fn test_sweep_with_nothing_overdue() {
    let temp_dir = TempDir::new().unwrap();
    let swept = stdout_json(onboarding(&temp_dir).arg("sweep"));
    assert_eq!(swept["expired"], json!([]));
}

#[test]
fn test_serve_dispatches_stdin_events() {
    let temp_dir = TempDir::new().unwrap();
    let request = json!({
        "source": "saas.control-plane",
        "detailType": "onboarding-request",
        "detail": { "tenantId": "t-serve", "tenantName": "Serve Corp" }
    });

    onboarding(&temp_dir)
        .arg("serve")
        .write_stdin(format!("{request}\nnot json\n"))
        .assert()
        .success()
        .stdout(predicate::str::contains("provisioning-requested"))
        .stdout(predicate::str::contains("onboarding-initiated"))
        .stdout(predicate::str::contains("t-serve"));
}
