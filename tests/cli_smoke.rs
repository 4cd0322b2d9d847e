//! CLI surface smoke tests: help, envelopes, exit codes.

mod support;

use predicates::str::contains;
use serde_json::Value;

use support::{lattice_cmd, lattice_cmd_in, TestTracker};

#[test]
fn lattice_help_works() {
    let tracker = TestTracker::init(None).unwrap();
    lattice_cmd(&tracker)
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("event-sourced work tracking"));
}

#[test]
fn subcommand_help_works() {
    let tracker = TestTracker::init(None).unwrap();
    let subcommands = [
        "init", "create", "show", "list", "log", "status", "assign", "field", "comment", "link",
        "unlink", "attach", "branch", "archive", "unarchive", "rebuild", "doctor", "artifact",
        "resource",
    ];

    for cmd in subcommands {
        lattice_cmd(&tracker).arg(cmd).arg("--help").assert().success();
    }
}

#[test]
fn robot_help_prints_contract() {
    let tracker = TestTracker::init(None).unwrap();
    lattice_cmd(&tracker)
        .arg("--robot-help")
        .assert()
        .success()
        .stdout(contains("Exit codes"))
        .stdout(contains(".lattice/events/"));
}

#[test]
fn init_create_show_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;

    lattice_cmd_in(dir.path())
        .args(["init", "--project-code", "LAT"])
        .assert()
        .success();

    let output = lattice_cmd_in(dir.path())
        .args([
            "create",
            "First task",
            "--type",
            "feature",
            "--actor",
            "human:ana",
            "--json",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let envelope: Value = serde_json::from_slice(&output)?;
    assert_eq!(envelope["ok"], Value::Bool(true));
    assert_eq!(envelope["data"]["short_id"], "LAT-1");
    assert_eq!(envelope["data"]["status"], "backlog");

    let output = lattice_cmd_in(dir.path())
        .args(["show", "LAT-1", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let envelope: Value = serde_json::from_slice(&output)?;
    assert_eq!(envelope["data"]["task"]["title"], "First task");

    Ok(())
}

#[test]
fn domain_errors_exit_one_with_error_envelope() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    lattice_cmd_in(dir.path())
        .args(["init", "--project-code", "LAT"])
        .assert()
        .success();
    lattice_cmd_in(dir.path())
        .args(["create", "T", "--actor", "human:ana"])
        .assert()
        .success();

    let output = lattice_cmd_in(dir.path())
        .args([
            "status",
            "LAT-1",
            "in_progress",
            "--actor",
            "agent:c",
            "--json",
        ])
        .assert()
        .code(1)
        .get_output()
        .stdout
        .clone();

    let envelope: Value = serde_json::from_slice(&output)?;
    assert_eq!(envelope["ok"], Value::Bool(false));
    assert_eq!(envelope["error"]["code"], "INVALID_TRANSITION");

    Ok(())
}

#[test]
fn missing_store_is_not_initialized() {
    let dir = tempfile::tempdir().unwrap();
    lattice_cmd_in(dir.path())
        .args(["list"])
        .assert()
        .code(1)
        .stderr(contains("No .lattice directory"));
}

#[test]
fn invalid_actor_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    lattice_cmd_in(dir.path()).args(["init"]).assert().success();

    lattice_cmd_in(dir.path())
        .args(["create", "T", "--actor", "somebody"])
        .assert()
        .code(1)
        .stderr(contains("Invalid actor"));
}

#[test]
fn doctor_runs_clean_on_fresh_store() {
    let dir = tempfile::tempdir().unwrap();
    lattice_cmd_in(dir.path()).args(["init"]).assert().success();

    lattice_cmd_in(dir.path())
        .args(["doctor"])
        .assert()
        .success()
        .stdout(contains("clean"));
}

#[test]
fn resource_acquire_release_via_cli() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    lattice_cmd_in(dir.path()).args(["init"]).assert().success();

    let output = lattice_cmd_in(dir.path())
        .args([
            "resource",
            "acquire",
            "gpu-0",
            "--ttl",
            "1h",
            "--actor",
            "agent:claude",
            "--json",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let envelope: Value = serde_json::from_slice(&output)?;
    assert_eq!(envelope["data"]["status"], "held");
    assert_eq!(envelope["data"]["holder"]["actor"], "agent:claude");

    lattice_cmd_in(dir.path())
        .args([
            "resource",
            "release",
            "gpu-0",
            "--actor",
            "agent:claude",
        ])
        .assert()
        .success();

    Ok(())
}
