//! CLI tests for the `orion` binary.
//!
//! Spawns the binary in a temp directory and checks exit codes and the JSON
//! it prints for the offline commands.

use std::fs;
use std::process::Command;

use serde_json::Value;

use orion::exit_codes;
use orion::io::config::CONFIG_FILE;

fn orion(dir: &std::path::Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_orion"))
        .current_dir(dir)
        .args(args)
        .output()
        .expect("spawn orion")
}

#[test]
fn init_writes_config_and_state_dir() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = orion(temp.path(), &["init"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(temp.path().join(CONFIG_FILE).is_file());
    assert!(temp.path().join(".orion").is_dir());

    let output = orion(temp.path(), &["validate"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
}

#[test]
fn init_keeps_existing_config_without_force() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join(CONFIG_FILE);
    fs::write(&path, "state_dir = \"custom-state\"\n").expect("write");

    let output = orion(temp.path(), &["init"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(
        fs::read_to_string(&path).expect("read"),
        "state_dir = \"custom-state\"\n"
    );
    assert!(temp.path().join("custom-state").is_dir());
}

#[test]
fn validate_rejects_zero_interval() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(
        temp.path().join(CONFIG_FILE),
        "[cycle]\ninterval_secs = 0\n",
    )
    .expect("write");

    let output = orion(temp.path(), &["validate"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("cycle.interval_secs"), "{stderr}");
}

#[test]
fn status_of_fresh_state_is_empty_json() {
    let temp = tempfile::tempdir().expect("tempdir");
    assert_eq!(
        orion(temp.path(), &["init"]).status.code(),
        Some(exit_codes::OK)
    );

    let output = orion(temp.path(), &["status"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let report: Value = serde_json::from_slice(&output.stdout).expect("status json");
    assert_eq!(report["instances"], Value::Array(Vec::new()));
    assert_eq!(report["pending_decisions"], Value::Array(Vec::new()));

    let output = orion(temp.path(), &["commands", "--limit", "5"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(output.stdout.is_empty());
}
