//! CLI integration tests for pg-fleet-migrate.
//!
//! These tests verify command-line argument parsing, help output,
//! exit codes, and the offline `plan` / `validate` commands.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::NamedTempFile;

/// Get a command for the pg-fleet-migrate binary.
fn cmd() -> Command {
    Command::cargo_bin("pg-fleet-migrate").unwrap()
}

fn config_file(yaml: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();
    file
}

const CONSOLIDATE: &str = r#"
mapping:
  strategy: consolidate
  conflict_resolution: prefix
  sources:
    - { project: prod, instance: orders, ip: 10.0.0.1 }
    - { project: prod, instance: billing, ip: 10.0.0.2 }
  targets:
    - { project: prod, instance: central, ip: 10.0.0.9 }
"#;

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("plan"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("health-check"));
}

#[test]
fn test_run_subcommand_help() {
    cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--max-parallel"))
        .stdout(predicate::str::contains("--stop-on-error"))
        .stdout(predicate::str::contains("--retry-failed"))
        .stdout(predicate::str::contains("--include-users"));
}

#[test]
fn test_plan_subcommand_help() {
    cmd()
        .args(["plan", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--estimate"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("pg-fleet-migrate"));
}

#[test]
fn test_global_flags_and_defaults() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--progress"))
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("[default: config.yaml]"))
        .stdout(predicate::str::contains("[default: text]"))
        .stdout(predicate::str::contains("[default: info]"));
}

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

// =============================================================================
// Exit Code Tests
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_7() {
    // Missing file is an IO error (code 7), not config error (code 1)
    cmd()
        .args(["--config", "nonexistent_config_file.yaml", "validate"])
        .assert()
        .code(7);
}

#[test]
fn test_invalid_yaml_exits_with_code_1() {
    let file = config_file("invalid: yaml: content: [\n");
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "validate"])
        .assert()
        .code(1);
}

#[test]
fn test_empty_config_exits_with_code_1() {
    let file = NamedTempFile::new().unwrap();
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "validate"])
        .assert()
        .code(1);
}

#[test]
fn test_unknown_strategy_exits_with_code_1() {
    let file = config_file("mapping:\n  strategy: shuffle\n");
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "validate"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Unknown mapping strategy"));
}

#[test]
fn test_invalid_mapping_exits_with_code_1() {
    let file = config_file(
        "mapping:\n  strategy: simple\n  sources:\n    - { project: prod, instance: a }\n",
    );
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "validate"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("requires at least one target"));
}

#[test]
fn test_zero_max_parallel_override_exits_with_code_1() {
    let file = config_file(CONSOLIDATE);
    cmd()
        .args([
            "--config",
            file.path().to_str().unwrap(),
            "plan",
            "--max-parallel",
            "0",
        ])
        .assert()
        .code(1);
}

// =============================================================================
// Offline Commands
// =============================================================================

#[test]
fn test_validate_reports_task_count() {
    let file = config_file(CONSOLIDATE);
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Mapping is valid"))
        .stdout(predicate::str::contains("N:1"))
        .stdout(predicate::str::contains("2 task(s)"));
}

#[test]
fn test_validate_json_output() {
    let file = config_file(CONSOLIDATE);
    let output = cmd()
        .args([
            "--config",
            file.path().to_str().unwrap(),
            "--output-json",
            "validate",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["valid"], true);
    assert_eq!(json["tasks"], 2);
}

#[test]
fn test_plan_lists_tasks() {
    let file = config_file(CONSOLIDATE);
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "plan"])
        .assert()
        .success()
        .stdout(predicate::str::contains("strategy consolidate"))
        .stdout(predicate::str::contains("task-1 (prod:orders -> prod:central)"))
        .stdout(predicate::str::contains("task-2 (prod:billing -> prod:central)"));
}

#[test]
fn test_plan_json_hides_passwords() {
    let file = config_file(
        r#"
mapping:
  strategy: simple
  sources:
    - { project: prod, instance: a, password: s3cret, ip: 10.0.0.1 }
  targets:
    - { project: prod, instance: b, password: s3cret, ip: 10.0.0.2 }
"#,
    );
    let output = cmd()
        .args(["--config", file.path().to_str().unwrap(), "--output-json", "plan"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(!stdout.contains("s3cret"));
    let json: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(json["plan"]["operations"].as_array().unwrap().len(), 1);
    assert!(json["estimate"].is_null());
}
