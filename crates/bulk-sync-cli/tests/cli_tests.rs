//! CLI integration tests for bulk-sync.
//!
//! These tests cover argument parsing, help output, exit codes and the
//! subcommands that need no database connection.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

/// Get a command for the bulk-sync binary.
fn cmd() -> Command {
    Command::cargo_bin("bulk-sync").unwrap()
}

fn config_file(watermark: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
source:
  host: source.example
  database: warehouse
  auth:
    method: sql
    user: reader
    password: pw
target:
  host: synapse.example
  database: dw
  auth:
    method: sql
    user: loader
    password: pw
storage:
  kind: memory
watermark:
{watermark}
tables:
  - name: FactSales
    key_column: Id
  - name: DimCustomer
    key_column: CustomerKey
"#
    )
    .unwrap();
    file
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("plan"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("delta"))
        .stdout(predicate::str::contains("reconcile"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("reset"))
        .stdout(predicate::str::contains("health-check"));
}

#[test]
fn test_run_subcommand_help() {
    cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--skip-reconcile"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("bulk-sync"));
}

#[test]
fn test_global_flags_listed() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--table"))
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("--log-format"));
}

// =============================================================================
// Error Handling Tests
// =============================================================================

#[test]
fn test_missing_config_file() {
    cmd()
        .args(["--config", "/nonexistent/bulk-sync.yaml", "status"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("IO error"));
}

#[test]
fn test_invalid_yaml_is_config_exit_code() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "source: [unterminated").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "status"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn test_unknown_verbosity_rejected() {
    cmd()
        .args(["--verbosity", "chatty", "status"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("unknown verbosity"));
}

#[test]
fn test_reset_requires_confirmation() {
    let config = config_file("  backend: memory");
    cmd()
        .args(["--config", config.path().to_str().unwrap(), "reset"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--yes"));
}

#[test]
fn test_unknown_table_rejected() {
    let config = config_file("  backend: memory");
    cmd()
        .args([
            "--config",
            config.path().to_str().unwrap(),
            "--table",
            "Nope",
            "status",
        ])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("unknown table 'Nope'"));
}

// =============================================================================
// Watermark Commands
// =============================================================================

#[test]
fn test_status_of_fresh_tables() {
    let config = config_file("  backend: memory");
    cmd()
        .args(["--config", config.path().to_str().unwrap(), "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("FactSales"))
        .stdout(predicate::str::contains("DimCustomer"))
        .stdout(predicate::str::contains("not_started"));
}

#[test]
fn test_status_json_for_one_table() {
    let config = config_file("  backend: memory");
    let output = cmd()
        .args([
            "--config",
            config.path().to_str().unwrap(),
            "--table",
            "FactSales",
            "--output-json",
            "status",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());

    let records: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let records = records.as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["table"], "FactSales");
    assert_eq!(records[0]["status"], "not_started");
}

#[test]
fn test_reset_with_file_watermarks() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_file(&format!(
        "  backend: file\n  dir: {}",
        dir.path().display()
    ));
    cmd()
        .args([
            "--config",
            config.path().to_str().unwrap(),
            "--table",
            "FactSales",
            "reset",
            "--yes",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cleared watermarks: FactSales"));
}

#[test]
fn test_status_shows_snapshot_and_delta_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let mut wm = bulk_sync::Watermark::new("FactSales");
    wm.set_snapshot_cursor(500).unwrap();
    wm.set_status(bulk_sync::WatermarkStatus::Complete);
    wm.complete_delta(504, 2, 2, 0);
    std::fs::write(
        dir.path().join("FactSales.watermark.json"),
        wm.to_signed_json(b"test-key").unwrap(),
    )
    .unwrap();

    let config = config_file(&format!(
        "  backend: file\n  dir: {}\n  hmac_key: test-key",
        dir.path().display()
    ));
    cmd()
        .args([
            "--config",
            config.path().to_str().unwrap(),
            "--table",
            "FactSales",
            "status",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Snapshot cursor: 500"))
        .stdout(predicate::str::contains("Delta loaded through: 503"));
}
