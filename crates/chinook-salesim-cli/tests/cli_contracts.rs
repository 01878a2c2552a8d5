#![allow(clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rusqlite::Connection;
use serde_json::Value;
use tempfile::TempDir;

fn salesim_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_salesim") {
        Ok(value) => PathBuf::from(value),
        Err(_) => PathBuf::from(env!("CARGO_BIN_EXE_salesim")),
    }
}

fn salesim_output(db_path: &Path, log_dir: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(salesim_binary_path());
    command.arg("--db").arg(db_path);
    command.arg("--log-dir").arg(log_dir);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run salesim command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn fixture_dirs() -> (TempDir, PathBuf, PathBuf) {
    let dir = match TempDir::new() {
        Ok(value) => value,
        Err(err) => panic!("failed to create temp dir: {err}"),
    };
    let db_path = dir.path().join("sales.sqlite3");
    let log_dir = dir.path().join("simulation_logs");
    (dir, db_path, log_dir)
}

fn log_files(log_dir: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(log_dir) {
        Ok(value) => value,
        Err(_) => return Vec::new(),
    };
    let mut paths = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(value) => value,
            Err(err) => panic!("failed to read log dir entry: {err}"),
        };
        paths.push(entry.path());
    }
    paths.sort();
    paths
}

fn read_log_json(path: &Path) -> Value {
    let body = match std::fs::read_to_string(path) {
        Ok(value) => value,
        Err(err) => panic!("failed to read log artifact {}: {err}", path.display()),
    };
    match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(err) => panic!("failed to parse log artifact {}: {err}", path.display()),
    }
}

fn count_invoices(db_path: &Path) -> i64 {
    let conn = match Connection::open(db_path) {
        Ok(value) => value,
        Err(err) => panic!("failed to open db for inspection: {err}"),
    };
    match conn.query_row("SELECT COUNT(*) FROM invoices", [], |row| row.get(0)) {
        Ok(value) => value,
        Err(err) => panic!("failed to count invoices: {err}"),
    }
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(salesim_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["setup", "simulate", "verify", "--db", "--log-dir"] {
        assert!(
            stdout.contains(required),
            "expected help output to contain {required}; output={stdout}"
        );
    }
}

#[test]
fn simulate_without_setup_fails_validation_and_writes_no_log() {
    let (_dir, db_path, log_dir) = fixture_dirs();

    let output = salesim_output(&db_path, &log_dir, &["simulate", "--inserts", "1"]);
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("missing required database objects"),
        "expected validation failure naming missing objects, got stderr={stderr}"
    );
    assert!(
        log_files(&log_dir).is_empty(),
        "a failed run must not leave a log artifact behind"
    );
}

#[test]
fn setup_then_simulate_writes_one_log_and_verify_passes() {
    let (_dir, db_path, log_dir) = fixture_dirs();

    let setup = salesim_output(&db_path, &log_dir, &["setup"]);
    assert!(
        setup.status.success(),
        "setup failed: {}",
        String::from_utf8_lossy(&setup.stderr)
    );

    let simulate = salesim_output(
        &db_path,
        &log_dir,
        &["simulate", "--inserts", "3", "--json"],
    );
    assert!(
        simulate.status.success(),
        "simulate failed: {}",
        String::from_utf8_lossy(&simulate.stderr)
    );

    let summary = stdout_json(&simulate);
    assert_eq!(summary["stats"]["committed_inserts"], 3);
    assert_eq!(summary["stats"]["noop_operations"], 0);
    assert_eq!(summary["d1_date"].as_str().map(str::len), Some(10));

    let logs = log_files(&log_dir);
    assert_eq!(logs.len(), 1, "expected exactly one log artifact");
    let name = logs[0].file_name().and_then(|n| n.to_str()).unwrap_or("");
    assert!(
        name.starts_with("sim-run-") && name.ends_with(".json"),
        "unexpected log artifact name {name}"
    );

    let log = read_log_json(&logs[0]);
    let operations = match log["operations"].as_array() {
        Some(value) => value,
        None => panic!("log artifact has no operations array"),
    };
    assert_eq!(operations.len(), 3);
    for operation in operations {
        assert_eq!(operation["kind"], "insert");
        assert!(operation["invoice_id"].is_i64());
        assert!(operation["total"].is_number());
    }

    let verify = salesim_output(&db_path, &log_dir, &["verify", "--json"]);
    assert!(
        verify.status.success(),
        "verify failed: {}",
        String::from_utf8_lossy(&verify.stderr)
    );
    let report = stdout_json(&verify);
    assert_eq!(report["inserts_checked"], 3);
    assert_eq!(report["mismatches"], Value::Array(Vec::new()));
}

#[test]
fn updates_and_deletes_on_empty_window_become_noop_records() {
    let (_dir, db_path, log_dir) = fixture_dirs();

    let setup = salesim_output(&db_path, &log_dir, &["setup"]);
    assert!(setup.status.success());

    // Fresh database: no D-1 invoices exist, so every update and delete
    // call finds no eligible row and is logged as a no-op.
    let simulate = salesim_output(
        &db_path,
        &log_dir,
        &[
            "simulate",
            "--inserts",
            "0",
            "--updates",
            "2",
            "--deletes",
            "1",
        ],
    );
    assert!(
        simulate.status.success(),
        "simulate failed: {}",
        String::from_utf8_lossy(&simulate.stderr)
    );

    let logs = log_files(&log_dir);
    assert_eq!(logs.len(), 1);
    let log = read_log_json(&logs[0]);
    let operations = match log["operations"].as_array() {
        Some(value) => value,
        None => panic!("log artifact has no operations array"),
    };
    assert_eq!(operations.len(), 3);
    for operation in operations {
        assert!(operation["invoice_id"].is_null());
    }

    let verify = salesim_output(&db_path, &log_dir, &["verify", "--json"]);
    assert!(verify.status.success());
    let report = stdout_json(&verify);
    assert_eq!(report["noop_records"], 3);
    assert_eq!(report["mismatches"], Value::Array(Vec::new()));
}

#[test]
fn mid_batch_failure_rolls_back_and_leaves_no_log() {
    let (_dir, db_path, log_dir) = fixture_dirs();

    let setup = salesim_output(&db_path, &log_dir, &["setup"]);
    assert!(setup.status.success());

    {
        let conn = match Connection::open(&db_path) {
            Ok(value) => value,
            Err(err) => panic!("failed to open db for sabotage: {err}"),
        };
        if let Err(err) = conn.execute_batch("DROP TABLE invoice_lines") {
            panic!("failed to drop invoice_lines: {err}");
        }
    }

    let simulate = salesim_output(&db_path, &log_dir, &["simulate", "--inserts", "3"]);
    assert!(!simulate.status.success());
    let stderr = String::from_utf8_lossy(&simulate.stderr);
    assert!(
        stderr.contains("rolling back"),
        "expected rollback context in error, got stderr={stderr}"
    );

    assert!(
        log_files(&log_dir).is_empty(),
        "a rolled-back run must not leave a log artifact behind"
    );
    assert_eq!(count_invoices(&db_path), 0, "rollback must leave no rows");
}

#[test]
fn verify_with_no_log_fails_before_touching_the_database() {
    let (_dir, db_path, log_dir) = fixture_dirs();

    let output = salesim_output(&db_path, &log_dir, &["verify"]);
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("no simulation log found"),
        "expected missing-log error, got stderr={stderr}"
    );
    assert!(
        !db_path.exists(),
        "verify must not create a database file as a side effect"
    );
}

#[test]
fn verify_detects_tampered_invoice_totals() {
    let (_dir, db_path, log_dir) = fixture_dirs();

    let setup = salesim_output(&db_path, &log_dir, &["setup"]);
    assert!(setup.status.success());
    let simulate = salesim_output(&db_path, &log_dir, &["simulate", "--inserts", "2"]);
    assert!(
        simulate.status.success(),
        "simulate failed: {}",
        String::from_utf8_lossy(&simulate.stderr)
    );

    {
        let conn = match Connection::open(&db_path) {
            Ok(value) => value,
            Err(err) => panic!("failed to open db for tampering: {err}"),
        };
        if let Err(err) = conn.execute_batch("UPDATE invoices SET total = total + 1.0") {
            panic!("failed to tamper with totals: {err}");
        }
    }

    let verify = salesim_output(&db_path, &log_dir, &["verify", "--json"]);
    assert!(
        !verify.status.success(),
        "verify must exit non-zero on mismatches"
    );
    let report = stdout_json(&verify);
    let mismatches = match report["mismatches"].as_array() {
        Some(value) => value,
        None => panic!("report has no mismatches array"),
    };
    assert_eq!(mismatches.len(), 2);
    for mismatch in mismatches {
        assert_eq!(mismatch["kind"], "insert");
    }
}
