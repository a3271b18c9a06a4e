//! Integration tests for the forkpool CLI.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

/// Get a command for the forkpool binary with a clean logging environment.
fn forkpool() -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("forkpool").unwrap();
    cmd.env_remove("RUST_LOG")
        .env_remove("FORKPOOL_LOG")
        .env_remove("FORKPOOL_LOG_FILE")
        .env_remove("FORKPOOL_PROCESSES")
        .env("NO_COLOR", "1");
    cmd
}

#[test]
fn test_help_displays() {
    forkpool()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("map"))
        .stdout(predicate::str::contains("heap"));
}

#[test]
fn test_version_displays() {
    forkpool()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("forkpool "));
}

#[test]
fn test_map_squares_in_order() {
    forkpool()
        .args(["map", "-p", "2", "--", "1", "2", "3", "-4"])
        .assert()
        .success()
        .stdout("1\n4\n9\n16\n");
}

#[test]
fn test_map_json_with_chunksize() {
    forkpool()
        .args(["map", "-p", "3", "-c", "2", "--json", "5", "6", "7", "8", "9"])
        .assert()
        .success()
        .stdout("[25,36,49,64,81]\n");
}

#[test]
fn test_map_unordered_yields_every_result() {
    let output = forkpool()
        .args(["map", "-p", "2", "--unordered", "1", "2", "3", "4", "5"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let mut values: Vec<i64> = String::from_utf8(output.stdout)
        .unwrap()
        .lines()
        .map(|l| l.parse().unwrap())
        .collect();
    values.sort_unstable();
    assert_eq!(values, vec![1, 4, 9, 16, 25]);
}

#[test]
fn test_map_overflow_reports_task_error() {
    forkpool()
        .args(["map", "-p", "1", "3037000500"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"))
        .stderr(predicate::str::contains("overflows"));
}

#[test]
fn test_run_summary() {
    forkpool()
        .args(["run", "-p", "2", "-t", "6", "--sleep-ms", "10"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Ran 6 tasks"))
        .stdout(predicate::str::contains("succeeded: 6"))
        .stdout(predicate::str::contains("failed:    0"));
}

#[test]
fn test_run_json_summary() {
    let output = forkpool()
        .args(["run", "-p", "2", "-t", "4", "--sleep-ms", "5", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["tasks"], 4);
    assert_eq!(summary["succeeded"], 4);
    assert_eq!(summary["failed"], 0);
    assert_eq!(summary["stats"]["processes"], 2);
    assert!(summary["distinct_workers"].as_u64().unwrap() >= 1);
}

#[test]
fn test_run_with_recycling() {
    let output = forkpool()
        .args([
            "run",
            "-p",
            "1",
            "-t",
            "4",
            "--sleep-ms",
            "1",
            "--max-tasks-per-child",
            "1",
            "--json",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());

    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["succeeded"], 4);
    // Every task ran in a fresh worker.
    assert_eq!(summary["distinct_workers"], 4);
    assert_eq!(summary["stats"]["restarts"], 0);
}

#[test]
fn test_run_hard_timeout_fails_tasks() {
    forkpool()
        .args(["run", "-p", "1", "-t", "1", "--sleep-ms", "5000", "--timeout", "0.2"])
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .success()
        .stdout(predicate::str::contains("failed:    1"));
}

#[test]
fn test_run_rejects_zero_processes() {
    forkpool()
        .args(["run", "-p", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("at least 1"));
}

#[test]
fn test_heap_prints_arena_table() {
    forkpool()
        .args(["heap", "-n", "8", "-s", "128"])
        .assert()
        .success()
        .stdout(predicate::str::contains("allocated"))
        .stdout(predicate::str::contains("1024"));
}

#[test]
fn test_heap_fragment() {
    forkpool()
        .args(["heap", "-n", "8", "-s", "64", "--fragment"])
        .assert()
        .success()
        .stdout(predicate::str::contains("holes"));
}

#[test]
fn test_heap_rejects_oversized_block() {
    forkpool()
        .args(["heap", "-n", "1", "-s", "1099511627777"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_log_file_is_written() {
    let dir = tempdir().unwrap();
    let log_path = dir.path().join("forkpool.log");

    forkpool()
        .args(["-v", "--log-format", "json", "map", "-p", "1", "2"])
        .env("FORKPOOL_LOG_FILE", &log_path)
        .assert()
        .success()
        .stdout("4\n");

    let written: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("forkpool.log"))
        .collect();
    assert!(!written.is_empty());
    let contents = std::fs::read_to_string(written[0].path()).unwrap();
    assert!(contents.contains("Pool started"));
}

#[test]
fn test_quiet_and_verbose_conflict() {
    forkpool()
        .args(["-q", "-v", "heap"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}
