//! Concurrency tests for the peptaide binary.
//!
//! These tests verify that multiple processes can safely:
//! - Append to the event log simultaneously (file locking)
//! - Race on opening a substance's first cycle without duplicating it
//! - Read cycles while writers are active

use assert_cmd::Command;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn cli(data_dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("peptaide"));
    cmd.env("XDG_CONFIG_HOME", data_dir.join("config"))
        .arg("--data-dir")
        .arg(data_dir);
    cmd
}

fn setup_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

fn log_in_background(data_dir: PathBuf, at: &'static str) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        cli(&data_dir)
            .args(["log", "--formulation", "demo_peptide_subq", "--at", at, "1mg"])
            .assert()
            .success();
    })
}

fn read_log_lines(data_dir: &Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(data_dir.join("events.jsonl"))
        .expect("Failed to read event log")
        .lines()
        .map(|l| serde_json::from_str(l).expect("Valid log line"))
        .collect()
}

#[test]
fn test_concurrent_event_logging() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().to_path_buf();

    let handles: Vec<_> = (0..5)
        .map(|_| log_in_background(data_dir.clone(), "2024-03-01T08:00:00Z"))
        .collect();
    for handle in handles {
        handle.join().expect("Logger thread panicked");
    }

    let lines = read_log_lines(&data_dir);
    assert_eq!(lines.len(), 5, "Expected 5 events, got {}", lines.len());
}

#[test]
fn test_racing_first_events_share_one_cycle() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().to_path_buf();

    let handles: Vec<_> = (0..4)
        .map(|_| log_in_background(data_dir.clone(), "2024-03-01T08:00:00Z"))
        .collect();
    for handle in handles {
        handle.join().expect("Logger thread panicked");
    }

    let cycle_ids: HashSet<String> = read_log_lines(&data_dir)
        .iter()
        .map(|l| l["event"]["cycle_instance_id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(cycle_ids.len(), 1, "Events split across cycles: {:?}", cycle_ids);

    let ledger = std::fs::read_to_string(data_dir.join("cycles.json")).unwrap();
    let doc: serde_json::Value = serde_json::from_str(&ledger).unwrap();
    assert_eq!(doc["cycles"].as_array().unwrap().len(), 1);
}

#[test]
fn test_reads_during_writes() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().to_path_buf();

    cli(&data_dir)
        .args(["log", "--formulation", "demo_peptide_subq", "1mg"])
        .assert()
        .success();

    let writer = {
        let data_dir = data_dir.clone();
        thread::spawn(move || {
            for _ in 0..3 {
                cli(&data_dir)
                    .args(["log", "--formulation", "demo_peptide_subq", "1mg"])
                    .assert()
                    .success();
            }
        })
    };

    for i in 0..3 {
        thread::sleep(Duration::from_millis(i * 5));
        cli(&data_dir).arg("cycles").assert().success();
        cli(&data_dir)
            .args(["simulate", "--formulation", "demo_peptide_subq", "1mg"])
            .assert()
            .success();
    }

    writer.join().expect("Writer thread panicked");
    assert_eq!(read_log_lines(&data_dir).len(), 4);
}
