//! Command line parsing tests
//!
//! These tests pin down the argument names and value formats of `fdist-dird`. Changing one of
//! them breaks existing start scripts, so only do it on purpose.

use assert_cmd::Command;
use predicates::prelude::*;

fn write_rules(root: &std::path::Path) -> std::path::PathBuf {
    let rules = root.join("dir.rules");
    std::fs::write(
        &rules,
        format!(
            "[directory] {}/in\n[files]\n*\n\n[destination]\n[recipient]\nftp://user@host.example.com/out\n",
            root.display()
        ),
    )
    .unwrap();
    rules
}

#[test]
fn test_help_runs() {
    Command::cargo_bin("fdist-dird")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--rules"));
}

#[test]
fn test_version_runs() {
    Command::cargo_bin("fdist-dird")
        .unwrap()
        .arg("--version")
        .assert()
        .success();
}

#[test]
fn test_rules_are_required() {
    Command::cargo_bin("fdist-dird")
        .unwrap()
        .args(["--work-dir", "/tmp"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--rules"));
}

#[test]
fn test_durations_accept_human_formats() {
    for value in ["5s", "1m", "2h 30m", "1day"] {
        Command::cargo_bin("fdist-dird")
            .unwrap()
            .args(["--check-interval", value, "--help"])
            .assert()
            .success();
    }
}

#[test]
fn test_sizes_accept_units() {
    for value in ["1024", "10MiB", "1GB"] {
        Command::cargo_bin("fdist-dird")
            .unwrap()
            .args(["--max-copied-size", value, "--table-budget", value, "--help"])
            .assert()
            .success();
    }
}

#[test]
fn test_priority_must_be_a_digit() {
    Command::cargo_bin("fdist-dird")
        .unwrap()
        .args([
            "--rules",
            "dir.rules",
            "--work-dir",
            "/tmp",
            "--default-priority",
            "12",
        ])
        .assert()
        .failure();
}

#[test]
fn test_source_dir_mode_is_octal() {
    Command::cargo_bin("fdist-dird")
        .unwrap()
        .args(["--source-dir-mode", "789", "--rules", "x", "--work-dir", "/tmp"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid octal mode"));
}

#[test]
fn test_invalid_scan_timeouts_are_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let rules = write_rules(tmp.path());
    Command::cargo_bin("fdist-dird")
        .unwrap()
        .arg("--rules")
        .arg(&rules)
        .arg("--work-dir")
        .arg(tmp.path().join("work"))
        .args(["--full-scan-timeout", "1s", "--one-dir-timeout", "5s", "--once"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("one directory timeout"));
}

#[test]
fn test_once_distributes_and_exits() {
    let tmp = tempfile::tempdir().unwrap();
    let rules = write_rules(tmp.path());
    std::fs::create_dir_all(tmp.path().join("in")).unwrap();
    std::fs::write(tmp.path().join("in").join("report"), "data").unwrap();
    let queue = tmp.path().join("queue.jsonl");
    Command::cargo_bin("fdist-dird")
        .unwrap()
        .arg("--rules")
        .arg(&rules)
        .arg("--work-dir")
        .arg(tmp.path().join("work"))
        .arg("--queue-file")
        .arg(&queue)
        .args(["--once", "--summary"])
        .assert()
        .success()
        .stdout(predicate::str::contains("jobs sent: 1"));
    let content = std::fs::read_to_string(&queue).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 1);
    let message: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(message["files"], serde_json::json!(["report"]));
    assert_eq!(message["host_alias"], "host.example.com");
    assert!(tmp.path().join("work").join("job_table.json").exists());
    assert!(!tmp.path().join("in").join("report").exists());
}
