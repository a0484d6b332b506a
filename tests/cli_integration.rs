//! Integration tests for CLI commands.
//!
//! These tests verify that CLI commands work correctly without
//! requiring audio hardware.

use assert_cmd::Command;
use predicates::prelude::*;

/// Get a Command for the audiosonde binary
fn audiosonde() -> Command {
    Command::cargo_bin("audiosonde").unwrap()
}

#[test]
fn test_help_command() {
    audiosonde()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("history ring"))
        .stdout(predicate::str::contains("devices"))
        .stdout(predicate::str::contains("monitor"))
        .stdout(predicate::str::contains("record"));
}

#[test]
fn test_version_command() {
    audiosonde()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("audiosonde"));
}

#[test]
fn test_record_rejects_nonpositive_duration() {
    audiosonde()
        .args(["record", "--output", "/tmp/unused.wav", "-n", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("duration must be positive"));
}

#[test]
fn test_unknown_subcommand_fails() {
    audiosonde().arg("frobnicate").assert().failure();
}
