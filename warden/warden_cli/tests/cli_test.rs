use std::path::PathBuf;
use std::process::{Child, Command as StdCommand};
use std::time::{Duration, Instant};

use assert_cmd::cargo::cargo_bin;
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// A `warden serve` child process that is killed on drop.
struct ServeGuard {
    child: Child,
    socket: PathBuf,
}

impl ServeGuard {
    fn spawn(dir: &TempDir) -> Self {
        let socket = dir.path().join("broker.sock");
        let child = StdCommand::new(cargo_bin("warden"))
            .args(["serve", "--socket"])
            .arg(&socket)
            .spawn()
            .expect("failed to spawn warden serve");

        let guard = Self { child, socket };
        guard.wait_for_socket();
        guard
    }

    fn wait_for_socket(&self) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !self.socket.exists() {
            assert!(
                Instant::now() < deadline,
                "broker socket did not appear in time"
            );
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for ServeGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[test]
fn test_help_lists_subcommands() {
    let mut cmd = Command::cargo_bin("warden").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("zones"))
        .stdout(predicate::str::contains("call"));
}

#[test]
fn test_zones_without_broker_fails() {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("nonexistent.sock");

    let mut cmd = Command::cargo_bin("warden").unwrap();
    cmd.args(["zones", "--socket"])
        .arg(&socket)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to connect"));
}

#[test]
fn test_zones_lists_builtin_catalogue() {
    let dir = TempDir::new().unwrap();
    let _serve = ServeGuard::spawn(&dir);

    let mut cmd = Command::cargo_bin("warden").unwrap();
    cmd.args(["zones", "--socket"])
        .arg(dir.path().join("broker.sock"))
        .assert()
        .success()
        .stdout(predicate::str::contains("warden.diagnostics"))
        .stdout(predicate::str::contains("warden.platform_features"))
        .stdout(predicate::str::contains("elevation_probe"));
}

#[test]
fn test_call_elevation_probe_end_to_end() {
    let dir = TempDir::new().unwrap();
    let _serve = ServeGuard::spawn(&dir);

    let mut cmd = Command::cargo_bin("warden").unwrap();
    cmd.args(["call", "warden.diagnostics", "elevation_probe", "--socket"])
        .arg(dir.path().join("broker.sock"))
        .assert()
        .success()
        .stdout(predicate::str::contains("123"));
}

#[test]
fn test_call_unknown_zone_reports_closed_error_code() {
    let dir = TempDir::new().unwrap();
    let _serve = ServeGuard::spawn(&dir);

    let mut cmd = Command::cargo_bin("warden").unwrap();
    cmd.args(["call", "warden.no_such_zone", "noop", "--socket"])
        .arg(dir.path().join("broker.sock"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown_zone"));
}

#[test]
fn test_call_with_input_payload() {
    let dir = TempDir::new().unwrap();
    let _serve = ServeGuard::spawn(&dir);

    let mut cmd = Command::cargo_bin("warden").unwrap();
    cmd.args([
        "call",
        "warden.platform_features",
        "set_feature",
        "--input",
        r#"{"name": "containers", "enabled": true}"#,
        "--socket",
    ])
    .arg(dir.path().join("broker.sock"))
    .assert()
    .success()
    .stdout(predicate::str::contains("\"enabled\": true"));
}

#[test]
fn test_call_rejects_invalid_json_input() {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("broker.sock");

    // Input validation happens before any connection attempt.
    let mut cmd = Command::cargo_bin("warden").unwrap();
    cmd.args([
        "call",
        "warden.platform_features",
        "set_feature",
        "--input",
        "{not json",
        "--socket",
    ])
    .arg(&socket)
    .assert()
    .failure()
    .stderr(predicate::str::contains("input is not valid JSON"));
}
