//! CLI integration tests for imgforge.
//!
//! Every test runs against a throwaway config whose directories all live in a
//! temp dir, and whose `qm` path does not exist, so nothing can reach a real
//! hypervisor.

use std::fs;
use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use tempfile::TempDir;

const CATALOG: &str = r#"
[[image]]
id = "debian-12"
label = "Debian 12"
vmid = 9000
name = "debian-12-cloud"
source = "https://cloud.debian.org/images/cloud/bookworm/latest/debian-12-generic-amd64.qcow2"
packages = ["qemu-guest-agent"]

[[image]]
id = "ubuntu-noble"
label = "Ubuntu 24.04"
vmid = 9001
name = "ubuntu-2404-cloud"
source = "https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-amd64.img"
"#;

/// Get the imgforge binary command, isolated from the caller's environment.
fn imgforge(root: &Path) -> Command {
    let mut cmd = Command::cargo_bin("imgforge").unwrap();
    cmd.env_remove("IMGFORGE_CONFIG")
        .env_remove("IMGFORGE_CATALOG")
        .env_remove("RUST_LOG")
        .current_dir(root)
        .arg("--config")
        .arg(root.join("imgforge.toml"));
    cmd
}

/// A temp dir holding `imgforge.toml` and `catalog.toml`.
fn setup(catalog: &str) -> TempDir {
    let tmp = TempDir::new().unwrap();
    let config = r#"
[paths]
catalog = "catalog.toml"
cache_dir = "cache"
state_dir = "state"
work_dir = "work"
log_dir = "logs"

[host]
qm = "/nonexistent/qm"

[build]
resize_delay_secs = 0
"#;
    fs::write(tmp.path().join("imgforge.toml"), config).unwrap();
    fs::write(tmp.path().join("catalog.toml"), catalog).unwrap();
    tmp
}

// ============================================================================
// imgforge build --validate-only
// ============================================================================

#[test]
fn test_validate_only_accepts_valid_catalog() {
    let tmp = setup(CATALOG);

    imgforge(tmp.path())
        .args(["build", "--validate-only"])
        .assert()
        .success()
        .stderr(predicate::str::contains("2 image(s)"));
}

#[test]
fn test_duplicate_vmid_fails_validation() {
    let duplicate = CATALOG.replace("vmid = 9001", "vmid = 9000");
    let tmp = setup(&duplicate);

    imgforge(tmp.path())
        .args(["build", "--all"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("duplicate vmid 9000"))
        .stderr(predicate::str::contains("nothing was built"));

    assert!(!tmp.path().join("state").exists());
    assert!(!tmp.path().join("cache").exists());
}

#[test]
fn test_missing_config_is_reported() {
    let tmp = TempDir::new().unwrap();

    imgforge(tmp.path())
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("config file not found"));
}

// ============================================================================
// imgforge build
// ============================================================================

#[test]
fn test_dry_run_changes_nothing() {
    let tmp = setup(CATALOG);

    imgforge(tmp.path())
        .args(["build", "--all", "--dry-run", "--no-change-tracking"])
        .assert()
        .success()
        .stderr(predicate::str::contains("would build"))
        .stderr(predicate::str::contains("Debian 12"))
        .stderr(predicate::str::contains("Ubuntu 24.04"));

    let state = tmp.path().join("state");
    assert!(!state.exists() || fs::read_dir(&state).unwrap().next().is_none());
    assert!(!tmp
        .path()
        .join("cache")
        .join("debian-12-generic-amd64.qcow2")
        .exists());

    let logs: Vec<_> = fs::read_dir(tmp.path().join("logs"))
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].starts_with("imgforge-") && logs[0].ends_with(".log"));
}

#[test]
fn test_json_events_on_stdout() {
    let tmp = setup(CATALOG);

    let output = imgforge(tmp.path())
        .args([
            "build",
            "Debian 12",
            "--dry-run",
            "--no-change-tracking",
            "--message-format",
            "json",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());

    let events: Vec<serde_json::Value> = String::from_utf8(output.stdout)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    assert_eq!(events.first().unwrap()["reason"], "artifact-started");
    assert_eq!(events.first().unwrap()["vmid"], 9000);
    let last = events.last().unwrap();
    assert_eq!(last["reason"], "build-finished");
    assert_eq!(last["success"], true);
    assert_eq!(last["built"], 1);
}

#[test]
fn test_no_selection_without_terminal() {
    let tmp = setup(CATALOG);

    imgforge(tmp.path())
        .arg("build")
        .assert()
        .failure()
        .stderr(predicate::str::contains("stdin is not a terminal"))
        .stderr(predicate::str::contains("--all"));
}

#[test]
fn test_unknown_labels_only() {
    let tmp = setup(CATALOG);

    imgforge(tmp.path())
        .args(["build", "Arch", "--dry-run"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown label(s): Arch"));
}

// ============================================================================
// imgforge list / state
// ============================================================================

#[test]
fn test_list_prints_catalog() {
    let tmp = setup(CATALOG);

    imgforge(tmp.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("Debian 12"))
        .stdout(predicate::str::contains("9001"));
}

#[test]
fn test_state_show_empty() {
    let tmp = setup(CATALOG);

    imgforge(tmp.path())
        .args(["state", "show"])
        .assert()
        .success()
        .stderr(predicate::str::contains("no state recorded"));
}

#[test]
fn test_state_show_and_clear() {
    let tmp = setup(CATALOG);
    let state = tmp.path().join("state");
    fs::create_dir_all(&state).unwrap();
    fs::write(
        state.join("9000.json"),
        r#"{"source_mtime": 1700000000, "signature": "feedface"}"#,
    )
    .unwrap();

    imgforge(tmp.path())
        .args(["state", "show", "9000"])
        .assert()
        .success()
        .stdout(predicate::str::contains("feedface"))
        .stdout(predicate::str::contains("1700000000"));

    imgforge(tmp.path())
        .args(["state", "clear", "9000"])
        .assert()
        .success()
        .stderr(predicate::str::contains("cleared state for vmid 9000"));

    assert!(!state.join("9000.json").exists());
}

// ============================================================================
// imgforge completions
// ============================================================================

#[test]
fn test_completions_bash() {
    let tmp = TempDir::new().unwrap();

    Command::cargo_bin("imgforge")
        .unwrap()
        .current_dir(tmp.path())
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("imgforge"));
}
