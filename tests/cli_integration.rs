//! CLI Integration Tests
//!
//! Tests the command-line interface end-to-end with mock providers.

use assert_cmd::Command;
use assert_fs::prelude::*;
use assert_fs::TempDir;
use predicates::prelude::*;

/// Get the binary to test.
fn assetrun() -> Command {
    Command::cargo_bin("assetrun").unwrap()
}

const CONFIG: &str = r#"
[budget]
sample = 1.0
production = 5.0

[pipeline]
concurrency = 2
sample_size = 2
assets = "assets.yaml"
output_dir = "out"
manifest_dir = "state/manifests"
approval_dir = "state/approvals"

[[providers]]
id = "writer"
role = "prompt"
backend = "mock"
cost = 0.02
capabilities = ["text"]

[[providers]]
id = "painter"
role = "image"
backend = "mock"
cost = 0.04
capabilities = ["image"]
"#;

const CATALOG: &str = r"
assets:
  - category: icon
    name: habit-tracker
  - category: icon
    name: reading-list
  - category: cover
    name: quarterly-review
";

/// Temp project with a config and asset catalog.
fn project() -> TempDir {
    let temp = TempDir::new().unwrap();
    temp.child("assetrun.toml").write_str(CONFIG).unwrap();
    temp.child("assets.yaml").write_str(CATALOG).unwrap();
    temp
}

fn in_project(temp: &TempDir) -> Command {
    let mut cmd = assetrun();
    cmd.current_dir(temp.path()).env_remove("RUST_LOG");
    cmd
}

/// Id of the only manifest written so far.
fn single_session(temp: &TempDir) -> String {
    let entries: Vec<_> = std::fs::read_dir(temp.path().join("state/manifests"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    assert_eq!(entries.len(), 1, "expected one manifest, found {entries:?}");
    entries[0].file_stem().unwrap().to_string_lossy().into_owned()
}

// ============================================================================
// Help & Version Tests
// ============================================================================

#[test]
fn test_help_flag() {
    assetrun()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Budget-safe AI asset generation"));
}

#[test]
fn test_version_flag() {
    assetrun()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_completions() {
    assetrun().args(["completions", "bash"]).assert().success().stdout(predicate::str::contains("assetrun"));
}

#[test]
fn test_rejects_unsafe_session_id() {
    assetrun().args(["approve", "../escape"]).assert().failure().stderr(predicate::str::contains("invalid session id"));
}

// ============================================================================
// Config & Validate Tests
// ============================================================================

#[test]
fn test_config_prints_effective_config() {
    let temp = project();
    in_project(&temp)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[budget]"))
        .stdout(predicate::str::contains("painter"));
}

#[test]
fn test_validate_ok() {
    let temp = project();
    in_project(&temp)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Asset catalog OK: 3 asset(s)"));
}

#[test]
fn test_validate_rejects_duplicate_assets() {
    let temp = project();
    temp.child("dupes.yaml")
        .write_str("assets:\n  - {category: icon, name: a}\n  - {category: icon, name: a}\n")
        .unwrap();
    in_project(&temp)
        .args(["validate", "--assets", "dupes.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("duplicate asset key"));
}

#[test]
fn test_invalid_config_fails_fast() {
    let temp = project();
    temp.child("bad.toml").write_str("[pipeline]\nconcurrency = 0\n").unwrap();
    in_project(&temp)
        .args(["--config", "bad.toml", "status"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("concurrency"));
}

// ============================================================================
// Session Tests
// ============================================================================

#[test]
fn test_status_without_sessions() {
    let temp = project();
    in_project(&temp).arg("status").assert().success().stdout(predicate::str::contains("No sessions recorded"));
}

#[test]
fn test_sample_approve_produce() {
    let temp = project();

    in_project(&temp)
        .args(["--dry-run", "sample"])
        .assert()
        .success()
        .stdout(predicate::str::contains("AWAITING_APPROVAL"))
        .stdout(predicate::str::contains("assetrun approve"));
    let session = single_session(&temp);
    temp.child(format!("out/samples/{session}/icon/habit-tracker.png")).assert(predicate::path::exists());

    in_project(&temp)
        .args(["--dry-run", "produce", "--after", &session])
        .assert()
        .failure()
        .stderr(predicate::str::contains("approval token"));

    in_project(&temp).args(["approve", &session]).assert().success();
    temp.child(format!("state/approvals/{session}.approved")).assert(predicate::path::exists());

    in_project(&temp)
        .args(["--dry-run", "produce", "--after", &session])
        .assert()
        .success()
        .stdout(predicate::str::contains("COMPLETED"))
        .stdout(predicate::str::contains("3 committed"));
    temp.child("out/cover/quarterly-review.png").assert(predicate::path::exists());
    temp.child(format!("state/approvals/{session}.approved")).assert(predicate::path::missing());

    in_project(&temp)
        .args(["status", &session, "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"mode\": \"sample\""));
}
