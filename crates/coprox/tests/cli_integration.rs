//! CLI integration tests for the coprox command-line interface.
//!
//! These tests never reach GitHub: they cover argument parsing and the
//! offline auth subcommands against a temporary hosts file.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Get a command for the coprox binary, isolated in `dir`.
fn coprox(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("coprox").unwrap();
    cmd.current_dir(dir)
        .env("COPROX_CONFIG_DIR", dir)
        .env_remove("COPROX_CONFIG")
        .env_remove("GH_COPILOT_TOKEN")
        .env_remove("HOST")
        .env_remove("PORT")
        .env_remove("API_KEY");
    cmd
}

/// Temp dir with a `coprox.toml` pointing the hosts file inside it.
fn workspace() -> TempDir {
    let dir = TempDir::new().unwrap();
    let hosts = dir.path().join("hosts.json");
    std::fs::write(
        dir.path().join("coprox.toml"),
        format!("[auth]\nhosts_file = {:?}\n", hosts.to_string_lossy()),
    )
    .unwrap();
    dir
}

// ─────────────────────────────────────────────────────────────────────────────
// Help and Version Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_help_displays() {
    let dir = workspace();
    coprox(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("GitHub Copilot"))
        .stdout(predicate::str::contains("start"))
        .stdout(predicate::str::contains("auth"));
}

#[test]
fn test_version_displays() {
    let dir = workspace();
    coprox(dir.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("coprox"));
}

#[test]
fn test_start_help_lists_overrides() {
    let dir = workspace();
    coprox(dir.path())
        .args(["start", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--port"))
        .stdout(predicate::str::contains("--api-key"))
        .stdout(predicate::str::contains("--headless"));
}

#[test]
fn test_start_rejects_invalid_port() {
    let dir = workspace();
    coprox(dir.path())
        .args(["start", "--port", "not-a-port"])
        .assert()
        .failure();
}

#[test]
fn test_start_rejects_conflicting_modes() {
    let dir = workspace();
    coprox(dir.path())
        .args(["start", "--interactive", "--headless"])
        .assert()
        .failure();
}

#[test]
fn test_invalid_port_env_is_reported() {
    let dir = workspace();
    coprox(dir.path())
        .env("PORT", "eighty")
        .args(["auth", "status"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("PORT"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Auth Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_auth_status_without_credentials() {
    let dir = workspace();
    coprox(dir.path())
        .args(["auth", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("GH_COPILOT_TOKEN: not set"))
        .stdout(predicate::str::contains("Not authenticated"));
}

#[test]
fn test_auth_status_reads_env_token() {
    let dir = workspace();
    coprox(dir.path())
        .env("GH_COPILOT_TOKEN", "gho_from_environment")
        .args(["auth", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("GH_COPILOT_TOKEN: gho_fr..."))
        .stdout(predicate::str::contains("Not authenticated").not());
}

#[test]
fn test_auth_status_reads_hosts_file() {
    let dir = workspace();
    std::fs::write(
        dir.path().join("hosts.json"),
        r#"{"github.com": {"oauth_token": "gho_from_file", "user": "octo"}}"#,
    )
    .unwrap();

    coprox(dir.path())
        .args(["auth", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hosts file: gho_fr..."));
}

#[test]
fn test_auth_logout_removes_token() {
    let dir = workspace();
    let hosts = dir.path().join("hosts.json");
    std::fs::write(
        &hosts,
        r#"{"github.com": {"oauth_token": "gho_from_file", "user": "octo"}}"#,
    )
    .unwrap();

    coprox(dir.path())
        .args(["auth", "logout"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Logged out"));

    let contents: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&hosts).unwrap()).unwrap();
    assert!(contents["github.com"].get("oauth_token").is_none());
    assert_eq!(contents["github.com"]["user"], "octo");
}

#[test]
fn test_auth_logout_without_token() {
    let dir = workspace();
    coprox(dir.path())
        .args(["auth", "logout"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No stored token"));
}
