//! Smoke tests for the `itsm-sync` binary. None of these reach the network.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn itsm_sync_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("itsm-sync");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/itsm.sqlite"

[sync]
categories = ["Incident", "KnowledgeArticle"]

[source]
base_url = "http://127.0.0.1:9/api"
max_retries = 0

[embedding]
provider = "ollama"
url = "http://127.0.0.1:9"
"#,
        root.display()
    );

    let config_path = config_dir.join("itsm-sync.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_itsm_sync(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = itsm_sync_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run itsm-sync binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_is_idempotent() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_itsm_sync(&config_path, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("Database initialized successfully."));
    assert!(tmp.path().join("data/itsm.sqlite").exists());

    let (_, stderr, success) = run_itsm_sync(&config_path, &["init"]);
    assert!(success, "second init failed: {}", stderr);
}

#[test]
fn test_status_lists_configured_categories() {
    let (_tmp, config_path) = setup_test_env();
    run_itsm_sync(&config_path, &["init"]);

    let (stdout, stderr, success) = run_itsm_sync(&config_path, &["status"]);
    assert!(success, "status failed: {}", stderr);
    assert!(stdout.contains("itsm-sync status: idle"));
    assert!(stdout.contains("Incident"));
    assert!(stdout.contains("KnowledgeArticle"));
    assert!(!stdout.contains("ChangeRequest"));
    assert!(stdout.contains("total artifacts: 0"));
}

#[test]
fn test_sync_unknown_category_fails() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_itsm_sync(&config_path, &["sync", "Problem"]);
    assert!(!success);
    assert!(stderr.contains("unknown category"), "stderr: {}", stderr);
}

#[test]
fn test_sync_unreachable_source_reports_failure() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_itsm_sync(&config_path, &["sync", "Incident"]);
    assert!(!success);
    assert!(stdout.contains("status: failed"), "stdout: {}", stdout);

    let (stdout, _, _) = run_itsm_sync(&config_path, &["status"]);
    assert!(stdout.contains("failed"));
}

#[test]
fn test_release_stale_with_nothing_held() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_itsm_sync(&config_path, &["release-stale"]);
    assert!(success, "release-stale failed: {}", stderr);
    assert!(stdout.contains("released stale locks: 0"));
}

#[test]
fn test_reset_category() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_itsm_sync(&config_path, &["reset", "incident"]);
    assert!(success, "reset failed: {}", stderr);
    assert!(stdout.contains("artifacts deleted: 0"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_itsm_sync(&tmp.path().join("nope.toml"), &["status"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
