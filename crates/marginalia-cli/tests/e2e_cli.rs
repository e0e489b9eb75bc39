//! End-to-end CLI tests.
//!
//! Each test runs `mg` as a subprocess in an isolated temp directory with its
//! own config home, so no user config leaks in.

use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use std::path::Path;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Test Harness
// ---------------------------------------------------------------------------

fn mg_cmd(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("mg"));
    cmd.current_dir(dir);
    cmd.env("HOME", dir);
    cmd.env("XDG_CONFIG_HOME", dir.join(".config"));
    cmd.env("MARGINALIA_LOG", "error");
    cmd.env_remove("MARGINALIA_SERVER");
    cmd.env_remove("MARGINALIA_REVIEW");
    cmd.env_remove("MARGINALIA_DATA_DIR");
    cmd.env_remove("FORMAT");
    cmd
}

fn json_of(dir: &Path, args: &[&str]) -> Value {
    let output = mg_cmd(dir)
        .args(["--review", "rv-1", "--json"])
        .args(args)
        .output()
        .expect("mg should not crash");
    assert!(
        output.status.success(),
        "mg {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("--json should produce valid JSON")
}

fn add_comment(dir: &Path, text: &str) -> String {
    let json = json_of(
        dir,
        &["comment", "add", "--page", "0", "--rect", "72,700,300,688", text],
    );
    json["record"]["id"]
        .as_str()
        .expect("comment add should return the record id")
        .to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn comment_add_is_queued_in_outbox() {
    let dir = TempDir::new().expect("temp dir");
    let id = add_comment(dir.path(), "typo: recieve");
    assert_eq!(id.len(), 64);

    let outbox = json_of(dir.path(), &["outbox", "list"]);
    let pending = outbox["pending"].as_array().expect("pending array");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["action"], "add-comment");
    assert_eq!(pending[0]["target_id"], Value::from(id));
    assert_eq!(outbox["sync"]["state"], "pending");

    assert!(dir.path().join(".marginalia/marginalia.sqlite3").exists());
}

#[test]
fn filter_narrows_list() {
    let dir = TempDir::new().expect("temp dir");
    add_comment(dir.path(), "Figure 2 is unreadable");
    add_comment(dir.path(), "typo in abstract");

    json_of(dir.path(), &["filter", "set", "--text", "figure"]);
    let list = json_of(dir.path(), &["list"]);
    assert_eq!(list["visible_roots"], 1);
    assert_eq!(list["total_roots"], 2);
    assert_eq!(list["cards"].as_array().map(Vec::len), Some(1));

    let all = json_of(dir.path(), &["list", "--all"]);
    assert_eq!(all["cards"].as_array().map(Vec::len), Some(2));

    let cleared = json_of(dir.path(), &["filter", "clear"]);
    assert_eq!(cleared["active"], false);
    assert_eq!(cleared["visible_roots"], 2);
}

#[test]
fn reply_status_is_ignored() {
    let dir = TempDir::new().expect("temp dir");
    let root = add_comment(dir.path(), "needs a citation");
    let reply = json_of(dir.path(), &["comment", "reply", &root, "added one"]);
    let reply_id = reply["record"]["id"].as_str().expect("reply id").to_string();

    let status = json_of(dir.path(), &["comment", "status", &reply_id, "Accepted"]);
    assert_eq!(status["changed"], false);
    assert_eq!(status["pending"], 2);
}

#[test]
fn export_writes_nested_threads() {
    let dir = TempDir::new().expect("temp dir");
    let root = add_comment(dir.path(), "unclear sentence");
    json_of(dir.path(), &["comment", "reply", &root, "rephrased"]);

    let target = dir.path().join("review.json");
    mg_cmd(dir.path())
        .args(["--review", "rv-1", "export", "-o"])
        .arg(&target)
        .assert()
        .success();

    let exported: Value =
        serde_json::from_str(&std::fs::read_to_string(&target).expect("read export"))
            .expect("export is JSON");
    assert_eq!(exported[0]["id"], Value::from(root));
    assert_eq!(exported[0]["replies"][0]["msg"], "rephrased");
    assert_eq!(exported[0]["replies"][0]["type"], "reply");
}

#[test]
fn missing_review_is_reported() {
    let dir = TempDir::new().expect("temp dir");
    mg_cmd(dir.path())
        .args(["list"])
        .assert()
        .failure()
        .stderr(contains("no review selected"));
}

#[test]
fn sync_requires_a_server() {
    let dir = TempDir::new().expect("temp dir");
    mg_cmd(dir.path())
        .args(["--review", "rv-1", "sync"])
        .assert()
        .failure()
        .stderr(contains("no review server configured"));
}

#[test]
fn unreachable_server_keeps_edits_pending() {
    let dir = TempDir::new().expect("temp dir");
    add_comment(dir.path(), "survives a failed sync");

    let output = mg_cmd(dir.path())
        .env("MARGINALIA_SERVER", "http://127.0.0.1:9")
        .args(["--review", "rv-1", "--json", "sync"])
        .output()
        .expect("mg should not crash");
    assert!(output.status.success());
    let summary: Value = serde_json::from_slice(&output.stdout).expect("sync JSON");
    assert_eq!(summary["drain"]["failed"], 1);
    assert_eq!(summary["fetch"]["ok"], false);
    assert_eq!(summary["pending"], 1);

    let outbox = json_of(dir.path(), &["outbox", "list"]);
    assert_eq!(outbox["pending"][0]["attempts"], 1);
}

#[test]
fn project_config_supplies_review() {
    let dir = TempDir::new().expect("temp dir");
    let config_dir = dir.path().join(".marginalia");
    std::fs::create_dir_all(&config_dir).expect("config dir");
    std::fs::write(
        config_dir.join("config.toml"),
        "[server]\nreview = \"from-config\"\n",
    )
    .expect("write config");

    mg_cmd(dir.path())
        .args(["--json", "outbox", "list"])
        .assert()
        .success()
        .stdout(contains("\"pending\""));
}
