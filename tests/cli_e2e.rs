//! End-to-end CLI tests for the tripsync binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Binary pointed at an isolated data directory.
fn tripsync(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("tripsync").unwrap();
    cmd.env("TRIPSYNC_DATA_DIR", data_dir.path())
        .env_remove("TRIPSYNC_ENDPOINT")
        .env_remove("TRIPSYNC_BUCKET")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_binary_help_displays_usage() {
    let mut cmd = Command::cargo_bin("tripsync").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Incremental"))
        .stdout(predicate::str::contains("rollback"));
}

#[test]
fn test_binary_version_displays_version() {
    let mut cmd = Command::cargo_bin("tripsync").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("tripsync"));
}

#[test]
fn test_binary_without_subcommand_fails() {
    let mut cmd = Command::cargo_bin("tripsync").unwrap();
    cmd.assert().failure().stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_verify_on_empty_data_dir_is_clean() {
    let dir = TempDir::new().unwrap();
    tripsync(&dir)
        .args(["verify", "-q"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 verified, 0 missing, 0 mismatched"));
    assert!(dir.path().join("tripsync-log.db").exists());
}

#[test]
fn test_log_json_on_empty_history() {
    let dir = TempDir::new().unwrap();
    tripsync(&dir)
        .args(["log", "ingestion", "--json", "-q"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("[]"));
}

#[test]
fn test_restore_unknown_id_fails() {
    let dir = TempDir::new().unwrap();
    tripsync(&dir)
        .args(["rollback", "restore", "nope.zip-20240101T000000Z", "-q"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no rollback record"));
}

#[test]
fn test_invalid_config_file_fails() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("tripsync.toml");
    std::fs::write(&config, "concurrency = 0\n").unwrap();

    tripsync(&dir)
        .args(["verify", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("concurrency"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sync_dry_run_prints_plan() {
    let server = MockServer::start().await;
    let listing = r#"<ListBucketResult><IsTruncated>false</IsTruncated>
<Contents><Key>202401-trip.zip</Key><LastModified>2024-02-06T14:19:13.000Z</LastModified><ETag>"abc"</ETag><Size>10</Size></Contents>
<Contents><Key>index.html</Key><LastModified>2024-02-06T14:19:13.000Z</LastModified><ETag>"def"</ETag><Size>3</Size></Contents>
</ListBucketResult>"#;
    Mock::given(method("GET"))
        .and(path("/"))
        .and(query_param("list-type", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let mut cmd = tripsync(&dir);
    cmd.env("TRIPSYNC_ENDPOINT", server.uri())
        .args(["sync", "--dry-run", "--json", "-q"]);
    let output = tokio::task::spawn_blocking(move || cmd.output().unwrap())
        .await
        .unwrap();

    assert!(output.status.success(), "{output:?}");
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["dry_run"], true);
    assert_eq!(report["listed"], 1);
    assert_eq!(report["planned_items"][0], "202401-trip.zip");
    assert!(!dir.path().join("zip").join("202401-trip.zip").exists());
}
