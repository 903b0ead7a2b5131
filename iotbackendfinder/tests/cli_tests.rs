//! Binary startup, catalog commands and configuration errors.

mod common;

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn iotbackendfinder(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("iotbackendfinder").expect("binary builds");
    cmd.current_dir(dir.path())
        .env_remove("DNSDB_API_KEY")
        .env_remove("RUST_LOG")
        .timeout(std::time::Duration::from_secs(30));
    cmd
}

#[test]
fn test_help_lists_subcommands() {
    let dir = TempDir::new().unwrap();
    iotbackendfinder(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("dnsdb"))
        .stdout(predicate::str::contains("censys"))
        .stdout(predicate::str::contains("catalog"));
}

#[test]
fn test_catalog_list_shows_embedded_providers() {
    let dir = TempDir::new().unwrap();
    iotbackendfinder(&dir)
        .args(["catalog", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("aws-iot-endpoint"))
        .stdout(predicate::str::contains("must not contain 'doc.'"));
}

#[test]
fn test_catalog_check_accepts_valid_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("catalog.toml");
    fs::write(&path, common::TEST_CATALOG).unwrap();

    iotbackendfinder(&dir)
        .args(["catalog", "check"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("2 providers"));
}

#[test]
fn test_catalog_check_rejects_bad_regex() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.toml");
    fs::write(
        &path,
        r#"
version = "bad"

[[providers]]
name = "broken"
rules = [{ kind = "regex", pattern = "([a-z" }]
"#,
    )
    .unwrap();

    iotbackendfinder(&dir)
        .args(["catalog", "check"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_missing_credential_fails_before_any_request() {
    let dir = TempDir::new().unwrap();
    iotbackendfinder(&dir)
        .args(["dnsdb", "--providers", "aws", "--no-resume"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Missing DNSDB API key"));
    assert!(!dir.path().join(".iotbackendfinder-checkpoint.json").exists());
}

#[test]
fn test_unknown_provider_is_config_error() {
    let dir = TempDir::new().unwrap();
    iotbackendfinder(&dir)
        .args(["dnsdb", "--providers", "nosuchcloud", "--api-key", "k"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("nosuchcloud"));
}

#[test]
fn test_init_writes_default_config() {
    let dir = TempDir::new().unwrap();
    iotbackendfinder(&dir)
        .arg("--init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Created default configuration file"));
    assert!(dir.path().join("config").join("iotbackendfinder.toml").exists());
}

#[test]
fn test_bulk_run_writes_output() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("hosts.json.gz");
    common::write_gz(
        &input,
        &[common::censys_host(
            "198.51.100.7",
            &[(8883, &["a1b2-ats.iot.eu-west-1.amazonaws.com"])],
        )],
    );

    iotbackendfinder(&dir)
        .args(["censys", "--providers", "aws", "--no-timestamp", "--output", "out.csv", "--input"])
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("RUN SUMMARY"));

    let csv = fs::read_to_string(dir.path().join("out.csv")).unwrap();
    assert!(csv.starts_with("provider,value,kind"));
    assert!(csv.contains("a1b2-ats.iot.eu-west-1.amazonaws.com"));
    assert!(csv.contains("198.51.100.7"));
}

#[test]
fn test_unopenable_log_file_keeps_stderr_warnings() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("blocker"), "not a directory").unwrap();
    let input = dir.path().join("hosts.json.gz");
    common::write_gz(
        &input,
        &[
            common::censys_host("198.51.100.7", &[(8883, &["a1b2-ats.iot.eu-west-1.amazonaws.com"])]),
            "{ truncated".to_string(),
        ],
    );

    iotbackendfinder(&dir)
        .args(["--log-file", "blocker/run.log", "censys", "--providers", "aws"])
        .args(["--no-timestamp", "--output", "out.csv", "--input"])
        .arg(&input)
        .assert()
        .success()
        .stderr(predicate::str::contains("Continuing without file logging"))
        .stderr(predicate::str::contains("Skipped 1 malformed lines"));
    assert!(dir.path().join("out.csv").exists());
}

#[test]
fn test_quiet_suppresses_info_logs() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("hosts.json.gz");
    common::write_gz(
        &input,
        &[common::censys_host("198.51.100.7", &[(8883, &["a1b2-ats.iot.eu-west-1.amazonaws.com"])])],
    );

    iotbackendfinder(&dir)
        .args(["-q", "censys", "--providers", "aws", "--no-timestamp", "--output", "out.csv", "--input"])
        .arg(&input)
        .assert()
        .success()
        .stdout(predicate::str::contains("RUN SUMMARY"))
        .stderr(predicate::str::contains("INFO").not());
}
