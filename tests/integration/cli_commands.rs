#![allow(missing_docs)]

use std::fs;
use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

fn put(dir: &Path, key: &str, value: &str) {
    cargo_bin_cmd!("strata")
        .arg("--dir")
        .arg(dir)
        .args(["put", key, value])
        .assert()
        .success();
}

fn json(dir: &Path, args: &[&str]) -> Value {
    let output = cargo_bin_cmd!("strata")
        .arg("--dir")
        .arg(dir)
        .args(["--format", "json"])
        .args(args)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

#[test]
fn put_then_get_prints_value() {
    let dir = TempDir::new().expect("tempdir");
    put(dir.path(), "-accountalice", "100");
    let output = cargo_bin_cmd!("strata")
        .arg("--dir")
        .arg(dir.path())
        .args(["get", "-accountalice"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(String::from_utf8_lossy(&output).trim(), "100");
}

#[test]
fn get_missing_key_exits_nonzero() {
    let dir = TempDir::new().expect("tempdir");
    cargo_bin_cmd!("strata")
        .arg("--dir")
        .arg(dir.path())
        .args(["get", "-accountnobody"])
        .assert()
        .code(3);
}

#[test]
fn delete_removes_key_from_dump() {
    let dir = TempDir::new().expect("tempdir");
    put(dir.path(), "-accounta", "1");
    put(dir.path(), "-accountb", "2");
    cargo_bin_cmd!("strata")
        .arg("--dir")
        .arg(dir.path())
        .args(["delete", "-accounta"])
        .assert()
        .success();
    let dump = json(dir.path(), &["dump"]);
    let entries = dump.as_array().expect("array");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["key"], "-accountb");
    assert_eq!(entries[0]["value"], "2");
}

#[test]
fn hex_mode_reaches_subtrees() {
    let dir = TempDir::new().expect("tempdir");
    let key = format!("{}{}{}", hex::encode("-storage"), "11".repeat(20), "beef");
    cargo_bin_cmd!("strata")
        .arg("--dir")
        .arg(dir.path())
        .args(["--hex", "put", &key, "cafe"])
        .assert()
        .success();
    let meta = json(dir.path(), &["meta"]);
    assert_eq!(meta["tx"], 1);
    assert_eq!(meta["subtrees"].as_array().map(Vec::len), Some(1));
    assert_eq!(meta["subtrees"][0]["name"], "11".repeat(20));
    assert_eq!(meta["stats"]["aborted_commits"], 0);

    let get = json(dir.path(), &["--hex", "get", &key]);
    assert_eq!(get["value"], "cafe");
}

#[test]
fn verify_emits_json_report() {
    let dir = TempDir::new().expect("tempdir");
    for i in 0..20 {
        put(dir.path(), &format!("-accountk{i:02}"), "v");
    }
    let report = json(dir.path(), &["verify"]);
    assert_eq!(report["success"], true);
    assert_eq!(report["counts"]["entries"], 20);
}

#[test]
fn config_file_sets_options() {
    let dir = TempDir::new().expect("tempdir");
    let config = dir.path().join("strata.toml");
    fs::write(&config, "page_size = 1024\nmeta_versions = 3\nno_sync = true\n").expect("config");
    let data = dir.path().join("data");
    cargo_bin_cmd!("strata")
        .arg("--dir")
        .arg(&data)
        .arg("--config")
        .arg(&config)
        .args(["put", "-accountx", "y"])
        .assert()
        .success();
    let output = cargo_bin_cmd!("strata")
        .arg("--dir")
        .arg(&data)
        .arg("--config")
        .arg(&config)
        .args(["--format", "json", "meta"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let meta: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(meta["meta_versions"], 3);
}

#[test]
fn unroutable_key_is_an_error() {
    let dir = TempDir::new().expect("tempdir");
    cargo_bin_cmd!("strata")
        .arg("--dir")
        .arg(dir.path())
        .args(["put", "plain", "v"])
        .assert()
        .code(1);
}
