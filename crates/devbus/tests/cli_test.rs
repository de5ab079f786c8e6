//! Integration tests for the `devbus` CLI binary.
//!
//! These run the real binary against temporary resource files; no
//! database server is involved.
#![allow(clippy::unwrap_used)]

use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use pretty_assertions::assert_eq;

// ── Helpers ─────────────────────────────────────────────────────────

/// Build a [`Command`] for the `devbus` binary with env isolation.
///
/// Clears `TANGO_HOST` and the `DEVBUS_*` variables and points config
/// directories at a nonexistent path so tests never touch the user's real
/// configuration.
fn devbus_cmd() -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("devbus");
    cmd.env("HOME", "/tmp/devbus-cli-test-nonexistent")
        .env("XDG_CONFIG_HOME", "/tmp/devbus-cli-test-nonexistent")
        .env("NO_COLOR", "1")
        .env_remove("TANGO_HOST")
        .env_remove("DEVBUS_CONFIG")
        .env_remove("DEVBUS_OUTPUT")
        .env_remove("DEVBUS_FILE_DATABASE")
        .env_remove("DEVBUS_TANGO_HOST")
        .env_remove("RUST_LOG");
    cmd
}

/// Concatenate stdout + stderr from a command output for flexible matching.
fn combined_output(output: &std::process::Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    format!("{stdout}{stderr}")
}

fn stdout_of(cmd: &mut assert_cmd::Command) -> String {
    let output = cmd.output().unwrap();
    assert!(output.status.success(), "command failed: {output:?}");
    String::from_utf8(output.stdout).unwrap()
}

fn db_path(dir: &tempfile::TempDir) -> String {
    dir.path().join("lab.res").display().to_string()
}

fn write_config(dir: &Path, body: &str) -> String {
    let path = dir.join("config.toml");
    std::fs::write(&path, body).unwrap();
    path.display().to_string()
}

// ── Basic invocation ────────────────────────────────────────────────

#[test]
fn test_no_args_shows_help() {
    let output = devbus_cmd().output().unwrap();
    assert_eq!(output.status.code(), Some(2), "Expected exit code 2");
    let text = combined_output(&output);
    assert!(text.contains("Usage"), "Expected 'Usage' in output:\n{text}");
}

#[test]
fn test_help_lists_the_commands() {
    devbus_cmd().arg("--help").assert().success().stdout(
        predicate::str::contains("resolve")
            .and(predicate::str::contains("prop"))
            .and(predicate::str::contains("config"))
            .and(predicate::str::contains("completions")),
    );
}

#[test]
fn test_version_flag() {
    devbus_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("devbus"));
}

#[test]
fn test_invalid_subcommand_is_a_usage_error() {
    devbus_cmd()
        .arg("foobar")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("foobar"));
}

// ── Shell completions ───────────────────────────────────────────────

#[test]
fn test_completions_bash() {
    devbus_cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty().not());
}

#[test]
fn test_completions_zsh() {
    devbus_cmd()
        .args(["completions", "zsh"])
        .assert()
        .success()
        .stdout(predicate::str::contains("#compdef"));
}

// ── Resolve ─────────────────────────────────────────────────────────

#[test]
fn test_resolve_table() {
    let out = stdout_of(devbus_cmd().args(["--color", "never", "resolve", "db:10000"]));
    insta::assert_snapshot!(out.trim_end(), @r"
    Hosts:      db
    Ports:      10000
    Multi-host: no
    Database:   tango://db:10000/database
    ");
}

#[test]
fn test_resolve_json_carries_the_parsed_fields() {
    let out = stdout_of(devbus_cmd().args(["-o", "json", "resolve", "db1:10000,db2:10001"]));
    let json: serde_json::Value = serde_json::from_str(&out).unwrap();

    assert_eq!(json["hosts"], serde_json::json!(["db1", "db2"]));
    assert_eq!(json["ports"], serde_json::json!(["10000", "10001"]));
    assert_eq!(json["is_multi_host"], true);
    assert_eq!(json["is_file_backed"], false);
    assert_eq!(json["database"], "corbaloc:iiop:db1:10000,iiop:db2:10001/database");
}

#[test]
fn test_resolve_falls_back_to_tango_host() {
    let out = stdout_of(
        devbus_cmd()
            .env("TANGO_HOST", "archive:20000")
            .args(["-o", "plain", "resolve"]),
    );
    assert_eq!(out.trim(), "tango://archive:20000/database");
}

#[test]
fn test_resolve_prefers_the_configured_file_database() {
    let dir = tempfile::tempdir().unwrap();
    let db = db_path(&dir);
    let config = write_config(dir.path(), &format!("file_database = \"{db}\"\n"));

    let out = stdout_of(
        devbus_cmd()
            .env("TANGO_HOST", "archive:20000")
            .args(["--config", &config, "-o", "plain", "resolve"]),
    );
    assert_eq!(out.trim(), db);
}

#[test]
fn test_resolve_rejects_a_malformed_spec() {
    devbus_cmd()
        .args(["resolve", "db"])
        .assert()
        .code(6)
        .stderr(predicate::str::contains("Invalid connection spec 'db'"));
}

#[test]
fn test_resolve_without_any_database() {
    devbus_cmd()
        .arg("resolve")
        .assert()
        .code(6)
        .stderr(predicate::str::contains("No database configured"));
}

// ── Properties ──────────────────────────────────────────────────────

#[test]
fn test_prop_put_then_get() {
    let dir = tempfile::tempdir().unwrap();
    let db = db_path(&dir);

    devbus_cmd()
        .args(["prop", "put", "lab/motor/1", "speed", "1", "2", "3", "--file", &db])
        .assert()
        .success()
        .stderr(predicate::str::contains("Property set"));

    let out = stdout_of(devbus_cmd().args(["-o", "plain", "prop", "get", "lab/motor/1", "speed", "--file", &db]));
    assert_eq!(out, "1\n2\n3\n");

    let out = stdout_of(devbus_cmd().args(["-o", "json", "prop", "get", "lab/motor/1", "speed", "--file", &db]));
    let json: serde_json::Value = serde_json::from_str(&out).unwrap();
    assert_eq!(json, serde_json::json!([{ "name": "speed", "values": ["1", "2", "3"] }]));
}

#[test]
fn test_prop_get_shows_missing_names_next_to_found_ones() {
    let dir = tempfile::tempdir().unwrap();
    let db = db_path(&dir);
    std::fs::write(&db, "lab/motor/1->speed: 5\n").unwrap();

    let out = stdout_of(devbus_cmd().args(["-o", "json-compact", "prop", "get", "lab/motor/1", "speed", "mode", "--file", &db]));
    assert_eq!(
        out.trim(),
        r#"[{"name":"speed","values":["5"]},{"name":"mode","values":[]}]"#
    );
}

#[test]
fn test_prop_get_unknown_property_exits_with_4() {
    let dir = tempfile::tempdir().unwrap();
    let db = db_path(&dir);

    devbus_cmd()
        .args(["prop", "get", "lab/motor/1", "speed", "--file", &db])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_prop_delete_removes_the_property() {
    let dir = tempfile::tempdir().unwrap();
    let db = db_path(&dir);
    std::fs::write(&db, "lab/motor/1->speed: 5\nlab/motor/1->mode: fast\n").unwrap();

    devbus_cmd()
        .args(["-q", "prop", "delete", "lab/motor/1", "speed", "--file", &db])
        .assert()
        .success()
        .stderr(predicate::str::is_empty());

    devbus_cmd()
        .args(["prop", "get", "lab/motor/1", "speed", "--file", &db])
        .assert()
        .code(4);
    let out = stdout_of(devbus_cmd().args(["-o", "plain", "prop", "get", "lab/motor/1", "mode", "--file", &db]));
    assert_eq!(out.trim(), "fast");
}

#[test]
fn test_prop_uses_the_configured_file_database() {
    let dir = tempfile::tempdir().unwrap();
    let db = db_path(&dir);
    std::fs::write(&db, "lab/motor/1->speed: 7\n").unwrap();
    let config = write_config(dir.path(), &format!("file_database = \"{db}\"\n"));

    let out = stdout_of(devbus_cmd().args(["--config", &config, "-o", "plain", "prop", "get", "lab/motor/1", "speed"]));
    assert_eq!(out.trim(), "7");
}

#[test]
fn test_prop_without_a_file_database() {
    devbus_cmd()
        .args(["prop", "get", "lab/motor/1", "speed"])
        .assert()
        .code(6)
        .stderr(predicate::str::contains("No file database configured"));
}

#[test]
fn test_prop_rejects_a_malformed_device_name() {
    devbus_cmd()
        .args(["prop", "get", "motor1", "speed", "--file", "/tmp/x.res"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("domain/family/member"));
}

#[test]
fn test_prop_put_requires_values() {
    devbus_cmd()
        .args(["prop", "put", "lab/motor/1", "speed", "--file", "/tmp/x.res"])
        .assert()
        .code(2);
}

// ── Config ──────────────────────────────────────────────────────────

#[test]
fn test_config_path_follows_the_flag() {
    let out = stdout_of(devbus_cmd().args(["--config", "/etc/devbus/lab.toml", "config", "path"]));
    assert_eq!(out.trim(), "/etc/devbus/lab.toml");
}

#[test]
fn test_config_show_without_a_file_uses_defaults() {
    let out = stdout_of(devbus_cmd().args(["-o", "json", "config", "show"]));
    let json: serde_json::Value = serde_json::from_str(&out).unwrap();
    assert_eq!(json["server"]["name"], "devbus/default");
    assert_eq!(json["timeouts"]["request_ms"], 3000);
}

#[test]
fn test_config_show_applies_env_overrides() {
    let out = stdout_of(
        devbus_cmd()
            .env("DEVBUS_SERVER__NAME", "Lab/2")
            .args(["-o", "plain", "config", "show"]),
    );
    assert_eq!(out.trim(), "Lab/2");
}

#[test]
fn test_config_show_rejects_an_invalid_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), "[server]\nname = \"no-instance\"\n");

    devbus_cmd()
        .args(["--config", &config, "config", "show"])
        .assert()
        .code(6)
        .stderr(predicate::str::contains("server.name"));
}

#[test]
fn test_config_init_writes_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("nested").join("config.toml").display().to_string();

    devbus_cmd()
        .env("TANGO_HOST", "db:10000")
        .args(["--config", &config, "config", "init"])
        .assert()
        .success();
    let written = std::fs::read_to_string(&config).unwrap();
    assert!(written.contains("tango_host = \"db:10000\""), "{written}");

    devbus_cmd()
        .args(["--config", &config, "config", "init"])
        .assert()
        .code(6)
        .stderr(predicate::str::contains("already exists"));
    devbus_cmd()
        .args(["--config", &config, "config", "init", "--force"])
        .assert()
        .success();
}
