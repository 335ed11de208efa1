//! Integration tests for the `dimm` CLI binary.
//!
//! Argument parsing, configuration handling and exit codes run without a
//! device. The end-to-end tests drive an in-process simulated DIMM.
#![allow(clippy::unwrap_used)]

use std::io::Write;
use std::time::Duration;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

use dimm_mock::{MockConfig, MockDimm};

// ── Helpers ─────────────────────────────────────────────────────────

/// Build a [`Command`] for the `dimm` binary with env isolation.
///
/// Clears the `DIMM_*` variables the tests rely on and points config
/// directories at a nonexistent path so the user's configuration is never
/// read.
fn dimm_cmd() -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("dimm");
    cmd.env("HOME", "/tmp/dimm-cli-test-nonexistent")
        .env("XDG_CONFIG_HOME", "/tmp/dimm-cli-test-nonexistent")
        .env("NO_COLOR", "1")
        .env_remove("DIMM_CONFIG")
        .env_remove("DIMM_CONTROLLER")
        .env_remove("DIMM_PASSWORD")
        .env_remove("DIMM_MEASUREMENT_VALIDITY_SECS")
        .env_remove("RUST_LOG");
    cmd
}

/// `dimm_cmd` aimed at an Astelco DIMM on `port`.
fn astelco_cmd(port: u16) -> assert_cmd::Command {
    let mut cmd = dimm_cmd();
    cmd.env("DIMM_CONTROLLER", "astelco")
        .env("DIMM_ASTELCO__PORT", port.to_string())
        .env("DIMM_ASTELCO__POLL_INTERVAL_SECS", "2")
        .env("DIMM_ASTELCO__COMMAND_TIMEOUT_SECS", "1")
        .env("DIMM_ASTELCO__CONNECT_TIMEOUT_SECS", "2");
    cmd
}

/// Concatenate stdout + stderr from a command output for flexible matching.
fn combined_output(output: &std::process::Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    format!("{stdout}{stderr}")
}

fn config_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

/// A port nothing is listening on.
fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn output_of(mut cmd: assert_cmd::Command) -> std::process::Output {
    tokio::task::spawn_blocking(move || cmd.output().unwrap())
        .await
        .unwrap()
}

// ── Basic invocation ────────────────────────────────────────────────

#[test]
fn test_no_args_shows_help() {
    let output = dimm_cmd().output().unwrap();
    assert_eq!(output.status.code(), Some(2), "Expected exit code 2");
    let text = combined_output(&output);
    assert!(text.contains("Usage"), "Expected 'Usage' in output:\n{text}");
}

#[test]
fn test_help_flag() {
    dimm_cmd().arg("--help").assert().success().stdout(
        predicate::str::contains("DIMM")
            .and(predicate::str::contains("run"))
            .and(predicate::str::contains("status"))
            .and(predicate::str::contains("mock")),
    );
}

#[test]
fn test_version_flag() {
    dimm_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("dimm"));
}

#[test]
fn test_unknown_mode_is_a_usage_error() {
    dimm_cmd().args(["mode", "sideways"]).assert().code(2);
}

// ── Shell completions ───────────────────────────────────────────────

#[test]
fn test_completions_bash() {
    dimm_cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty().not());
}

#[test]
fn test_completions_zsh() {
    dimm_cmd()
        .args(["completions", "zsh"])
        .assert()
        .success()
        .stdout(predicate::str::contains("dimm"));
}

// ── Configuration ───────────────────────────────────────────────────

#[test]
fn test_config_check_with_defaults() {
    dimm_cmd()
        .args(["config", "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("configuration OK (controller: sim)"));
}

#[test]
fn test_config_check_reports_the_bad_field() {
    let file = config_file("[sim]\nchance_failure = 2.0\n");
    dimm_cmd()
        .arg("--config")
        .arg(file.path())
        .args(["config", "check"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("sim.chance_failure"));
}

#[test]
fn test_unknown_controller_is_a_usage_error() {
    let file = config_file("controller = \"telepathy\"\n");
    dimm_cmd()
        .arg("--config")
        .arg(file.path())
        .args(["config", "check"])
        .assert()
        .code(2);
}

#[test]
fn test_missing_config_file() {
    dimm_cmd()
        .args(["--config", "/tmp/dimm-cli-test-nonexistent/dimm.toml"])
        .args(["config", "check"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_config_show_redacts_password() {
    let file = config_file("[astelco]\npassword = \"hunter2\"\nport = 7000\n");
    let output = dimm_cmd()
        .arg("--config")
        .arg(file.path())
        .args(["config", "show", "-o", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["astelco"]["password"], "********");
    assert_eq!(json["astelco"]["port"], 7000);
    assert!(!String::from_utf8_lossy(&output.stdout).contains("hunter2"));
}

#[test]
fn test_env_overrides_config_file() {
    let file = config_file("controller = \"astelco\"\n");
    dimm_cmd()
        .arg("--config")
        .arg(file.path())
        .env("DIMM_CONTROLLER", "soar")
        .args(["config", "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("controller: soar"));
}

#[test]
fn test_config_path_honors_flag() {
    dimm_cmd()
        .args(["--config", "/etc/dimm/site.toml", "config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("/etc/dimm/site.toml"));
}

// ── Device commands without a device ────────────────────────────────

#[test]
fn test_status_needs_astelco_controller() {
    dimm_cmd()
        .arg("status")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("astelco"));
}

#[test]
fn test_weather_needs_a_reading() {
    astelco_cmd(closed_port())
        .arg("weather")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("at least one reading"));
}

#[test]
fn test_status_on_closed_port_is_a_connection_error() {
    astelco_cmd(closed_port()).arg("status").assert().code(7);
}

#[test]
fn test_run_gives_up_when_the_device_is_unreachable() {
    astelco_cmd(closed_port())
        .args(["run", "--max-retries", "0", "--duration", "30s"])
        .assert()
        .code(7);
}

// ── Simulated controller ────────────────────────────────────────────

#[test]
fn test_run_sim_prints_measurements() {
    let output = dimm_cmd()
        .env("DIMM_SIM__SEED", "7")
        .args(["run", "--duration", "5s"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", combined_output(&output));

    let stdout = String::from_utf8_lossy(&output.stdout);
    let first = stdout.lines().next().unwrap();
    let json: serde_json::Value = serde_json::from_str(first).unwrap();
    assert_eq!(json["event"], "measurement");
    assert!(json["seeing"].as_f64().unwrap() > 0.0);
    assert!(json["expires_at"].is_string());
}

#[test]
fn test_run_quiet_prints_nothing() {
    dimm_cmd()
        .args(["run", "--duration", "4s", "--quiet"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

// ── Against the simulated Astelco DIMM ──────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_status_reports_the_device() {
    let mock = MockDimm::start(MockConfig::default()).await.unwrap();

    let mut cmd = astelco_cmd(mock.port());
    cmd.args(["status", "-o", "json"]);
    let output = output_of(cmd).await;
    assert!(output.status.success(), "{}", combined_output(&output));

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["mode"], "AUTO");
    assert_eq!(json["activity"], "parked");
    assert!(json["updated_at"].is_string());
    assert!(mock.stats().gets >= 1);

    mock.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mode_and_weather_reach_the_device() {
    let mock = MockDimm::start(MockConfig::default()).await.unwrap();

    let mut cmd = astelco_cmd(mock.port());
    cmd.args(["mode", "off"]);
    let output = output_of(cmd).await;
    assert!(output.status.success(), "{}", combined_output(&output));
    assert_eq!(mock.variable("AMEBA.MODE").as_deref(), Some("0"));

    let mut cmd = astelco_cmd(mock.port());
    cmd.args(["weather", "--rain", "0", "--sky", "clear", "--humidity", "35"]);
    let output = output_of(cmd).await;
    assert!(output.status.success(), "{}", combined_output(&output));
    assert!(String::from_utf8_lossy(&output.stdout).contains("accepted"));
    assert_eq!(mock.variable("SKY.STATUS").as_deref(), Some("0"));

    mock.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_run_astelco_prints_device_measurements() {
    let mock = MockDimm::start(MockConfig {
        open_weather: true,
        slew_duration: Duration::from_millis(50),
        measurement_duration: Duration::from_millis(50),
        ..MockConfig::default()
    })
    .await
    .unwrap();

    let mut cmd = astelco_cmd(mock.port());
    cmd.args(["run", "--duration", "5s"]);
    let output = output_of(cmd).await;
    assert!(output.status.success(), "{}", combined_output(&output));

    let stdout = String::from_utf8_lossy(&output.stdout);
    let measurement = stdout
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap())
        .find(|json| json["event"] == "measurement")
        .unwrap();
    assert!(measurement["seeing"].as_f64().unwrap() > 0.0);
    assert!(measurement["details"]["airmass"].is_number());

    mock.shutdown().await;
}
