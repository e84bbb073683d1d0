//! CLI command contract tests
//!
//! Validates that each command behaves correctly in both human and automation
//! contexts.
//!
//! Contract guarantees tested:
//! - Deterministic exit codes (0 ok, 1 leak with --fail-on-leak, 2 config error)
//! - Stable JSON schema in `--format json` mode
//! - No ANSI escapes in `--format plain` mode
//! - Actionable error messages for failure paths

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// =============================================================================
// Test fixture helpers
// =============================================================================

/// Build a leakprobe command with fast comparison defaults.
#[allow(deprecated)]
fn leakprobe_cmd() -> Command {
    let mut cmd = Command::cargo_bin("leakprobe").expect("leakprobe binary should be built");
    cmd.env_remove("LEAKPROBE_CONFIG");
    cmd.env_remove("RUST_LOG");
    cmd
}

/// Write a config file with fast settle times into a temp dir.
fn write_fast_config() -> (TempDir, String) {
    let dir = TempDir::new().expect("create temp dir");
    let path = dir.path().join("leakprobe.toml");
    std::fs::write(
        &path,
        r#"
[monitor]
cycles = 2
uris = ["abfs://c@acct1.dfs.core.windows.net/"]

[compare]
settle_ms = 0
creation_delay_ms = 0

[properties]
"fs.azure.analysis.period" = "50"
"#,
    )
    .expect("write config");
    let path = path.to_string_lossy().to_string();
    (dir, path)
}

fn stdout_json(output: &std::process::Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(&stdout)
        .unwrap_or_else(|e| panic!("stdout should be JSON ({e}):\n{stdout}"))
}

fn assert_no_ansi(output: &str, context: &str) {
    assert!(
        !output.contains("\x1b["),
        "{context}: output should not contain ANSI escapes, got:\n{output}"
    );
}

// =============================================================================
// leakprobe config
// =============================================================================

#[test]
fn contract_config_prints_effective_toml() {
    leakprobe_cmd()
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[monitor]"))
        .stdout(predicate::str::contains("cycles = 200"))
        .stdout(predicate::str::contains("abfs-timer-client-throttling-analyzer"));
}

#[test]
fn contract_config_reflects_file_and_overrides() {
    let (_dir, path) = write_fast_config();
    leakprobe_cmd()
        .args(["--config", &path, "-D", "fs.azure.enable.autothrottling=false", "config"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cycles = 2"))
        .stdout(predicate::str::contains("fs.azure.enable.autothrottling"));
}

#[test]
fn contract_missing_config_exits_2_with_remediation() {
    leakprobe_cmd()
        .args(["--config", "/definitely/not/here/leakprobe.toml", "config"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Config file not found"))
        .stderr(predicate::str::contains("To fix:"));
}

#[test]
fn contract_bad_property_exits_2() {
    leakprobe_cmd()
        .args(["-D", "fs.azure.analysis.period=soon", "cycles", "--cycles", "1"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("fs.azure.analysis.period"));
}

#[test]
fn contract_invalid_log_level_exits_2() {
    leakprobe_cmd()
        .args(["--log-level", "chatty", "cycles", "--cycles", "1"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("invalid log level"));
}

// =============================================================================
// leakprobe cycles
// =============================================================================

#[test]
fn contract_cycles_plain_prints_table_and_analysis() {
    let (_dir, path) = write_fast_config();
    let output = leakprobe_cmd()
        .args(["--config", &path, "cycles"])
        .output()
        .expect("run cycles");
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_no_ansi(&stdout, "cycles plain");
    assert!(stdout.contains("SYSTEM INFORMATION"));
    assert!(stdout.contains("Cycle    Total"));
    assert!(stdout.contains("0->2"), "first cycle leaks two analyzers:\n{stdout}");
    assert!(stdout.contains("2->4"), "second cycle leaks two more:\n{stdout}");
    assert!(stdout.contains("LEAK DETECTED"));
    assert!(stdout.contains("fs.azure.analysis.period = 50"));
    assert!(!stdout.contains("BROKEN VS FIXED"));
}

#[test]
fn contract_cycles_json_schema() {
    let (_dir, path) = write_fast_config();
    let output = leakprobe_cmd()
        .args(["--config", &path, "--format", "json", "cycles"])
        .output()
        .expect("run cycles");
    assert!(output.status.success());

    let json = stdout_json(&output);
    let records = json["cycles"]["records"].as_array().expect("records");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["cycle_index"], 1);
    assert_eq!(records[1]["cycle_index"], 2);
    assert_eq!(records[1]["after"]["named_task_count"], 4);
    assert_eq!(json["trend"]["growth"], 2);
    assert_eq!(json["tasks"]["named"], 4);
    assert_eq!(json["tasks"]["leak_detected"], true);
    assert!(json.get("verdict").is_none());
}

#[test]
fn contract_releasing_close_reports_no_leak() {
    let (_dir, path) = write_fast_config();
    let output = leakprobe_cmd()
        .args([
            "--config",
            &path,
            "--format",
            "json",
            "--fail-on-leak",
            "cycles",
            "--close-behavior",
            "release_analyzers",
        ])
        .output()
        .expect("run cycles");
    assert_eq!(output.status.code(), Some(0));
    let json = stdout_json(&output);
    assert_eq!(json["tasks"]["named"], 0);
    assert_eq!(json["tasks"]["leak_detected"], false);
}

#[test]
fn contract_fail_on_leak_exits_1() {
    let (_dir, path) = write_fast_config();
    leakprobe_cmd()
        .args(["--config", &path, "--fail-on-leak", "cycles", "--cycles", "1"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("LEAK DETECTED"));
}

#[test]
fn contract_unsupported_uri_is_recorded_not_fatal() {
    let (_dir, path) = write_fast_config();
    let output = leakprobe_cmd()
        .args([
            "--config",
            &path,
            "--format",
            "json",
            "cycles",
            "--cycles",
            "1",
            "--uri",
            "s3://bucket/",
        ])
        .output()
        .expect("run cycles");
    assert!(output.status.success());
    let json = stdout_json(&output);
    let failures = json["cycles"]["records"][0]["failures"]
        .as_array()
        .expect("failures");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0]["stage"], "open");
}

// =============================================================================
// leakprobe compare
// =============================================================================

#[test]
fn contract_compare_json_verdict() {
    let (_dir, path) = write_fast_config();
    let output = leakprobe_cmd()
        .args(["--config", &path, "--format", "json", "compare"])
        .output()
        .expect("run compare");
    assert!(output.status.success());

    let json = stdout_json(&output);
    assert_eq!(json["verdict"]["broken_batch_delta"], 3);
    assert_eq!(json["verdict"]["fixed_batch_delta"], 0);
    assert_eq!(json["verdict"]["attributable_delta"], 3);
    assert_eq!(json["verdict"]["outcome"], "fix_effective");
    assert!(json["verdict"].get("final").is_some());
    assert!(json.get("cycles").is_none());
}

#[test]
fn contract_compare_plain_shows_batch_deltas() {
    let (_dir, path) = write_fast_config();
    leakprobe_cmd()
        .args(["--config", &path, "compare", "--broken", "2", "--fixed", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Without release: +2"))
        .stdout(predicate::str::contains("With release:    +0"))
        .stdout(predicate::str::contains("fix effective"));
}

#[test]
fn contract_compare_with_effective_fix_passes_fail_on_leak() {
    let (_dir, path) = write_fast_config();
    let output = leakprobe_cmd()
        .args(["--config", &path, "--fail-on-leak", "compare"])
        .output()
        .expect("run compare");
    assert_eq!(output.status.code(), Some(0));

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("NO LEAK DETECTED"), "{stdout}");
    assert!(stdout.contains("fix effective"));
}

#[test]
fn contract_compare_json_tasks_exclude_unreleased_batch() {
    let (_dir, path) = write_fast_config();
    let output = leakprobe_cmd()
        .args(["--config", &path, "--format", "json", "compare"])
        .output()
        .expect("run compare");
    assert!(output.status.success());

    let json = stdout_json(&output);
    assert_eq!(json["tasks"]["named"], 0);
    assert_eq!(json["tasks"]["leak_detected"], false);
    assert_eq!(json["verdict"]["broken_batch_delta"], 3);
    assert!(json["tasks"].get("os_threads").is_some());
}

// =============================================================================
// leakprobe run
// =============================================================================

#[test]
fn contract_run_includes_every_section() {
    let (_dir, path) = write_fast_config();
    let output = leakprobe_cmd()
        .args(["--config", &path, "run", "--cycles", "1"])
        .output()
        .expect("run");
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_no_ansi(&stdout, "run plain");
    for section in [
        "SYSTEM INFORMATION",
        "PERIODIC TASK LEAK REPRODUCTION",
        "FINAL ANALYSIS",
        "TASK ANALYSIS",
        "MEMORY ANALYSIS",
        "CONFIGURATION DETAILS",
        "RECOMMENDATIONS",
        "LEAK TREND",
        "BROKEN VS FIXED COMPARISON",
    ] {
        assert!(stdout.contains(section), "missing section {section}:\n{stdout}");
    }
}

#[test]
fn contract_help_lists_commands() {
    leakprobe_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("cycles"))
        .stdout(predicate::str::contains("compare"))
        .stdout(predicate::str::contains("--fail-on-leak"));
}
