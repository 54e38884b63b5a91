//! Integration tests for the hooktime binary
#![allow(deprecated)] // suppress assert_cmd::Command::cargo_bin deprecation in tests

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use hooktime::clock::Timestamp;
use hooktime::correlation::CorrelationId;
use hooktime::ledger::{EventDetail, EventKind, EventPhase, LedgerSnapshot, TimedEvent};
use predicates::prelude::*;

fn event(kind: EventKind, id: u64, entity: &str, phase: EventPhase, ms: u64) -> TimedEvent {
    TimedEvent {
        kind,
        correlation: CorrelationId::from_raw(id),
        entity: entity.to_string(),
        phase,
        timestamp: Timestamp::from_millis(ms),
        detail: EventDetail::None,
    }
}

/// One run of 100ms: two extensions, two transformers sharing a package name
fn sample_ledger() -> LedgerSnapshot {
    use EventKind::{ExtensionCallback, PipelineMilestone, ResourceTransform};
    use EventPhase::{End, Start};

    LedgerSnapshot::from_events([
        event(PipelineMilestone, 1, "pipeline", Start, 0),
        event(ExtensionCallback, 2, "Slow", Start, 5),
        event(ExtensionCallback, 2, "Slow", End, 45),
        event(ExtensionCallback, 3, "Quick", Start, 50),
        event(ExtensionCallback, 3, "Quick", End, 52),
        event(ResourceTransform, 4, "/app/node_modules/a/node_modules/css/x.js", Start, 60),
        event(ResourceTransform, 4, "/app/node_modules/a/node_modules/css/x.js", End, 70),
        event(ResourceTransform, 5, "/app/node_modules/css/y.js", Start, 71),
        event(ResourceTransform, 5, "/app/node_modules/css/y.js", End, 74),
        event(PipelineMilestone, 1, "pipeline", End, 100),
    ])
}

fn write_ledger(dir: &Path, ledger: &LedgerSnapshot) -> PathBuf {
    let path = dir.join("ledger.json");
    std::fs::write(&path, ledger.to_json().unwrap()).unwrap();
    path
}

fn hooktime() -> Command {
    Command::cargo_bin("hooktime").unwrap()
}

#[test]
fn test_report_renders_text_tree() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = write_ledger(dir.path(), &sample_ledger());

    hooktime()
        .arg("report")
        .arg(&ledger)
        .assert()
        .success()
        .stdout(predicate::str::starts_with("┌── hooktime"))
        .stdout(predicate::str::contains("│ Pipeline run takes 100.0000 ms"))
        .stdout(predicate::str::contains("│ Extension Slow takes 40.0000 ms"))
        .stdout(predicate::str::contains("│ All extensions take 42.0000 ms"))
        .stdout(predicate::str::contains("│ Transformer css takes"))
        .stdout(predicate::str::contains("same assumed name"))
        .stdout(predicate::str::contains("│ All transformers take 13.0000 ms"))
        .stdout(predicate::str::contains("\u{1b}").not());
}

#[test]
fn test_report_orders_extensions_slowest_first() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = write_ledger(dir.path(), &sample_ledger());

    let output = hooktime().arg("report").arg(&ledger).output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    let slow = stdout.find("Extension Slow").unwrap();
    let quick = stdout.find("Extension Quick").unwrap();
    assert!(slow < quick);
}

#[test]
fn test_report_json_format() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = write_ledger(dir.path(), &sample_ledger());

    let output = hooktime()
        .args(["report", "--format", "json"])
        .arg(&ledger)
        .output()
        .unwrap();
    assert!(output.status.success());

    let doc: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(doc["format"], "hooktime-json-v1");
    assert_eq!(doc["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(doc["summary"]["pipeline_total_ms"], 100.0);
    assert_eq!(doc["extensions"].as_array().unwrap().len(), 2);
}

#[test]
fn test_report_grouped_by_absolute_path() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = write_ledger(dir.path(), &sample_ledger());
    let config = dir.path().join("hooktime.toml");
    std::fs::write(&config, "[loader]\ngroupByAbsolutePath = true\n").unwrap();

    hooktime()
        .arg("report")
        .arg(&ledger)
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Transformer /app/node_modules/css/y.js takes 3.0000 ms",
        ))
        .stdout(predicate::str::contains("same assumed name").not());
}

#[test]
fn test_report_to_output_file() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = write_ledger(dir.path(), &sample_ledger());
    let out = dir.path().join("report.txt");

    hooktime()
        .arg("report")
        .arg(&ledger)
        .arg("--output")
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::is_empty());

    let report = std::fs::read_to_string(&out).unwrap();
    assert!(report.contains("Pipeline run takes 100.0000 ms"));
}

#[test]
fn test_report_rejects_unpaired_events() {
    let dir = tempfile::tempdir().unwrap();
    let mut ledger = sample_ledger();
    ledger.extension_callbacks.remove(1);
    let ledger = write_ledger(dir.path(), &ledger);

    hooktime()
        .arg("report")
        .arg(&ledger)
        .assert()
        .failure()
        .stderr(predicate::str::contains("must record one start followed by one end"));
}

#[test]
fn test_report_rejects_missing_milestone() {
    let dir = tempfile::tempdir().unwrap();
    let mut ledger = sample_ledger();
    ledger.milestones.pop();
    let ledger = write_ledger(dir.path(), &ledger);

    hooktime()
        .arg("report")
        .arg(&ledger)
        .assert()
        .failure()
        .stderr(predicate::str::contains("milestone"));
}

#[test]
fn test_report_rejects_invalid_config() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = write_ledger(dir.path(), &sample_ledger());
    let config = dir.path().join("hooktime.toml");
    std::fs::write(&config, "warn_time_limit = 9000\ndanger_time_limit = 10\n").unwrap();

    hooktime()
        .arg("report")
        .arg(&ledger)
        .arg("--config")
        .arg(&config)
        .assert()
        .failure();
}

#[test]
fn test_report_missing_ledger_fails() {
    hooktime()
        .args(["report", "/nonexistent/ledger.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read ledger"));
}

#[test]
fn test_simulate_prints_report() {
    hooktime()
        .arg("simulate")
        .assert()
        .success()
        .stdout(predicate::str::contains("┌── hooktime"))
        .stdout(predicate::str::contains("Extension ManifestExtension takes"))
        .stdout(predicate::str::contains("Transformer banner-loader takes"));
}

#[test]
fn test_simulate_uninstrumented_prints_artifacts_only() {
    hooktime()
        .args(["simulate", "--uninstrumented", "--print-artifacts"])
        .assert()
        .success()
        .stdout(predicate::str::contains("=== index.txt ==="))
        .stdout(predicate::str::contains("HELLO PIPELINE"))
        .stdout(predicate::str::contains("hooktime").not());
}

#[test]
fn test_simulate_json_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("report.json");

    hooktime()
        .args(["simulate", "--format", "json", "--output"])
        .arg(&out)
        .assert()
        .success();

    let doc: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(doc["transformers"].as_array().unwrap().len(), 3);
}

#[test]
fn test_debug_flag_logs_to_stderr() {
    hooktime()
        .args(["--debug", "simulate"])
        .assert()
        .success()
        .stderr(predicate::str::contains("wrapped carrier"));
}
