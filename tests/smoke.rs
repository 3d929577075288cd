//! Smoke tests -- verify the binary runs and the subcommands are wired up.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;

fn chambercycle() -> Command {
    let mut cmd = Command::cargo_bin("chambercycle").unwrap();
    cmd.env_remove("CHAMBERCYCLE_CONFIG").env_remove("RUST_LOG");
    cmd
}

/// A short simulated session rooted in `dir`.
fn write_config(dir: &Path, workload_script: &str) -> PathBuf {
    let work = dir.join("work");
    std::fs::create_dir_all(&work).unwrap();
    let results = dir.join("results");

    let config = format!(
        r#"
[chamber]
backend = "simulated"

[chamber.simulated]
ambient = 25.0
ramp_per_sample = 10.0
noise = 0.0

[plan]
setpoints = [30.0, 0.0]
dwell_sec = 0
rest_setpoint = 25.0

[stabilization]
compare_band = 0.3
poll_interval_sec = 0
max_polls = 5

[workload]
executable = "sh"
args = ["-c", "{script}"]
replicas = 2
duration_sec = 0
safety_margin_sec = 1
launch_stagger_sec = 0
working_dir = "{work}"
capture_output = false

[results]
source_dir = "{work}"
destination_root = "{results}"
journal_path = "{results}/journal.jsonl"
"#,
        script = workload_script,
        work = work.display(),
        results = results.display(),
    );

    let path = dir.join("chambercycle.toml");
    std::fs::write(&path, config).unwrap();
    path
}

#[test]
fn test_cli_help() {
    chambercycle()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("endurance harness"));
}

#[test]
fn test_cli_version() {
    chambercycle()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("chambercycle"));
}

#[test]
fn test_subcommands_exist() {
    for args in [
        vec!["run", "--help"],
        vec!["plan", "--help"],
        vec!["chamber", "sample", "--help"],
        vec!["power-cycle", "--help"],
        vec!["check-config", "--help"],
    ] {
        chambercycle().args(&args).assert().success();
    }
}

#[test]
fn test_plan_lists_setpoints_before_sentinel() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = dir.path().join("plan.toml");
    std::fs::write(
        &config,
        format!(
            "[plan]\nsetpoints = [50.0, 45.0, 40.0, 0.0, 35.0]\n\n[results]\ndestination_root = \"{}\"\n",
            dir.path().join("results").display()
        ),
    )
    .unwrap();

    chambercycle()
        .arg("--config")
        .arg(&config)
        .arg("plan")
        .assert()
        .success()
        .stdout(predicate::str::contains("run001"))
        .stdout(predicate::str::contains("run003"))
        .stdout(predicate::str::contains("40.0"))
        .stdout(predicate::str::contains("run004").not());
}

#[test]
fn test_invalid_config_exits_with_config_code() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = dir.path().join("bad.toml");
    std::fs::write(&config, "[stabilization]\ncompare_band = 0.0\n").unwrap();

    chambercycle()
        .arg("--config")
        .arg(&config)
        .arg("check-config")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("compare_band"));
}

#[test]
fn test_missing_config_file_exits_with_config_code() {
    chambercycle()
        .args(["--config", "/nonexistent/chambercycle.toml", "plan"])
        .assert()
        .code(2);
}

#[test]
fn test_simulated_chamber_sample() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(dir.path(), "exit 0");

    chambercycle()
        .arg("--config")
        .arg(&config)
        .args(["chamber", "--simulate", "sample"])
        .assert()
        .success()
        .stdout(predicate::str::contains("air: 25.00"));
}

#[test]
fn test_simulated_run_passes() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(dir.path(), "echo {setpoint} > out{replica}.csv");

    let output = chambercycle()
        .arg("--config")
        .arg(&config)
        .args(["run", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let report: serde_json::Value = serde_json::from_slice(&output).unwrap();
    let outcomes = report["outcomes"].as_array().unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0]["setpoint"], 30.0);
    assert_eq!(outcomes[0]["stabilization"]["result"], "stable");

    let runs: Vec<_> = std::fs::read_dir(dir.path().join("results"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .collect();
    assert_eq!(runs.len(), 1);
    assert!(dir.path().join("results/journal.jsonl").exists());
}

#[test]
fn test_simulated_run_with_failing_workload_exits_one() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(dir.path(), "exit 1");

    chambercycle()
        .arg("--config")
        .arg(&config)
        .args(["run"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("FAIL"));
}
