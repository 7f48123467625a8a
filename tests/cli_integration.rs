//! Integration tests for the loopguard CLI

use assert_cmd::cargo;
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Get a Command for the loopguard binary, isolated from the user's config
fn loopguard(temp: &TempDir) -> Command {
    let mut cmd = Command::new(cargo::cargo_bin!("loopguard"));
    cmd.env("XDG_CONFIG_HOME", temp.path().join("xdg"))
        .env("HOME", temp.path())
        .env_remove("LOOPGUARD_CONFIG")
        .env_remove("LOOPGUARD_MAX_ITERATIONS")
        .env_remove("LOOPGUARD_RATE_LIMIT")
        .env_remove("RUST_LOG")
        .arg("--project")
        .arg(temp.path());
    cmd
}

const DONE: &str = r#"echo '{"change_count": 1, "next_task_count": 0, "exit_signal": true}'"#;
const WORKING: &str = r#"echo '{"change_count": 1, "next_task_count": 2}'"#;

#[test]
fn test_help() {
    let temp = TempDir::new().unwrap();
    loopguard(&temp)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("guarded try-check-retry loop"));
}

#[test]
fn test_version() {
    let temp = TempDir::new().unwrap();
    loopguard(&temp)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1.0"));
}

#[test]
fn test_run_requires_command() {
    let temp = TempDir::new().unwrap();
    loopguard(&temp).arg("run").assert().failure();
}

#[cfg(unix)]
#[test]
fn test_run_completes() {
    let temp = TempDir::new().unwrap();
    loopguard(&temp)
        .args(["run", "--cooldown", "0", "--", "sh", "-c", DONE])
        .assert()
        .success()
        .stdout(predicate::str::contains("Task complete"))
        .stdout(predicate::str::contains("Phase: complete"));
}

#[cfg(unix)]
#[test]
fn test_run_json_report() {
    let temp = TempDir::new().unwrap();
    let output = loopguard(&temp)
        .args(["run", "--json", "--cooldown", "0", "--", "sh", "-c", DONE])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["ok"], true);
    assert_eq!(report["state"]["phase"], "complete");
    assert_eq!(report["metrics"]["iterations"], 1);
    assert_eq!(report["breaker"]["state"], "closed");
}

#[cfg(unix)]
#[test]
fn test_run_max_iterations_exit_code() {
    let temp = TempDir::new().unwrap();
    loopguard(&temp)
        .args([
            "run",
            "--max-iterations",
            "2",
            "--cooldown",
            "0",
            "--",
            "sh",
            "-c",
            WORKING,
        ])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("Maximum iterations (2)"));
}

#[cfg(unix)]
#[test]
fn test_run_max_iterations_from_env() {
    let temp = TempDir::new().unwrap();
    loopguard(&temp)
        .env("LOOPGUARD_MAX_ITERATIONS", "1")
        .args(["run", "--cooldown", "0", "--", "sh", "-c", WORKING])
        .assert()
        .code(3);
}

#[cfg(unix)]
#[test]
fn test_run_repeated_failure_opens_circuit() {
    let temp = TempDir::new().unwrap();
    std::fs::write(
        temp.path().join("loopguard.toml"),
        "cooldown_secs = 0\n\n[circuit_breaker]\nsame_error_threshold = 2\n",
    )
    .unwrap();

    loopguard(&temp)
        .args(["run", "--", "sh", "-c", "echo boom >&2; exit 1"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Circuit breaker open"));
}

#[cfg(unix)]
#[test]
fn test_run_error_limit() {
    let temp = TempDir::new().unwrap();
    std::fs::write(
        temp.path().join("loopguard.toml"),
        "cooldown_secs = 0\n\n[circuit_breaker]\nsame_error_threshold = 10\n\n[exit]\nmax_consecutive_errors = 2\n",
    )
    .unwrap();

    loopguard(&temp)
        .args(["run", "--", "sh", "-c", "exit 1"])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("2 consecutive iteration errors"));
}

#[cfg(unix)]
#[test]
fn test_run_passes_task_to_command() {
    let temp = TempDir::new().unwrap();
    let script = r#"test "$LOOPGUARD_TASK" = "fix the build" && echo '{"exit_signal": true}' || exit 9"#;
    loopguard(&temp)
        .args([
            "run",
            "--cooldown",
            "0",
            "--task",
            "fix the build",
            "--",
            "sh",
            "-c",
            script,
        ])
        .assert()
        .success();
}

#[test]
fn test_config_init_and_show() {
    let temp = TempDir::new().unwrap();

    loopguard(&temp)
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote"));
    assert!(temp.path().join("loopguard.toml").exists());

    // Refuses to overwrite without --force
    loopguard(&temp).args(["config", "init"]).assert().failure();
    loopguard(&temp)
        .args(["config", "init", "--force"])
        .assert()
        .success();

    loopguard(&temp)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("max_iterations = 1000"))
        .stdout(predicate::str::contains("[circuit_breaker]"));
}

#[test]
fn test_config_show_json() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("loopguard.toml"), "max_iterations = 7\n").unwrap();

    let output = loopguard(&temp)
        .args(["config", "show", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let config: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(config["max_iterations"], 7);
    assert_eq!(config["exit"]["completion_threshold"], 2);
}

#[test]
fn test_config_validate() {
    let temp = TempDir::new().unwrap();

    loopguard(&temp)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("using defaults"));

    std::fs::write(temp.path().join("loopguard.toml"), "max_iterations = 0\n").unwrap();
    loopguard(&temp)
        .args(["config", "validate"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("max_iterations"));
}

#[test]
fn test_config_path() {
    let temp = TempDir::new().unwrap();

    loopguard(&temp)
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("(defaults)"));

    std::fs::create_dir_all(temp.path().join(".loopguard")).unwrap();
    std::fs::write(
        temp.path().join(".loopguard/config.json"),
        r#"{"max_iterations": 3}"#,
    )
    .unwrap();
    loopguard(&temp)
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.json"));
}

#[test]
fn test_explicit_config_must_exist() {
    let temp = TempDir::new().unwrap();
    loopguard(&temp)
        .arg("--config")
        .arg(temp.path().join("missing.toml"))
        .args(["config", "show"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("not found"));
}
