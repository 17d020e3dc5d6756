//! Command-line behavior that needs no host application.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn hostdrive() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin("hostdrive"))
}

#[test]
fn test_help_lists_commands() {
    hostdrive()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("host"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("init"));
}

#[test]
fn test_init_then_validate() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("hostdrive.toml");

    hostdrive()
        .arg("-c")
        .arg(&config)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Created"));
    assert!(config.is_file());

    hostdrive()
        .arg("-c")
        .arg(&config)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"))
        .stdout(predicate::str::contains("Host process: acad"));
}

#[test]
fn test_init_refuses_to_overwrite() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("hostdrive.toml");
    std::fs::write(&config, "# mine\n").unwrap();

    hostdrive()
        .arg("-c")
        .arg(&config)
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));
    assert_eq!(std::fs::read_to_string(&config).unwrap(), "# mine\n");

    hostdrive()
        .arg("-c")
        .arg(&config)
        .args(["init", "--force"])
        .assert()
        .success();
    assert!(std::fs::read_to_string(&config).unwrap().contains("[session]"));
}

#[test]
fn test_validate_reports_bad_config() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("hostdrive.toml");
    std::fs::write(&config, "[preferences]\nstartup_action = \"sometimes\"\n").unwrap();

    hostdrive()
        .arg("-c")
        .arg(&config)
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_validate_rejects_zero_watchdog() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("hostdrive.toml");
    std::fs::write(&config, "[session]\nwatchdog_timeout_ms = 0\n").unwrap();

    hostdrive()
        .arg("-c")
        .arg(&config)
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("watchdog_timeout_ms must be greater than 0"));
}

#[test]
fn test_validate_missing_file() {
    let dir = TempDir::new().unwrap();

    hostdrive()
        .arg("-c")
        .arg(dir.path().join("absent.toml"))
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}

#[test]
fn test_run_rejects_malformed_property() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("hostdrive.toml");
    std::fs::write(&config, "").unwrap();

    hostdrive()
        .arg("-c")
        .arg(&config)
        .args(["run", "--property", "NoEqualsSign"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("KEY=VALUE"));
}

#[test]
fn test_run_with_missing_executable_fails() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("hostdrive.toml");
    std::fs::write(
        &config,
        format!(
            "[host]\nprocess_name = \"no-such-host\"\nstate_dir = \"{}\"\n",
            dir.path().join("state").display()
        ),
    )
    .unwrap();

    hostdrive()
        .arg("-c")
        .arg(&config)
        .args(["run", "--exe"])
        .arg(dir.path().join("missing-host"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("File not found"));
}
