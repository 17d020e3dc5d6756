//! End-to-end sessions against a real `hostdrive host` child process.
#![cfg(target_os = "linux")]

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn binary() -> PathBuf {
    assert_cmd::cargo::cargo_bin("hostdrive")
}

/// Writes a config that launches this crate's binary as the host.
fn write_config(dir: &Path, run_command: &str) -> PathBuf {
    let config = dir.join("hostdrive.toml");
    let content = format!(
        r#"
[host]
process_name = "no-such-host-e2e"
ready_poll_interval_ms = 20
ready_timeout_secs = 20
state_dir = "{state}"

[preferences]
startup_action = "start_user_specified"
user_specified_executable = "{exe}"
command_line_arguments = "host --startup-timeout-secs 30"

[session]
ping_interval_ms = 100
watchdog_timeout_ms = 10000
connect_timeout_secs = 20

[driver]
discover_command = "printf 'suite::alpha\\nsuite::beta\\n'"
run_command = "{run}"
"#,
        state = dir.join("state").display(),
        exe = binary().display(),
        run = run_command,
    );
    std::fs::write(&config, content).unwrap();
    config
}

fn run(dir: &Path, config: &Path) -> Command {
    let mut cmd = Command::new(binary());
    cmd.env("TMPDIR", dir).arg("-c").arg(config).arg("run");
    cmd
}

#[test]
fn test_passing_session() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "echo ran {tests}");

    run(dir.path(), &config)
        .assert()
        .success()
        .stdout(predicate::str::contains("PASS suite::alpha"))
        .stdout(predicate::str::contains("PASS suite::beta"))
        .stdout(predicate::str::contains("2 passed, 0 failed"));

    // The launched executable is remembered.
    let recent = std::fs::read_to_string(dir.path().join("state/recent_executables.json")).unwrap();
    assert!(recent.contains("hostdrive"));
}

#[test]
fn test_selected_failing_test() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "exit 4");

    run(dir.path(), &config)
        .args(["--test", "suite::beta"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("FAIL suite::beta (Exit code: 4)"))
        .stdout(predicate::str::contains("0 passed, 1 failed"));
}

#[test]
fn test_collect_only_lists_tests() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "true");

    run(dir.path(), &config)
        .arg("--collect-only")
        .assert()
        .success()
        .stdout(predicate::eq("suite::alpha\nsuite::beta\n"));
}
