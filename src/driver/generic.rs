//! Generic shell-command test driver.
//!
//! Runs inside the host. Exploration runs `discover_command` through
//! `sh -c` and takes one test id per output line; blank lines and lines
//! starting with `#` are ignored. Running substitutes the selected ids into
//! `run_command` and marks every selected test from the command's exit code.

use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use std::time::Instant;

use tracing::{debug, info, warn};

use super::{
    DriverError, DriverOptions, DriverResult, RunReport, TestCase, TestDriver, TestOutcome,
    TestPackage, TestResult,
};

/// Driver configured entirely by [`DriverOptions`] commands.
#[derive(Debug, Default)]
pub struct GenericDriver {
    options: Option<DriverOptions>,
    explored: Vec<TestCase>,
}

impl GenericDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn options(&self) -> DriverResult<&DriverOptions> {
        self.options.as_ref().ok_or_else(|| {
            DriverError::InvalidOperation("The driver has not been initialized".to_string())
        })
    }

    fn shell(&self, options: &DriverOptions, script: &str) -> DriverResult<Output> {
        debug!("Running: sh -c {}", script);

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        if let Some(dir) = &options.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &options.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null());

        cmd.output()
            .map_err(|e| DriverError::ExecFailed(format!("{}: {}", script, e)))
    }
}

/// Parses discovery output into test cases.
fn parse_discover_output(output: &str) -> Vec<TestCase> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(TestCase::new)
        .collect()
}

/// Substitutes `{tests}` and `{files}` placeholders.
fn substitute(template: &str, tests: &[String], files: &[PathBuf]) -> String {
    let files: Vec<String> = files
        .iter()
        .map(|f| f.to_string_lossy().into_owned())
        .collect();
    template
        .replace("{tests}", &shell_words::join(tests))
        .replace("{files}", &shell_words::join(&files))
}

impl TestDriver for GenericDriver {
    fn initialize(&mut self, options: &DriverOptions) -> DriverResult<()> {
        debug!("Initializing generic driver");
        self.options = Some(options.clone());
        self.explored.clear();
        Ok(())
    }

    fn explore(&mut self, package: &TestPackage) -> DriverResult<Vec<TestCase>> {
        let options = self.options()?;
        let Some(template) = options.discover_command.as_deref() else {
            return Err(DriverError::InvalidOperation(
                "No discover_command is configured".to_string(),
            ));
        };

        let script = substitute(template, &[], &package.files);
        let output = self.shell(options, &script)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Err(DriverError::ExecFailed(format!(
                "Discovery command failed ({}): {}",
                output.status,
                stderr.trim()
            )));
        }

        let tests = parse_discover_output(&stdout);
        if tests.is_empty() {
            warn!("No tests discovered in package '{}'", package.name);
        }
        info!("Explored {} test(s) in '{}'", tests.len(), package.name);

        self.explored = tests.clone();
        Ok(tests)
    }

    fn run(&mut self, package: &TestPackage, tests: &[String]) -> DriverResult<RunReport> {
        let options = self.options()?;
        let Some(template) = options.run_command.as_deref() else {
            return Err(DriverError::InvalidOperation(
                "No run_command is configured".to_string(),
            ));
        };

        let selected: Vec<String> = if tests.is_empty() {
            self.explored.iter().map(|t| t.id.clone()).collect()
        } else {
            tests.to_vec()
        };

        let script = substitute(template, &selected, &package.files);
        let started = Instant::now();
        let output = self.shell(options, &script)?;
        let duration = started.elapsed();

        let exit_code = output.status.code();
        let outcome = if output.status.success() {
            TestOutcome::Passed
        } else {
            TestOutcome::Failed
        };
        let error_message = (!output.status.success()).then(|| match exit_code {
            Some(code) => format!("Exit code: {}", code),
            None => "Terminated by signal".to_string(),
        });

        info!(
            "Ran {} test(s) in {:?}: {:?}",
            selected.len(),
            duration,
            outcome
        );

        Ok(RunReport {
            results: selected
                .into_iter()
                .map(|id| TestResult {
                    test: TestCase::new(id),
                    outcome,
                    duration,
                    error_message: error_message.clone(),
                })
                .collect(),
            duration,
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn unload(&mut self) -> DriverResult<()> {
        self.options()?;
        self.explored.clear();
        Ok(())
    }

    fn dispose(&mut self) {
        self.options = None;
        self.explored.clear();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn driver(discover: &str, run: &str) -> GenericDriver {
        let mut driver = GenericDriver::new();
        driver
            .initialize(&DriverOptions {
                discover_command: Some(discover.to_string()),
                run_command: Some(run.to_string()),
                ..Default::default()
            })
            .unwrap();
        driver
    }

    #[test]
    fn test_parse_discover_output_skips_comments() {
        let tests = parse_discover_output("# header\n\n  a::one  \nb::two\n#c\n");
        let ids: Vec<_> = tests.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a::one", "b::two"]);
    }

    #[test]
    fn test_substitute_quotes_ids() {
        let cmd = substitute(
            "run {tests} -- {files}",
            &["a b".to_string(), "c".to_string()],
            &[PathBuf::from("x.scr")],
        );
        assert_eq!(cmd, "run 'a b' c -- x.scr");
    }

    #[test]
    fn test_operations_before_initialize() {
        let mut driver = GenericDriver::new();
        let package = TestPackage::new("pkg");

        assert!(matches!(
            driver.explore(&package),
            Err(DriverError::InvalidOperation(_))
        ));
        assert!(matches!(
            driver.run(&package, &[]),
            Err(DriverError::InvalidOperation(_))
        ));
        assert!(matches!(
            driver.unload(),
            Err(DriverError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_explore_and_run_all() {
        let mut driver = driver("printf 'one\\ntwo\\n'", "true");
        let package = TestPackage::new("pkg");

        let tests = driver.explore(&package).unwrap();
        assert_eq!(tests.len(), 2);

        let report = driver.run(&package, &[]).unwrap();
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.passed(), 2);
        assert_eq!(report.exit_code, Some(0));
    }

    #[test]
    fn test_run_selected_marks_failure() {
        let mut driver = driver("true", "echo ran {tests}; exit 3");
        let package = TestPackage::new("pkg");

        let report = driver.run(&package, &["only".to_string()]).unwrap();
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].outcome, TestOutcome::Failed);
        assert_eq!(
            report.results[0].error_message.as_deref(),
            Some("Exit code: 3")
        );
        assert_eq!(report.stdout.trim(), "ran only");
        assert!(!report.is_success());
    }

    #[test]
    fn test_failing_discovery_is_error() {
        let mut driver = driver("echo nope >&2; exit 1", "true");
        let err = driver.explore(&TestPackage::new("pkg")).unwrap_err();
        assert!(matches!(err, DriverError::ExecFailed(msg) if msg.contains("nope")));
    }

    #[test]
    fn test_env_and_working_dir_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = GenericDriver::new();
        driver
            .initialize(&DriverOptions {
                discover_command: Some("echo \"$SUITE\"; ls".to_string()),
                working_dir: Some(dir.path().to_path_buf()),
                env: [("SUITE".to_string(), "layers".to_string())].into(),
                ..Default::default()
            })
            .unwrap();
        std::fs::write(dir.path().join("marker_file"), "").unwrap();

        let tests = driver.explore(&TestPackage::new("pkg")).unwrap();
        let ids: Vec<_> = tests.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["layers", "marker_file"]);
    }

    #[test]
    fn test_dispose_requires_reinitialize() {
        let mut driver = driver("echo one", "true");
        driver.dispose();
        driver.dispose();
        assert!(driver.explore(&TestPackage::new("pkg")).is_err());
    }
}
