//! The test driver contract and its implementations.
//!
//! A [`TestDriver`] explores a [`TestPackage`] for tests and runs them.
//! Two sides implement it:
//!
//! ```text
//!  controller process                      host process
//! ┌──────────────────────┐   IPC    ┌──────────────────────────────┐
//! │ RemoteDriverProxy    │ ───────► │ RemoteDriverService          │
//! │  (remote)            │ ◄─────── │  (service)                   │
//! └──────────────────────┘          │     │ DispatchQueue::invoke  │
//!                                   │     ▼                        │
//!                                   │ GenericDriver (generic)      │
//!                                   └──────────────────────────────┘
//! ```
//!
//! The proxy forwards every operation across the process boundary; the
//! service executes it on the host's dispatch thread against a local driver.
//!
//! # Lifecycle
//!
//! `initialize` must come first. `explore`, `run` and `unload` may then be
//! called in any order. `dispose` releases everything and is idempotent.

pub mod generic;
pub mod remote;
pub mod service;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatch::DispatchError;
use crate::ipc::IpcError;
use crate::process::ProcessError;

/// Result type for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Category of a failure reported by the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The operation was not valid in the driver's state.
    InvalidOperation,
    /// The operation ran and returned an error.
    Failed,
    /// The operation panicked on the host's dispatch thread.
    Panicked,
    /// The host shut down before the operation ran.
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::InvalidOperation => "invalid operation",
            FailureKind::Failed => "failed",
            FailureKind::Panicked => "panicked",
            FailureKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Errors raised by test drivers.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// Operation called out of lifecycle order.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The driver inside the host reported a failure.
    #[error("Remote driver {kind}: {message}")]
    Remote { kind: FailureKind, message: String },

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// A discovery or test command could not be run or failed.
    ///
    /// Tests that run and fail are not errors; they are reported as
    /// [`TestOutcome::Failed`].
    #[error("Command execution failed: {0}")]
    ExecFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    /// How this error is described to the other side of a session.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            DriverError::InvalidOperation(_) => FailureKind::InvalidOperation,
            DriverError::Remote { kind, .. } => *kind,
            DriverError::Dispatch(DispatchError::Cancelled) => FailureKind::Cancelled,
            _ => FailureKind::Failed,
        }
    }
}

/// Options passed to [`TestDriver::initialize`].
///
/// Also the `[driver]` section of the configuration file.
///
/// ```toml
/// [driver]
/// discover_command = "cat tests.txt"
/// run_command = "./run-tests.sh {tests}"
/// working_dir = "/opt/tests"
/// env = { DRAWINGS = "/opt/drawings" }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverOptions {
    /// Shell command printing one test id per line.
    ///
    /// `{files}` is replaced by the package files.
    #[serde(default)]
    pub discover_command: Option<String>,

    /// Shell command running tests.
    ///
    /// `{tests}` is replaced by the selected test ids, `{files}` by the
    /// package files.
    #[serde(default)]
    pub run_command: Option<String>,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// The unit a driver explores and runs: a named set of test files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestPackage {
    pub name: String,
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

impl TestPackage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            files: Vec::new(),
        }
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.files.push(file.into());
        self
    }
}

/// A single test found by exploration.
///
/// ```
/// use hostdrive::driver::TestCase;
///
/// let test = TestCase::new("drawing::layers::test_freeze");
/// assert_eq!(test.name, "test_freeze");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    /// Unique identifier used to select the test for running.
    pub id: String,

    /// Display name, the last `::` component of the id.
    pub name: String,
}

impl TestCase {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let name = id.rsplit("::").next().unwrap_or(&id).to_string();
        Self { id, name }
    }
}

/// The outcome status of a test execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Passed,
    Failed,
    Skipped,
    /// The test could not complete, e.g. the run command could not start.
    Error,
}

impl TestOutcome {
    /// Returns `true` for outcomes that don't fail a run.
    pub fn is_success(&self) -> bool {
        matches!(self, TestOutcome::Passed | TestOutcome::Skipped)
    }
}

/// The result of executing a single test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub test: TestCase,
    pub outcome: TestOutcome,
    pub duration: Duration,
    pub error_message: Option<String>,
}

/// Everything a run produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub results: Vec<TestResult>,
    pub duration: Duration,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RunReport {
    pub fn passed(&self) -> usize {
        self.count(TestOutcome::Passed)
    }

    pub fn failed(&self) -> usize {
        self.count(TestOutcome::Failed) + self.count(TestOutcome::Error)
    }

    pub fn skipped(&self) -> usize {
        self.count(TestOutcome::Skipped)
    }

    fn count(&self, outcome: TestOutcome) -> usize {
        self.results.iter().filter(|r| r.outcome == outcome).count()
    }

    /// Returns `true` if no test failed.
    pub fn is_success(&self) -> bool {
        self.results.iter().all(|r| r.outcome.is_success())
    }
}

/// A test driver.
///
/// Implementations need not be thread-safe; the host only calls them from
/// its dispatch thread.
pub trait TestDriver: Send {
    /// Prepares the driver. Must be called before any other operation.
    fn initialize(&mut self, options: &DriverOptions) -> DriverResult<()>;

    /// Finds the tests in `package`.
    fn explore(&mut self, package: &TestPackage) -> DriverResult<Vec<TestCase>>;

    /// Runs the tests with the given ids, or every explored test when
    /// `tests` is empty.
    fn run(&mut self, package: &TestPackage, tests: &[String]) -> DriverResult<RunReport>;

    /// Releases what exploration loaded.
    fn unload(&mut self) -> DriverResult<()>;

    /// Releases all resources. Never fails and may be called repeatedly.
    fn dispose(&mut self);
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Driver answering from fixed data and recording calls.
    #[derive(Default)]
    pub(crate) struct FakeDriver {
        pub(crate) calls: Arc<Mutex<Vec<String>>>,
        pub(crate) initialized: bool,
        pub(crate) fail_explore: bool,
        pub(crate) panic_on_run: bool,
        pub(crate) panic_on_dispose: bool,
    }

    impl FakeDriver {
        pub(crate) fn recording(calls: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                calls,
                ..Default::default()
            }
        }

        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }

        fn ensure_initialized(&self) -> DriverResult<()> {
            if self.initialized {
                Ok(())
            } else {
                Err(DriverError::InvalidOperation("not initialized".to_string()))
            }
        }
    }

    impl TestDriver for FakeDriver {
        fn initialize(&mut self, _options: &DriverOptions) -> DriverResult<()> {
            self.record("initialize");
            self.initialized = true;
            Ok(())
        }

        fn explore(&mut self, package: &TestPackage) -> DriverResult<Vec<TestCase>> {
            self.record("explore");
            self.ensure_initialized()?;
            if self.fail_explore {
                return Err(DriverError::ExecFailed("discovery exploded".to_string()));
            }
            Ok(vec![
                TestCase::new(format!("{}::test_a", package.name)),
                TestCase::new(format!("{}::test_b", package.name)),
            ])
        }

        fn run(&mut self, _package: &TestPackage, tests: &[String]) -> DriverResult<RunReport> {
            self.record("run");
            self.ensure_initialized()?;
            if self.panic_on_run {
                panic!("driver crashed");
            }
            Ok(RunReport {
                results: tests
                    .iter()
                    .map(|id| TestResult {
                        test: TestCase::new(id.clone()),
                        outcome: TestOutcome::Passed,
                        duration: Duration::from_millis(1),
                        error_message: None,
                    })
                    .collect(),
                exit_code: Some(0),
                ..Default::default()
            })
        }

        fn unload(&mut self) -> DriverResult<()> {
            self.record("unload");
            Ok(())
        }

        fn dispose(&mut self) {
            self.record("dispose");
            if self.panic_on_dispose {
                panic!("dispose exploded");
            }
        }
    }
}
