//! Host process abstraction: one instance of the externally controlled
//! application.
//!
//! A [`HostProcess`] is either a process this crate launched
//! ([`CreatedProcess`]) or one the user already had running
//! ([`ExistingProcess`]). Both share the same lifecycle:
//!
//! ```text
//!   new ──► start(port, correlation, debugger) ──► dispose
//!             │
//!             ├─ Created:  spawn ─► poll until plugin loaded ─► endpoint command
//!             └─ Existing: validate ─► endpoint command
//! ```
//!
//! Readiness is detected by polling: every `ready_poll_interval` the created
//! process is asked to `NETLOAD` the plugin and checked for the plugin module
//! being mapped. After `ready_timeout` the start fails with
//! [`ProcessError::Timeout`].
//!
//! The OS-facing pieces sit behind small traits so the lifecycle can be
//! tested without real processes:
//!
//! | Trait | OS implementation |
//! |-------|-------------------|
//! | [`ProcessCreator`] | [`os::OsProcessCreator`] |
//! | [`ProcessFinder`] | [`os::OsProcessFinder`] |
//! | [`CommandRunner`] | [`command::InboxCommandRunner`] |
//!
//! # Disposal
//!
//! Disposal never fails. A created process that is still running is killed;
//! kill failures go to the [`ErrorSink`]. An existing process belongs to the
//! user and is only released, never killed.

pub mod command;
pub mod os;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::diagnostics::{ErrorSink, default_sink};
use crate::liveness::deadline_after;

pub use command::HostCommand;

/// Environment variable that switches a host process to debug logging.
pub const DEBUG_ENV_VAR: &str = "HOSTDRIVE_DEBUG";

/// Smallest pause between endpoint command retries.
const MIN_RETRY_PAUSE: Duration = Duration::from_millis(10);

/// Result type for host process operations.
pub type ProcessResult<T> = Result<T, ProcessError>;

/// Errors raised while resolving, starting or commanding a host process.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The operation is not valid in the current lifecycle state.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A path or option value is malformed or missing.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Directory not found: {0}")]
    DirectoryNotFound(String),

    /// The request is understood but cannot be honored, e.g. several
    /// candidate processes to attach to.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// The host did not become ready in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The host is not accepting commands yet. Retryable.
    #[error("Host not ready: {0}")]
    NotReady(String),

    /// A command reached the host but could not be delivered or executed.
    #[error("Host command failed: {0}")]
    CommandFailed(String),

    /// The process could not be spawned.
    #[error("Failed to start host process: {0}")]
    StartFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ProcessError {
    /// Returns `true` for conditions that may clear up on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessError::NotReady(_))
    }
}

/// A handle on a running (or exited) OS process.
pub trait ProcessHandle: Send + Sync {
    /// OS process id.
    fn id(&self) -> u32;

    /// Returns `true` once the process has terminated.
    fn has_exited(&self) -> bool;

    /// Returns `true` if `module` is loaded into the process.
    fn is_module_loaded(&self, module: &Path) -> bool;

    /// Terminates the process.
    fn kill(&self) -> io::Result<()>;
}

/// Parameters for launching a process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartInfo {
    pub file_name: PathBuf,
    pub arguments: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// Launches new processes.
pub trait ProcessCreator: Send + Sync {
    fn start(&self, info: &StartInfo) -> io::Result<Box<dyn ProcessHandle>>;
}

/// Discovers running processes by name.
pub trait ProcessFinder: Send + Sync {
    fn processes_by_name(&self, name: &str) -> io::Result<Vec<Box<dyn ProcessHandle>>>;
}

/// Executes named commands inside a host process.
pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &HostCommand, process: &dyn ProcessHandle) -> ProcessResult<()>;
}

/// Debugging options for a host session.
///
/// A launched host receives these variables in its environment. The
/// default turns on debug logging in the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebuggerSetup {
    pub env: Vec<(String, String)>,
}

impl Default for DebuggerSetup {
    fn default() -> Self {
        Self {
            env: vec![(DEBUG_ENV_VAR.to_string(), "1".to_string())],
        }
    }
}

/// Timing and readiness parameters shared by both process variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSettings {
    /// Module whose presence in the host marks it ready.
    pub plugin_path: PathBuf,
    pub ready_poll_interval: Duration,
    pub ready_timeout: Duration,
    /// Watchdog window handed to the host with the endpoint command.
    pub watchdog_timeout: Duration,
}

/// The collaborators a host process needs, bundled for the factory.
#[derive(Clone)]
pub struct ProcessServices {
    pub creator: Arc<dyn ProcessCreator>,
    pub finder: Arc<dyn ProcessFinder>,
    pub runner: Arc<dyn CommandRunner>,
    pub sink: Arc<dyn ErrorSink>,
}

impl ProcessServices {
    /// Services backed by the real operating system.
    pub fn os() -> Self {
        Self {
            creator: Arc::new(os::OsProcessCreator),
            finder: Arc::new(os::OsProcessFinder),
            runner: Arc::new(command::InboxCommandRunner::default()),
            sink: default_sink(),
        }
    }
}

/// One instance of the controlled application, launched or adopted.
pub enum HostProcess {
    Created(CreatedProcess),
    Existing(ExistingProcess),
}

impl HostProcess {
    /// Starts the host and asks it to open an IPC endpoint at `port_name`
    /// tagged with `correlation_id`.
    pub fn start(
        &mut self,
        port_name: &str,
        correlation_id: &str,
        debugger: Option<&DebuggerSetup>,
    ) -> ProcessResult<()> {
        match self {
            HostProcess::Created(p) => p.start(port_name, correlation_id, debugger),
            HostProcess::Existing(p) => p.start(port_name, correlation_id),
        }
    }

    /// Releases the process. Safe to call repeatedly and before `start`.
    pub fn dispose(&mut self) {
        match self {
            HostProcess::Created(p) => p.dispose(),
            HostProcess::Existing(p) => p.dispose(),
        }
    }

    /// The executable, absent for an adopted process.
    pub fn file_name(&self) -> Option<&Path> {
        match self {
            HostProcess::Created(p) => Some(p.file_name()),
            HostProcess::Existing(_) => None,
        }
    }

    pub fn arguments(&self) -> Option<&str> {
        match self {
            HostProcess::Created(p) => p.arguments(),
            HostProcess::Existing(_) => None,
        }
    }

    pub fn working_directory(&self) -> Option<&Path> {
        match self {
            HostProcess::Created(p) => p.working_directory(),
            HostProcess::Existing(_) => None,
        }
    }

    fn settings(&self) -> &HostSettings {
        match self {
            HostProcess::Created(p) => &p.settings,
            HostProcess::Existing(p) => &p.settings,
        }
    }

    pub fn ready_poll_interval(&self) -> Duration {
        self.settings().ready_poll_interval
    }

    pub fn ready_timeout(&self) -> Duration {
        self.settings().ready_timeout
    }

    /// Returns `true` once the underlying process has terminated. A process
    /// that was never launched has not exited.
    pub fn has_exited(&self) -> bool {
        match self {
            HostProcess::Created(p) => p.handle.as_ref().is_some_and(|h| h.has_exited()),
            HostProcess::Existing(p) => p.handle.as_ref().is_some_and(|h| h.has_exited()),
        }
    }

    /// OS process id, once there is a process.
    pub fn id(&self) -> Option<u32> {
        match self {
            HostProcess::Created(p) => p.handle.as_ref().map(|h| h.id()),
            HostProcess::Existing(p) => p.handle.as_ref().map(|h| h.id()),
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, HostProcess::Created(_))
    }

    pub fn is_existing(&self) -> bool {
        matches!(self, HostProcess::Existing(_))
    }
}

/// A host process launched by this crate.
pub struct CreatedProcess {
    file_name: PathBuf,
    arguments: Option<String>,
    working_directory: Option<PathBuf>,
    settings: HostSettings,
    creator: Arc<dyn ProcessCreator>,
    runner: Arc<dyn CommandRunner>,
    sink: Arc<dyn ErrorSink>,
    handle: Option<Box<dyn ProcessHandle>>,
    started: bool,
    disposed: bool,
}

impl CreatedProcess {
    pub fn new(file_name: impl Into<PathBuf>, settings: HostSettings, services: &ProcessServices) -> Self {
        Self {
            file_name: file_name.into(),
            arguments: None,
            working_directory: None,
            settings,
            creator: services.creator.clone(),
            runner: services.runner.clone(),
            sink: services.sink.clone(),
            handle: None,
            started: false,
            disposed: false,
        }
    }

    /// Sets the command line arguments, split shell-style at start.
    pub fn with_arguments(mut self, arguments: Option<String>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_working_directory(mut self, working_directory: Option<PathBuf>) -> Self {
        self.working_directory = working_directory;
        self
    }

    pub fn file_name(&self) -> &Path {
        &self.file_name
    }

    pub fn arguments(&self) -> Option<&str> {
        self.arguments.as_deref()
    }

    pub fn working_directory(&self) -> Option<&Path> {
        self.working_directory.as_deref()
    }

    fn start_info(&self, debugger: Option<&DebuggerSetup>) -> ProcessResult<StartInfo> {
        let arguments = match &self.arguments {
            Some(args) => shell_words::split(args).map_err(|e| {
                ProcessError::InvalidArgument(format!("Malformed arguments '{}': {}", args, e))
            })?,
            None => Vec::new(),
        };

        Ok(StartInfo {
            file_name: self.file_name.clone(),
            arguments,
            working_directory: self.working_directory.clone(),
            env: debugger.map(|d| d.env.clone()).unwrap_or_default(),
        })
    }

    /// Launches the process and waits for it to become ready.
    pub fn start(
        &mut self,
        port_name: &str,
        correlation_id: &str,
        debugger: Option<&DebuggerSetup>,
    ) -> ProcessResult<()> {
        if self.disposed {
            return Err(ProcessError::InvalidOperation(
                "The host process has been disposed".to_string(),
            ));
        }
        if self.started {
            return Err(ProcessError::InvalidOperation(
                "The host process has already been started".to_string(),
            ));
        }
        self.started = true;

        let info = self.start_info(debugger)?;
        info!(
            "Starting host process: {} {}",
            info.file_name.display(),
            info.arguments.join(" ")
        );

        let handle = self.creator.start(&info).map_err(|e| {
            ProcessError::StartFailed(format!("{}: {}", info.file_name.display(), e))
        })?;
        let handle: &dyn ProcessHandle = &**self.handle.insert(handle);
        debug!("Host process started with pid {}", handle.id());

        let started_at = Instant::now();
        let deadline = deadline_after(started_at, self.settings.ready_timeout);
        wait_until_ready(handle, self.runner.as_ref(), &self.settings, started_at)?;

        let endpoint = HostCommand::create_endpoint_and_wait(
            port_name,
            correlation_id,
            self.settings.watchdog_timeout,
        );
        send_with_retry(
            handle,
            self.runner.as_ref(),
            &endpoint,
            deadline,
            self.settings.ready_poll_interval,
        )
    }

    /// Kills the process if it is still running and releases the handle.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        if let Some(handle) = self.handle.take() {
            if handle.has_exited() {
                debug!("Host process {} already exited", handle.id());
            } else {
                info!("Terminating host process {}", handle.id());
                if let Err(e) = handle.kill() {
                    self.sink.report("Failed to terminate host process", &e);
                }
            }
        }
    }
}

impl Drop for CreatedProcess {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// A host process that was already running and has been adopted.
pub struct ExistingProcess {
    settings: HostSettings,
    runner: Arc<dyn CommandRunner>,
    handle: Option<Box<dyn ProcessHandle>>,
    started: bool,
}

impl ExistingProcess {
    pub fn new(handle: Box<dyn ProcessHandle>, settings: HostSettings, services: &ProcessServices) -> Self {
        Self {
            settings,
            runner: services.runner.clone(),
            handle: Some(handle),
            started: false,
        }
    }

    /// Validates the process and asks it to open the endpoint.
    pub fn start(&mut self, port_name: &str, correlation_id: &str) -> ProcessResult<()> {
        let Some(handle) = self.handle.as_deref() else {
            return Err(ProcessError::InvalidOperation(
                "The host process has been disposed".to_string(),
            ));
        };
        if self.started {
            return Err(ProcessError::InvalidOperation(
                "The host process has already been started".to_string(),
            ));
        }
        if handle.has_exited() {
            return Err(ProcessError::InvalidOperation(format!(
                "The host process {} has exited",
                handle.id()
            )));
        }
        self.started = true;

        info!("Attaching to running host process {}", handle.id());

        let net_load = HostCommand::net_load(&self.settings.plugin_path);
        if let Err(e) = self.runner.run(&net_load, handle) {
            debug!("Plugin load request not accepted: {}", e);
        }

        let endpoint = HostCommand::create_endpoint_and_wait(
            port_name,
            correlation_id,
            self.settings.watchdog_timeout,
        );
        send_with_retry(
            handle,
            self.runner.as_ref(),
            &endpoint,
            deadline_after(Instant::now(), self.settings.ready_timeout),
            self.settings.ready_poll_interval,
        )
    }

    /// Releases the handle. The process itself keeps running.
    pub fn dispose(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!("Releasing host process {}", handle.id());
        }
    }
}

impl Drop for ExistingProcess {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn wait_until_ready(
    handle: &dyn ProcessHandle,
    runner: &dyn CommandRunner,
    settings: &HostSettings,
    started_at: Instant,
) -> ProcessResult<()> {
    let net_load = HostCommand::net_load(&settings.plugin_path);

    loop {
        if handle.has_exited() {
            return Err(ProcessError::InvalidOperation(format!(
                "The host process {} exited before it became ready",
                handle.id()
            )));
        }

        if let Err(e) = runner.run(&net_load, handle) {
            debug!("Plugin load request not accepted yet: {}", e);
        }

        if handle.is_module_loaded(&settings.plugin_path) {
            debug!(
                "Host process {} ready after {:?}",
                handle.id(),
                started_at.elapsed()
            );
            return Ok(());
        }

        if started_at.elapsed() >= settings.ready_timeout {
            return Err(ProcessError::Timeout(format!(
                "{} was not loaded into host process {} within {:?}",
                settings.plugin_path.display(),
                handle.id(),
                settings.ready_timeout
            )));
        }

        thread::sleep(settings.ready_poll_interval);
    }
}

fn send_with_retry(
    handle: &dyn ProcessHandle,
    runner: &dyn CommandRunner,
    command: &HostCommand,
    deadline: Instant,
    pause: Duration,
) -> ProcessResult<()> {
    loop {
        if handle.has_exited() {
            return Err(ProcessError::InvalidOperation(format!(
                "The host process {} exited before accepting {}",
                handle.id(),
                command.global_name
            )));
        }

        match runner.run(command, handle) {
            Ok(()) => {
                debug!("Host accepted {}", command.global_name);
                return Ok(());
            }
            Err(e) if e.is_retryable() && Instant::now() < deadline => {
                debug!("Retrying {}: {}", command.global_name, e);
                thread::sleep(pause.max(MIN_RETRY_PAUSE));
            }
            Err(e) if e.is_retryable() => {
                warn!("Host never accepted {}: {}", command.global_name, e);
                return Err(ProcessError::Timeout(format!(
                    "Host did not accept {}: {}",
                    command.global_name, e
                )));
            }
            Err(e) => return Err(e),
        }
    }
}
