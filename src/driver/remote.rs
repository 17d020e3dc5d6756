//! Controller-side stand-in for a driver running inside the host.
//!
//! # State machine
//!
//! ```text
//!              start / initialize             shutdown
//! NotStarted ──────────────────────► Started ──────────► ShuttingDown
//!     │                                 │                     │
//!     └──────────── dispose ────────────┴───── dispose ───────┴──► Disposed
//! ```
//!
//! | Operation | NotStarted | Started | ShuttingDown / Disposed |
//! |-----------|------------|---------|-------------------------|
//! | `initialize` | starts, then forwards | forwards | `InvalidOperation` |
//! | `explore`, `run`, `unload` | `InvalidOperation` | forwards | `InvalidOperation` |
//! | `shutdown` | no-op | stops the remote side | no-op |
//! | `dispose` | `Disposed` | shutdown, release host | no-op once disposed |
//!
//! Starting asks the [`ProcessFactory`] for a host, binds an
//! [`IpcListener`], and hands the host the port name and a fresh correlation
//! id. Once the host connects back, a pinger thread keeps the host's watchdog
//! fed until shutdown.

use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info};
use uuid::Uuid;

use super::{
    DriverError, DriverOptions, DriverResult, RunReport, TestCase, TestDriver, TestPackage,
};
use crate::config::SessionConfig;
use crate::diagnostics::ErrorSink;
use crate::factory::{IsolationOptions, ProcessFactory};
use crate::ipc::{IpcClient, IpcError, IpcListener, Reply, Request};
use crate::liveness::deadline_after;
use crate::process::{DebuggerSetup, HostProcess};

/// How long to wait for the host to acknowledge a shutdown and exit.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

const EXIT_POLL: Duration = Duration::from_millis(20);

/// Lifecycle state of a [`RemoteDriverProxy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    NotStarted,
    Started,
    ShuttingDown,
    Disposed,
}

/// Session timing for a [`RemoteDriverProxy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub ping_interval: Duration,
    pub connect_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub debugger: Option<DebuggerSetup>,
}

impl ProxySettings {
    pub fn from_session(session: &SessionConfig) -> Self {
        Self {
            ping_interval: session.ping_interval(),
            connect_timeout: session.connect_timeout(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            debugger: session.debug.then(DebuggerSetup::default),
        }
    }
}

/// Background thread pinging the host at a fixed interval.
struct Pinger {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: JoinHandle<()>,
}

impl Pinger {
    fn spawn(client: Arc<IpcClient>, interval: Duration) -> std::io::Result<Self> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = stop.clone();

        let handle = thread::Builder::new()
            .name("driver-pinger".to_string())
            .spawn(move || {
                let (lock, cvar) = &*signal;
                loop {
                    let stopped = lock.lock().unwrap_or_else(PoisonError::into_inner);
                    let (stopped, _) = cvar
                        .wait_timeout_while(stopped, interval, |s| !*s)
                        .unwrap_or_else(PoisonError::into_inner);
                    if *stopped {
                        return;
                    }
                    drop(stopped);

                    match client.call(Request::Ping) {
                        Ok(Reply::Pong) => {}
                        Ok(other) => debug!("Unexpected ping reply: {:?}", other),
                        Err(IpcError::Disconnected) => {
                            debug!("Host disconnected, pinger stopping");
                            return;
                        }
                        Err(e) => debug!("Ping failed: {}", e),
                    }
                }
            })?;

        Ok(Self { stop, handle })
    }

    fn stop(self) {
        let (lock, cvar) = &*self.stop;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
        let _ = self.handle.join();
    }
}

struct Session {
    client: Arc<IpcClient>,
    correlation_id: Uuid,
    port_name: String,
    pinger: Option<Pinger>,
}

/// A [`TestDriver`] whose operations execute inside a host process.
pub struct RemoteDriverProxy {
    factory: Arc<ProcessFactory>,
    options: IsolationOptions,
    settings: ProxySettings,
    sink: Arc<dyn ErrorSink>,
    state: ProxyState,
    process: Option<HostProcess>,
    session: Option<Session>,
}

impl RemoteDriverProxy {
    pub fn new(
        factory: Arc<ProcessFactory>,
        options: IsolationOptions,
        settings: ProxySettings,
    ) -> Self {
        let sink = factory.sink();
        Self {
            factory,
            options,
            settings,
            sink,
            state: ProxyState::NotStarted,
            process: None,
            session: None,
        }
    }

    pub fn state(&self) -> ProxyState {
        self.state
    }

    /// OS process id of the host, once started.
    pub fn process_id(&self) -> Option<u32> {
        self.process.as_ref().and_then(HostProcess::id)
    }

    pub fn correlation_id(&self) -> Option<Uuid> {
        self.session.as_ref().map(|s| s.correlation_id)
    }

    pub fn port_name(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.port_name.as_str())
    }

    /// Executable of a launched host; `None` when attached or not started.
    pub fn host_file_name(&self) -> Option<&Path> {
        self.process.as_ref().and_then(HostProcess::file_name)
    }

    /// Obtains the host process and opens the IPC session.
    ///
    /// On failure the host is disposed and the proxy stays `NotStarted`.
    pub fn start(&mut self) -> DriverResult<()> {
        match self.state {
            ProxyState::NotStarted => {}
            ProxyState::Started => {
                return Err(DriverError::InvalidOperation(
                    "The remote driver has already been started".to_string(),
                ));
            }
            ProxyState::ShuttingDown | ProxyState::Disposed => {
                return Err(DriverError::InvalidOperation(
                    "The remote driver has been shut down".to_string(),
                ));
            }
        }

        let mut process = self.factory.create_process(&self.options)?;
        match self.open_session(&mut process) {
            Ok(session) => {
                info!(
                    "Remote driver session {} started on {}",
                    session.correlation_id, session.port_name
                );
                self.process = Some(process);
                self.session = Some(session);
                self.state = ProxyState::Started;
                Ok(())
            }
            Err(e) => {
                process.dispose();
                Err(e)
            }
        }
    }

    fn open_session(&self, process: &mut HostProcess) -> DriverResult<Session> {
        let listener = IpcListener::bind()?;
        let correlation_id = Uuid::new_v4();
        let id = correlation_id.to_string();

        process.start(listener.port_name(), &id, self.settings.debugger.as_ref())?;

        let client = listener.accept(&id, self.settings.connect_timeout, || {
            !process.has_exited()
        })?;
        let client = Arc::new(client);
        let pinger = Pinger::spawn(client.clone(), self.settings.ping_interval)?;

        Ok(Session {
            client,
            correlation_id,
            port_name: listener.port_name().to_string(),
            pinger: Some(pinger),
        })
    }

    fn call(&self, request: Request) -> DriverResult<Reply> {
        let session = match (self.state, &self.session) {
            (ProxyState::Started, Some(session)) => session,
            (ProxyState::NotStarted, _) => {
                return Err(DriverError::InvalidOperation(format!(
                    "Cannot {} before the remote driver is started",
                    request.name()
                )));
            }
            _ => {
                return Err(DriverError::InvalidOperation(format!(
                    "Cannot {} after the remote driver has shut down",
                    request.name()
                )));
            }
        };

        match session.client.call(request)? {
            Reply::Failed { kind, message } => Err(DriverError::Remote { kind, message }),
            reply => Ok(reply),
        }
    }

    /// Asks the host to shut down and waits for it to confirm.
    ///
    /// Failures are reported to the error sink rather than returned.
    pub fn shutdown(&mut self) {
        if self.state != ProxyState::Started {
            return;
        }
        self.state = ProxyState::ShuttingDown;

        let Some(mut session) = self.session.take() else {
            return;
        };
        if let Some(pinger) = session.pinger.take() {
            pinger.stop();
        }

        match session
            .client
            .call_timeout(Request::Shutdown, self.settings.shutdown_timeout)
        {
            Ok(Reply::ShuttingDown) => debug!("Host acknowledged shutdown"),
            Ok(other) => self.sink.report(
                "Host answered shutdown unexpectedly",
                &IpcError::UnexpectedReply(format!("{:?}", other)),
            ),
            Err(e) => self.sink.report("Host did not acknowledge shutdown", &e),
        }
        drop(session);

        if let Some(process) = self.process.as_ref().filter(|p| p.is_created()) {
            let deadline = deadline_after(Instant::now(), self.settings.shutdown_timeout);
            while !process.has_exited() && Instant::now() < deadline {
                thread::sleep(EXIT_POLL);
            }
        }
    }

    /// Shuts down if needed and releases the host process.
    ///
    /// Safe to call repeatedly and without ever starting.
    pub fn dispose(&mut self) {
        if self.state == ProxyState::Disposed {
            return;
        }
        self.shutdown();
        if let Some(mut process) = self.process.take() {
            process.dispose();
        }
        self.state = ProxyState::Disposed;
        debug!("Remote driver disposed");
    }
}

fn unexpected(reply: Reply) -> DriverError {
    DriverError::Ipc(IpcError::UnexpectedReply(format!("{:?}", reply)))
}

impl TestDriver for RemoteDriverProxy {
    fn initialize(&mut self, options: &DriverOptions) -> DriverResult<()> {
        if self.state == ProxyState::NotStarted {
            self.start()?;
        }
        match self.call(Request::Initialize {
            options: options.clone(),
        })? {
            Reply::Initialized => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    fn explore(&mut self, package: &TestPackage) -> DriverResult<Vec<TestCase>> {
        match self.call(Request::Explore {
            package: package.clone(),
        })? {
            Reply::Explored { tests } => Ok(tests),
            other => Err(unexpected(other)),
        }
    }

    fn run(&mut self, package: &TestPackage, tests: &[String]) -> DriverResult<RunReport> {
        match self.call(Request::Run {
            package: package.clone(),
            tests: tests.to_vec(),
        })? {
            Reply::Ran { report } => Ok(report),
            other => Err(unexpected(other)),
        }
    }

    fn unload(&mut self) -> DriverResult<()> {
        match self.call(Request::Unload)? {
            Reply::Unloaded => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    fn dispose(&mut self) {
        RemoteDriverProxy::dispose(self);
    }
}

impl Drop for RemoteDriverProxy {
    fn drop(&mut self) {
        RemoteDriverProxy::dispose(self);
    }
}
