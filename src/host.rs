//! The agent that runs inside the host process.
//!
//! `hostdrive host` turns its main thread into the dispatch thread and waits
//! for commands on a Unix datagram inbox at `<inbox_dir>/hostdrive-<pid>.inbox`:
//!
//! | Command | Effect |
//! |---------|--------|
//! | `NETLOAD <path>` | Records the module as loaded |
//! | `CREATEENDPOINTANDWAIT <port> <id> <ms>` | Connects back and serves a driver session |
//!
//! Commands execute on the dispatch thread, like every driver operation of the
//! session. If no session is requested within the startup timeout, the agent
//! gives up. It returns once the session has shut down.

use std::path::PathBuf;
use std::time::Duration;

/// How long the agent waits for a session before exiting.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(120);

/// Options for [`run_host`].
#[derive(Debug, Clone)]
pub struct HostAgentOptions {
    /// Directory holding the command inbox.
    pub inbox_dir: PathBuf,
    pub startup_timeout: Duration,
}

impl Default for HostAgentOptions {
    fn default() -> Self {
        Self {
            inbox_dir: std::env::temp_dir(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }
}

#[cfg(unix)]
pub use agent::run_host;

#[cfg(not(unix))]
pub fn run_host(_options: HostAgentOptions) -> anyhow::Result<()> {
    anyhow::bail!("The host agent requires Unix domain sockets")
}

#[cfg(unix)]
mod agent {
    use std::fs;
    use std::io::ErrorKind;
    use std::os::unix::net::UnixDatagram;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};

    use anyhow::{Context, Result, bail};
    use tracing::{debug, info, warn};

    use super::HostAgentOptions;
    use crate::diagnostics::{ErrorSink, default_sink};
    use crate::dispatch::DispatchQueue;
    use crate::driver::generic::GenericDriver;
    use crate::driver::service::{RemoteDriverService, serve_remote_session};
    use crate::liveness::LivenessMonitor;
    use crate::process::command::{self, CREATE_ENDPOINT_AND_WAIT, HostCommand, NET_LOAD};

    const INBOX_POLL: Duration = Duration::from_millis(200);
    const SESSION_DRAIN: Duration = Duration::from_secs(2);
    const MAX_DATAGRAM: usize = 64 * 1024;

    struct Session {
        service: Arc<RemoteDriverService>,
        thread: JoinHandle<()>,
    }

    struct HostAgent {
        queue: DispatchQueue,
        sink: Arc<dyn ErrorSink>,
        startup: Mutex<Option<LivenessMonitor>>,
        session: Mutex<Option<Session>>,
        modules: Mutex<Vec<PathBuf>>,
        stopped: AtomicBool,
    }

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    impl HostAgent {
        /// Receives commands until the agent stops.
        fn listen(self: Arc<Self>, socket: UnixDatagram) {
            let mut buf = vec![0u8; MAX_DATAGRAM];

            while !self.stopped.load(Ordering::SeqCst) && !self.queue.is_shut_down() {
                let len = match socket.recv(&mut buf) {
                    Ok(len) => len,
                    Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                        continue;
                    }
                    Err(e) => {
                        self.sink.report("Command inbox failed", &e);
                        return;
                    }
                };

                let text = String::from_utf8_lossy(&buf[..len]);
                let command = match HostCommand::parse(&text) {
                    Ok(command) => command,
                    Err(e) => {
                        self.sink.report("Ignoring command", &e);
                        continue;
                    }
                };
                debug!("Received command: {}", command);

                let agent = self.clone();
                match self.queue.invoke(move || agent.execute(&command)) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Command failed: {:#}", e),
                    Err(e) => {
                        debug!("Command not executed: {}", e);
                        return;
                    }
                }
            }
        }

        /// Runs on the dispatch thread.
        fn execute(&self, command: &HostCommand) -> Result<()> {
            match command.global_name.as_str() {
                NET_LOAD => {
                    let [path] = command.arguments.as_slice() else {
                        bail!("{} expects one argument", NET_LOAD);
                    };
                    let path = PathBuf::from(path);
                    let mut modules = lock(&self.modules);
                    if !modules.contains(&path) {
                        info!("Loaded module {}", path.display());
                        modules.push(path);
                    }
                    Ok(())
                }
                CREATE_ENDPOINT_AND_WAIT => {
                    let [port, id, millis] = command.arguments.as_slice() else {
                        bail!("{} expects three arguments", CREATE_ENDPOINT_AND_WAIT);
                    };
                    let watchdog: u64 = millis
                        .parse()
                        .with_context(|| format!("Invalid watchdog timeout '{}'", millis))?;

                    let mut session = lock(&self.session);
                    if session.is_some() {
                        bail!("A session is already being served");
                    }

                    let (service, thread) = serve_remote_session(
                        self.queue.clone(),
                        Box::new(GenericDriver::new()),
                        port,
                        id,
                        Duration::from_millis(watchdog),
                        self.sink.clone(),
                    )
                    .with_context(|| format!("Failed to connect to controller at {}", port))?;
                    *session = Some(Session { service, thread });

                    // The session's own watchdog takes over.
                    lock(&self.startup).take();
                    Ok(())
                }
                other => bail!("Unknown command '{}'", other),
            }
        }

        /// Gives the session thread a moment to send its last reply.
        fn drain_session(&self) {
            let Some(session) = lock(&self.session).take() else {
                return;
            };
            if !session.service.is_shut_down() {
                session.service.shutdown();
            }

            let deadline = Instant::now() + SESSION_DRAIN;
            while !session.thread.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if session.thread.is_finished() {
                let _ = session.thread.join();
            } else {
                debug!("Session thread still busy, leaving it behind");
            }
        }
    }

    /// Runs the host agent on the calling thread until its session ends.
    pub fn run_host(options: HostAgentOptions) -> Result<()> {
        let inbox = command::inbox_path(&options.inbox_dir, std::process::id());
        if inbox.exists() {
            fs::remove_file(&inbox)
                .with_context(|| format!("Failed to remove stale inbox {}", inbox.display()))?;
        }

        let socket = UnixDatagram::bind(&inbox)
            .with_context(|| format!("Failed to bind command inbox {}", inbox.display()))?;
        socket.set_read_timeout(Some(INBOX_POLL))?;
        info!("Host agent listening on {}", inbox.display());

        let queue = DispatchQueue::new();
        let sink = default_sink();

        let startup_queue = queue.clone();
        let startup = LivenessMonitor::with_sink(
            options.startup_timeout,
            move || {
                warn!("No session requested, host agent exiting");
                startup_queue.shutdown();
            },
            sink.clone(),
        );

        let agent = Arc::new(HostAgent {
            queue: queue.clone(),
            sink,
            startup: Mutex::new(Some(startup)),
            session: Mutex::new(None),
            modules: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        });

        let listener = agent.clone();
        let inbox_thread = thread::Builder::new()
            .name("host-inbox".to_string())
            .spawn(move || listener.listen(socket))
            .context("Failed to start inbox thread")?;

        let result = queue.run();

        agent.stopped.store(true, Ordering::SeqCst);
        lock(&agent.startup).take();
        let _ = inbox_thread.join();
        agent.drain_session();

        if let Err(e) = fs::remove_file(&inbox) {
            debug!("Failed to remove inbox {}: {}", inbox.display(), e);
        }
        info!("Host agent stopped");

        result.context("Dispatch loop failed")
    }

}
