//! Host side of a remote driver session.
//!
//! A [`RemoteDriverService`] owns the real [`TestDriver`] inside the host
//! process. Requests arrive on IPC reader and worker threads; every driver
//! operation is marshaled onto the host's dispatch thread with
//! [`DispatchQueue::invoke`], so the driver itself never sees another thread.
//!
//! Each request counts as a keep-alive ping. If the controller goes quiet for
//! longer than the watchdog timeout, the service shuts itself down: the driver
//! is disposed on the dispatch thread and the queue is stopped, which lets the
//! host's main thread return from [`DispatchQueue::run`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{DriverError, DriverResult, FailureKind, TestDriver};
use crate::diagnostics::{ErrorSink, PanicError};
use crate::dispatch::DispatchQueue;
use crate::ipc::{self, IpcResult, Reply, Request, ServerConnection};
use crate::liveness::LivenessMonitor;

type SharedDriver = Arc<Mutex<Option<Box<dyn TestDriver>>>>;

#[derive(Default)]
struct ServiceState {
    shut_down: bool,
    waiting: bool,
}

struct ServiceInner {
    queue: DispatchQueue,
    driver: SharedDriver,
    sink: Arc<dyn ErrorSink>,
    state: Mutex<ServiceState>,
    changed: Condvar,
}

impl ServiceInner {
    fn lock_state(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs once, from the liveness monitor's callback.
    fn stop(&self) {
        let driver = self.driver.clone();
        let dispose = move || {
            let taken = driver.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(mut driver) = taken {
                driver.dispose();
            }
        };

        let disposed = panic::catch_unwind(AssertUnwindSafe(|| {
            match self.queue.invoke(dispose.clone()) {
                Ok(()) => debug!("Driver disposed on the dispatch thread"),
                Err(e) => {
                    debug!("Disposing driver inline: {}", e);
                    dispose();
                }
            }
        }));
        if let Err(payload) = disposed {
            self.sink.report(
                "Driver dispose panicked",
                &PanicError::from_payload(payload.as_ref()),
            );
        }
        self.queue.shutdown();

        self.lock_state().shut_down = true;
        self.changed.notify_all();
        info!("Remote driver service shut down");
    }
}

/// Serves driver requests inside the host process.
pub struct RemoteDriverService {
    inner: Arc<ServiceInner>,
    monitor: LivenessMonitor,
}

impl RemoteDriverService {
    /// Creates a service around `driver`, executing its operations on
    /// `queue`'s dispatch thread.
    ///
    /// The watchdog starts immediately: a first request must arrive within
    /// `watchdog_timeout`.
    pub fn new(
        queue: DispatchQueue,
        driver: Box<dyn TestDriver>,
        watchdog_timeout: Duration,
        sink: Arc<dyn ErrorSink>,
    ) -> Self {
        let inner = Arc::new(ServiceInner {
            queue,
            driver: Arc::new(Mutex::new(Some(driver))),
            sink: sink.clone(),
            state: Mutex::new(ServiceState::default()),
            changed: Condvar::new(),
        });

        let weak: Weak<ServiceInner> = Arc::downgrade(&inner);
        let monitor = LivenessMonitor::with_sink(
            watchdog_timeout,
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.stop();
                }
            },
            sink,
        );

        Self { inner, monitor }
    }

    /// Handles one request and produces its reply.
    pub fn handle(&self, request: Request) -> Reply {
        self.monitor.ping();
        debug!("Handling {} request", request.name());

        match request {
            Request::Ping => Reply::Pong,
            Request::Shutdown => {
                self.shutdown();
                Reply::ShuttingDown
            }
            Request::Initialize { options } => self.dispatch(move |driver| {
                driver
                    .initialize(&options)
                    .map(|()| Reply::Initialized)
            }),
            Request::Explore { package } => self.dispatch(move |driver| {
                driver
                    .explore(&package)
                    .map(|tests| Reply::Explored { tests })
            }),
            Request::Run { package, tests } => self.dispatch(move |driver| {
                driver
                    .run(&package, &tests)
                    .map(|report| Reply::Ran { report })
            }),
            Request::Unload => self.dispatch(|driver| driver.unload().map(|()| Reply::Unloaded)),
        }
    }

    fn dispatch<F>(&self, op: F) -> Reply
    where
        F: FnOnce(&mut dyn TestDriver) -> DriverResult<Reply> + Send + 'static,
    {
        let driver = self.inner.driver.clone();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.inner.queue.invoke(move || {
                let mut guard = driver.lock().unwrap_or_else(PoisonError::into_inner);
                match guard.as_mut() {
                    Some(driver) => op(driver.as_mut()),
                    None => Err(DriverError::InvalidOperation(
                        "The driver has been disposed".to_string(),
                    )),
                }
            })
        }));

        match outcome {
            Ok(Ok(Ok(reply))) => reply,
            Ok(Ok(Err(e))) => failed(&e),
            Ok(Err(e)) => failed(&DriverError::from(e)),
            Err(payload) => {
                let err = PanicError::from_payload(payload.as_ref());
                self.inner.sink.report("Driver operation panicked", &err);
                Reply::Failed {
                    kind: FailureKind::Panicked,
                    message: err.0,
                }
            }
        }
    }

    /// Records a keep-alive signal.
    pub fn ping(&self) {
        self.monitor.ping();
    }

    /// Disposes the driver and stops the dispatch queue.
    ///
    /// Returns `true` if this call performed the shutdown.
    pub fn shutdown(&self) -> bool {
        self.monitor.shutdown()
    }

    /// Returns `true` once shutdown has completed: the driver is disposed and
    /// the queue stopped.
    pub fn is_shut_down(&self) -> bool {
        self.inner.lock_state().shut_down
    }

    /// Blocks until the service has shut down.
    ///
    /// Only one thread may wait at a time; a concurrent second waiter fails
    /// with [`DriverError::InvalidOperation`].
    pub fn wait_for_shutdown(&self) -> DriverResult<()> {
        let mut state = self.inner.lock_state();
        if state.waiting {
            return Err(DriverError::InvalidOperation(
                "Another thread is already waiting for shutdown".to_string(),
            ));
        }

        state.waiting = true;
        while !state.shut_down {
            state = self
                .inner
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.waiting = false;
        Ok(())
    }

    /// Answers requests from `conn` until the controller hangs up or asks
    /// for shutdown.
    ///
    /// `Ping` and `Shutdown` are answered on this thread; driver operations
    /// run on worker threads so pings keep flowing while a long test run
    /// occupies the dispatch thread. A lost connection does not shut the
    /// service down; the watchdog does that once pings stop.
    pub fn serve(self: &Arc<Self>, mut conn: ServerConnection) {
        let replies = conn.replies();

        loop {
            let envelope = match conn.next_request() {
                Ok(Some(envelope)) => envelope,
                Ok(None) => {
                    debug!("Controller closed the connection");
                    break;
                }
                Err(e) => {
                    self.inner.sink.report("Failed to read request", &e);
                    break;
                }
            };

            let seq = envelope.seq;
            match envelope.body {
                request @ (Request::Ping | Request::Shutdown) => {
                    let stop = matches!(request, Request::Shutdown);
                    let reply = self.handle(request);
                    if let Err(e) = replies.send(seq, reply) {
                        self.inner.sink.report("Failed to send reply", &e);
                    }
                    if stop {
                        break;
                    }
                }
                request => {
                    let service = self.clone();
                    let worker_replies = replies.clone();
                    let spawned = thread::Builder::new()
                        .name("driver-request".to_string())
                        .spawn(move || {
                            let reply = service.handle(request);
                            if let Err(e) = worker_replies.send(seq, reply) {
                                service.inner.sink.report("Failed to send reply", &e);
                            }
                        });

                    if let Err(e) = spawned {
                        self.inner.sink.report("Failed to start request worker", &e);
                        let reply = Reply::Failed {
                            kind: FailureKind::Failed,
                            message: e.to_string(),
                        };
                        if let Err(e) = replies.send(seq, reply) {
                            self.inner.sink.report("Failed to send reply", &e);
                        }
                    }
                }
            }
        }
    }
}

fn failed(error: &DriverError) -> Reply {
    warn!("Driver operation failed: {}", error);
    Reply::Failed {
        kind: error.failure_kind(),
        message: error.to_string(),
    }
}

/// Connects back to the controller and serves a session on a background
/// thread.
///
/// The returned handle finishes once the controller hangs up or the session
/// is shut down by request.
pub fn serve_remote_session(
    queue: DispatchQueue,
    driver: Box<dyn TestDriver>,
    port_name: &str,
    correlation_id: &str,
    watchdog_timeout: Duration,
    sink: Arc<dyn ErrorSink>,
) -> IpcResult<(Arc<RemoteDriverService>, JoinHandle<()>)> {
    let conn = ipc::connect(port_name, correlation_id)?;
    let service = Arc::new(RemoteDriverService::new(
        queue,
        driver,
        watchdog_timeout,
        sink,
    ));

    let served = service.clone();
    let session = thread::Builder::new()
        .name("driver-session".to_string())
        .spawn(move || served.serve(conn))?;

    info!("Serving remote driver session {}", correlation_id);
    Ok((service, session))
}
