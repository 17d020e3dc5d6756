//! Ping/timeout watchdog for abandoned sessions.
//!
//! The host side of a remote session cannot tell a slow controller from a
//! dead one. A [`LivenessMonitor`] keeps a deadline that every
//! [`ping`](LivenessMonitor::ping) pushes forward by the configured timeout.
//! If the deadline passes, the monitor runs its shutdown callback so the host
//! releases its resources instead of waiting forever.
//!
//! The callback runs exactly once, whether the deadline expires or
//! [`shutdown`](LivenessMonitor::shutdown) is called directly. Pings arriving
//! after that are accepted and ignored.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::time::Duration;
//! use hostdrive::liveness::LivenessMonitor;
//!
//! let fired = Arc::new(AtomicBool::new(false));
//! let flag = fired.clone();
//! let monitor = LivenessMonitor::new(Duration::from_millis(20), move || {
//!     flag.store(true, Ordering::SeqCst);
//! });
//!
//! assert!(monitor.wait_timeout(Duration::from_secs(5)));
//! assert!(fired.load(Ordering::SeqCst));
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::diagnostics::{ErrorSink, PanicError, default_sink};

type ShutdownCallback = Box<dyn FnOnce() + Send + 'static>;

/// Stand-in deadline distance for timeouts too large to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// Returns `now + timeout`, saturating for timeouts that would overflow.
pub fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

struct WatchState {
    deadline: Instant,
    last_ping: Option<Instant>,
    shut_down: bool,
    finished: bool,
    stopped: bool,
}

struct Inner {
    timeout: Duration,
    state: Mutex<WatchState>,
    changed: Condvar,
    on_shutdown: Mutex<Option<ShutdownCallback>>,
    sink: Arc<dyn ErrorSink>,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, WatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn trigger(&self, reason: &str) -> bool {
        {
            let mut state = self.lock_state();
            if state.shut_down {
                return false;
            }
            state.shut_down = true;
        }
        self.changed.notify_all();

        info!("Liveness monitor shutting down: {}", reason);

        let callback = self
            .on_shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
                self.sink.report(
                    "Liveness shutdown callback failed",
                    &PanicError::from_payload(payload.as_ref()),
                );
            }
        }

        self.lock_state().finished = true;
        self.changed.notify_all();
        true
    }
}

/// Watchdog that triggers a shutdown when pings stop arriving.
pub struct LivenessMonitor {
    inner: Arc<Inner>,
    watcher: Option<JoinHandle<()>>,
}

impl LivenessMonitor {
    /// Starts a monitor that calls `on_shutdown` if no ping arrives within
    /// `timeout`.
    ///
    /// The timeout window starts immediately.
    pub fn new<F>(timeout: Duration, on_shutdown: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_sink(timeout, on_shutdown, default_sink())
    }

    /// Like [`new`](Self::new), reporting a panicking callback to `sink`.
    pub fn with_sink<F>(timeout: Duration, on_shutdown: F, sink: Arc<dyn ErrorSink>) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let inner = Arc::new(Inner {
            timeout,
            state: Mutex::new(WatchState {
                deadline: deadline_after(Instant::now(), timeout),
                last_ping: None,
                shut_down: false,
                finished: false,
                stopped: false,
            }),
            changed: Condvar::new(),
            on_shutdown: Mutex::new(Some(Box::new(on_shutdown))),
            sink,
        });

        let watched = inner.clone();
        let watcher = thread::Builder::new()
            .name("liveness-monitor".to_string())
            .spawn(move || watch(watched));

        let watcher = match watcher {
            Ok(handle) => Some(handle),
            Err(e) => {
                inner.sink.report("Failed to start liveness watcher", &e);
                None
            }
        };

        debug!("Liveness monitor started with timeout {:?}", timeout);
        Self { inner, watcher }
    }

    /// Records a keep-alive signal, restarting the timeout window.
    ///
    /// Has no effect once the monitor has shut down.
    pub fn ping(&self) {
        let mut state = self.inner.lock_state();
        if state.shut_down {
            return;
        }
        let now = Instant::now();
        state.last_ping = Some(now);
        state.deadline = deadline_after(now, self.inner.timeout);
        drop(state);
        self.inner.changed.notify_all();
    }

    /// Shuts down now, running the callback if it has not run yet.
    ///
    /// Returns `true` if this call performed the shutdown.
    pub fn shutdown(&self) -> bool {
        self.inner.trigger("shutdown requested")
    }

    /// Returns `true` once shutdown has started.
    pub fn is_shut_down(&self) -> bool {
        self.inner.lock_state().shut_down
    }

    /// Blocks until the shutdown callback has completed.
    pub fn wait(&self) {
        let mut state = self.inner.lock_state();
        while !state.finished {
            state = self
                .inner
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks until the shutdown callback has completed or `timeout`
    /// elapses. Returns `true` if shutdown completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let state = self.inner.lock_state();
        let (state, _) = self
            .inner
            .changed
            .wait_timeout_while(state, timeout, |s| !s.finished)
            .unwrap_or_else(PoisonError::into_inner);
        state.finished
    }

    /// The configured timeout window.
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// When the last ping was received, if any.
    pub fn last_ping(&self) -> Option<Instant> {
        self.inner.lock_state().last_ping
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        self.inner.lock_state().stopped = true;
        self.inner.changed.notify_all();

        if let Some(watcher) = self.watcher.take() {
            if watcher.thread().id() != thread::current().id() {
                let _ = watcher.join();
            }
        }
    }
}

fn watch(inner: Arc<Inner>) {
    let mut state = inner.lock_state();
    loop {
        if state.shut_down || state.stopped {
            return;
        }

        let now = Instant::now();
        if now >= state.deadline {
            drop(state);
            inner.trigger("no ping received within the timeout window");
            return;
        }

        let remaining = state.deadline - now;
        state = inner
            .changed
            .wait_timeout(state, remaining)
            .unwrap_or_else(PoisonError::into_inner)
            .0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::testing::RecordingSink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_monitor(timeout: Duration) -> (LivenessMonitor, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let monitor = LivenessMonitor::new(timeout, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (monitor, count)
    }

    #[test]
    fn test_pings_keep_session_alive() {
        let (monitor, count) = counting_monitor(Duration::from_millis(200));

        for _ in 0..3 {
            thread::sleep(Duration::from_millis(100));
            monitor.ping();
        }
        assert!(!monitor.is_shut_down());
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(monitor.last_ping().is_some());

        // Once pings stop the window closes.
        assert!(monitor.wait_timeout(Duration::from_secs(5)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_after_silence_within_window() {
        let (monitor, count) = counting_monitor(Duration::from_millis(200));
        let started = Instant::now();

        assert!(monitor.wait_timeout(Duration::from_secs(5)));
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(2));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timeout_fires_exactly_once() {
        let (monitor, count) = counting_monitor(Duration::from_millis(10));

        monitor.wait();
        assert!(!monitor.shutdown());
        assert!(!monitor.shutdown());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_explicit_shutdown_runs_callback_once() {
        let (monitor, count) = counting_monitor(Duration::from_secs(30));

        assert!(monitor.shutdown());
        assert!(!monitor.shutdown());
        assert!(monitor.is_shut_down());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ping_after_shutdown_does_not_resurrect() {
        let (monitor, count) = counting_monitor(Duration::from_millis(10));

        monitor.wait();
        monitor.ping();
        monitor.ping();

        assert!(monitor.is_shut_down());
        assert!(monitor.last_ping().is_none());
        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_huge_timeout_never_fires() {
        let (monitor, count) = counting_monitor(Duration::MAX);

        monitor.ping();
        assert!(!monitor.wait_timeout(Duration::from_millis(50)));
        assert!(!monitor.is_shut_down());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_deadline_saturates() {
        let now = Instant::now();
        assert_eq!(
            deadline_after(now, Duration::from_secs(1)),
            now + Duration::from_secs(1)
        );
        assert!(deadline_after(now, Duration::MAX) > now + Duration::from_secs(3600));
    }

    #[test]
    fn test_drop_stops_without_firing() {
        let (monitor, count) = counting_monitor(Duration::from_secs(30));
        drop(monitor);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_callback_is_reported() {
        let sink = Arc::new(RecordingSink::default());
        let monitor = LivenessMonitor::with_sink(
            Duration::from_secs(30),
            || panic!("callback exploded"),
            sink.clone(),
        );

        assert!(monitor.shutdown());
        monitor.wait();

        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].contains("callback exploded"));
    }
}
