//! Single-thread affinity executor.
//!
//! A [`DispatchQueue`] guarantees that work runs on one designated thread,
//! the host application's main thread, no matter which thread asks for it.
//! The thread that calls [`run`](DispatchQueue::run) becomes the dispatch
//! thread and executes submitted work items one at a time, in the order they
//! were submitted, until [`shutdown`](DispatchQueue::shutdown) is called.
//!
//! ```text
//!  submitter A ──┐
//!  submitter B ──┼──► [ WorkItem | WorkItem | ... ] ──► dispatch thread (run)
//!  submitter C ──┘          FIFO channel                     │
//!        ▲                                                   │
//!        └──────────── per-item completion (oneshot) ◄───────┘
//! ```
//!
//! # Behavior
//!
//! | Situation | Result |
//! |-----------|--------|
//! | `invoke` from the dispatch thread | Runs inline, never queued |
//! | `invoke` before `run` | [`DispatchError::NotRunning`] |
//! | `invoke` after `shutdown` | [`DispatchError::Cancelled`] |
//! | Item still queued at `shutdown` | Dropped, waiter gets [`DispatchError::Cancelled`] |
//! | Callable panics | Panic resumes on the calling thread with the same payload |
//! | Second `run` | [`DispatchError::AlreadyRunning`] |
//!
//! The queue is meant for plain OS threads. `invoke` and `run` block, so they
//! must not be called from inside an async runtime.
//!
//! # Example
//!
//! ```
//! use std::thread;
//! use hostdrive::dispatch::DispatchQueue;
//!
//! let queue = DispatchQueue::new();
//! let dispatcher = queue.clone();
//! let host = thread::spawn(move || dispatcher.run());
//!
//! while !queue.is_running() {
//!     thread::yield_now();
//! }
//!
//! let sum = queue.invoke_with((2, 3), |(a, b)| a + b).unwrap();
//! assert_eq!(sum, 5);
//!
//! queue.shutdown();
//! host.join().unwrap().unwrap();
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors raised by the dispatch queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Work was submitted before any thread called [`DispatchQueue::run`].
    #[error("The dispatch queue is not running")]
    NotRunning,

    /// [`DispatchQueue::run`] was called a second time.
    #[error("The dispatch queue has already been run")]
    AlreadyRunning,

    /// The queue shut down before the work item could complete.
    ///
    /// This is distinct from a failure of the work itself: the callable
    /// either never started or the queue refused it.
    #[error("The dispatch queue was shut down before the work item completed")]
    Cancelled,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// One queued unit of work.
///
/// The job owns the sender half of its completion channel, so dropping an
/// unexecuted item wakes its waiter with [`DispatchError::Cancelled`].
struct WorkItem {
    job: Job,
}

impl WorkItem {
    fn execute(self) {
        (self.job)()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Idle,
    Running,
    ShutDown,
}

struct Shared {
    state: QueueState,
    dispatch_thread: Option<ThreadId>,
    sender: Option<mpsc::UnboundedSender<WorkItem>>,
    receiver: Option<mpsc::UnboundedReceiver<WorkItem>>,
}

/// Executes work items serially on a single dispatch thread.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct DispatchQueue {
    shared: Arc<Mutex<Shared>>,
}

impl DispatchQueue {
    /// Creates a queue that is not yet running.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Mutex::new(Shared {
                state: QueueState::Idle,
                dispatch_thread: None,
                sender: Some(sender),
                receiver: Some(receiver),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Turns the calling thread into the dispatch thread.
    ///
    /// Blocks, executing work items as they arrive, until
    /// [`shutdown`](Self::shutdown) is called. Items still queued at that
    /// point are discarded and their submitters receive
    /// [`DispatchError::Cancelled`].
    ///
    /// # Errors
    ///
    /// [`DispatchError::AlreadyRunning`] if `run` has been called before.
    pub fn run(&self) -> DispatchResult<()> {
        let mut receiver = {
            let mut shared = self.lock();
            let receiver = shared
                .receiver
                .take()
                .ok_or(DispatchError::AlreadyRunning)?;

            if shared.state == QueueState::ShutDown {
                debug!("Dispatch queue was shut down before it started running");
                return Ok(());
            }

            shared.state = QueueState::Running;
            shared.dispatch_thread = Some(thread::current().id());
            receiver
        };

        debug!("Dispatch queue running on {:?}", thread::current().id());

        while let Some(item) = receiver.blocking_recv() {
            if self.is_shut_down() {
                drop(item);
                break;
            }
            item.execute();
        }

        receiver.close();
        let mut discarded = 0usize;
        while let Ok(item) = receiver.try_recv() {
            drop(item);
            discarded += 1;
        }

        {
            let mut shared = self.lock();
            shared.state = QueueState::ShutDown;
            shared.dispatch_thread = None;
        }

        debug!(
            "Dispatch queue stopped ({} pending work item(s) cancelled)",
            discarded
        );
        Ok(())
    }

    /// Runs `f` on the dispatch thread and returns its value.
    ///
    /// Blocks the caller until the callable has run. When called from the
    /// dispatch thread itself the callable runs inline.
    ///
    /// If the callable panics, the panic is resumed on the calling thread
    /// with the original payload.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::NotRunning`] before [`run`](Self::run) was called
    /// - [`DispatchError::Cancelled`] when the queue shuts down first
    pub fn invoke<F, T>(&self, f: F) -> DispatchResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel::<thread::Result<T>>();

        {
            let shared = self.lock();

            if shared.dispatch_thread == Some(thread::current().id()) {
                drop(shared);
                return Ok(f());
            }

            match shared.state {
                QueueState::Idle => return Err(DispatchError::NotRunning),
                QueueState::ShutDown => return Err(DispatchError::Cancelled),
                QueueState::Running => {}
            }

            let sender = shared.sender.as_ref().ok_or(DispatchError::Cancelled)?;
            let item = WorkItem {
                job: Box::new(move || {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(f));
                    let _ = done_tx.send(outcome);
                }),
            };
            sender.send(item).map_err(|_| DispatchError::Cancelled)?;
        }

        match done_rx.blocking_recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(_) => Err(DispatchError::Cancelled),
        }
    }

    /// Runs `f(args)` on the dispatch thread.
    ///
    /// `args` is moved to the dispatch thread unchanged; pass a tuple for
    /// several arguments. Semantics are otherwise those of
    /// [`invoke`](Self::invoke).
    pub fn invoke_with<A, F, T>(&self, args: A, f: F) -> DispatchResult<T>
    where
        A: Send + 'static,
        F: FnOnce(A) -> T + Send + 'static,
        T: Send + 'static,
    {
        self.invoke(move || f(args))
    }

    /// Stops the queue.
    ///
    /// The item currently executing, if any, finishes normally. Everything
    /// still queued is cancelled and [`run`](Self::run) returns. Calling
    /// this more than once has no further effect.
    pub fn shutdown(&self) {
        let mut shared = self.lock();
        if shared.state == QueueState::ShutDown {
            return;
        }
        debug!("Dispatch queue shutting down");
        shared.state = QueueState::ShutDown;
        // Dropping the only sender wakes an idle run loop.
        shared.sender = None;
    }

    /// Returns `true` while a thread is inside [`run`](Self::run) and the
    /// queue has not been shut down.
    pub fn is_running(&self) -> bool {
        self.lock().state == QueueState::Running
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.lock().state == QueueState::ShutDown
    }

    /// Returns `true` if the calling thread is the dispatch thread.
    pub fn is_dispatch_thread(&self) -> bool {
        self.lock().dispatch_thread == Some(thread::current().id())
    }
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}
