//! Reporting of errors that cannot be propagated to a caller.
//!
//! Some failures happen where nobody is waiting for a result: a watchdog
//! callback running on its own thread, a host process that refuses to die
//! during disposal, a reader thread that loses its connection. Those are
//! handed to an [`ErrorSink`] that each component receives at construction.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use hostdrive::diagnostics::{ErrorSink, TracingErrorSink};
//!
//! let sink: Arc<dyn ErrorSink> = Arc::new(TracingErrorSink);
//! let err = std::io::Error::other("kill failed");
//! sink.report("Failed to terminate host process", &err);
//! ```

use std::any::Any;
use std::sync::Arc;

/// Destination for errors that are swallowed rather than returned.
pub trait ErrorSink: Send + Sync {
    /// Reports an error together with a short description of what failed.
    fn report(&self, message: &str, error: &(dyn std::error::Error + 'static));
}

/// Sink that logs every report at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, message: &str, error: &(dyn std::error::Error + 'static)) {
        tracing::error!("{}: {}", message, error);
    }
}

/// Returns the sink used when a component is built without one.
pub fn default_sink() -> Arc<dyn ErrorSink> {
    Arc::new(TracingErrorSink)
}

/// Error wrapping the message of a caught panic.
#[derive(Debug, thiserror::Error)]
#[error("panicked: {0}")]
pub struct PanicError(pub String);

impl PanicError {
    /// Builds an error from a panic payload, keeping `&str` and `String`
    /// messages and describing anything else generically.
    pub fn from_payload(payload: &(dyn Any + Send)) -> Self {
        Self(panic_message(payload))
    }
}

/// Extracts a printable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
