//! Optional caller-supplied log callback.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

type Callback = Arc<dyn Fn(&str) + Send + Sync>;

/// A message sink for allow-list bypasses and reported policy violations.
///
/// The default sink does nothing. A sink that panics never breaks the
/// request path: the panic is caught and the message dropped.
#[derive(Clone, Default)]
pub struct LogSink(Option<Callback>);

impl LogSink {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self(Some(Arc::new(callback)))
    }

    /// The no-op sink.
    pub fn none() -> Self {
        Self(None)
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    pub fn log(&self, message: &str) {
        let Some(callback) = &self.0 else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| callback(message))).is_err() {
            tracing::warn!("log sink panicked, message dropped");
        }
    }
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LogSink")
            .field(&if self.is_set() { "set" } else { "none" })
            .finish()
    }
}
