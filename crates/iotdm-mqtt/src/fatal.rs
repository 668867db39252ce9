//! Process-fatal error policy.
//!
//! Resource exhaustion means the host can no longer serve any connection, so
//! it is escalated from the connection task to this single policy hook
//! instead of being handled per connection.

use crate::error::TransportError;
use parking_lot::Mutex;
use tracing::error;

pub trait FatalErrorPolicy: Send + Sync {
    fn on_fatal(&self, error: &TransportError);
}

/// Logs the error and exits the process with status 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExitPolicy;

impl FatalErrorPolicy for ProcessExitPolicy {
    fn on_fatal(&self, err: &TransportError) {
        error!(error = %err, "Unrecoverable resource exhaustion, shutting down the process");
        std::process::exit(1);
    }
}

/// Records fatal errors instead of exiting; for embedding and tests.
#[derive(Debug, Default)]
pub struct RecordingPolicy {
    errors: Mutex<Vec<String>>,
}

impl RecordingPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn recorded(&self) -> Vec<String> {
        self.errors.lock().clone()
    }
}

impl FatalErrorPolicy for RecordingPolicy {
    fn on_fatal(&self, err: &TransportError) {
        error!(error = %err, "Fatal transport error");
        self.errors.lock().push(err.to_string());
    }
}
