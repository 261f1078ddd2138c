use common::nats::TransportError;
use tracing::error;

/// Receives connection level faults raised while a listener is running.
/// Observational only: reconnecting is the transport client's job.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait TransportErrorReporter: Send + Sync {
    fn report(&self, error: &TransportError);
}

/// Writes each transport fault to the log at error level
#[derive(Debug, Clone)]
pub struct LoggingTransportErrorReporter {
    queue_name: String,
}

impl LoggingTransportErrorReporter {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
        }
    }
}

impl TransportErrorReporter for LoggingTransportErrorReporter {
    fn report(&self, transport_error: &TransportError) {
        error!(
            queue = %self.queue_name,
            category = %transport_error.kind,
            error = %transport_error.message,
            "transport failure"
        );
    }
}
