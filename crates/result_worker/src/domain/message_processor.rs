use crate::domain::decode_counting_result;
use common::domain::CountingResultRepository;
use common::nats::QueueMessage;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, instrument};

/// How handling of a single message concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Persisted,
    DecodeFailed,
    StoreFailed,
}

impl ProcessingOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Persisted => "persisted",
            Self::DecodeFailed => "decode_failed",
            Self::StoreFailed => "store_failed",
        }
    }
}

impl fmt::Display for ProcessingOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Queue the processor is attached to, used as log context
    pub queue_name: String,
}

/// Decodes one queue message and hands the result to the repository.
///
/// Every failure ends in a `ProcessingOutcome`; nothing propagates to the
/// caller. The message is already gone from the queue when it gets here, so
/// failures are logged and the message is dropped.
pub struct MessageProcessor {
    config: ProcessorConfig,
    repository: Arc<dyn CountingResultRepository>,
}

impl MessageProcessor {
    pub fn new(config: ProcessorConfig, repository: Arc<dyn CountingResultRepository>) -> Self {
        Self { config, repository }
    }

    pub fn queue_name(&self) -> &str {
        &self.config.queue_name
    }

    #[instrument(
        name = "process_counting_result",
        skip_all,
        fields(queue = %self.config.queue_name, message_id = %message.message_id)
    )]
    pub async fn process(&self, message: QueueMessage) -> ProcessingOutcome {
        info!(
            queue = %self.config.queue_name,
            payload = %message.payload_lossy(),
            "received counting result message"
        );

        let result = match decode_counting_result(&message.payload) {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "invalid counting result payload, dropping message");
                return ProcessingOutcome::DecodeFailed;
            }
        };

        match self.repository.save(&result).await {
            Ok(()) => {
                info!(
                    counter_id = %result.id,
                    count = result.count,
                    "counting result persisted"
                );
                ProcessingOutcome::Persisted
            }
            Err(e) => {
                error!(
                    counter_id = %result.id,
                    error = %e,
                    "failed to persist counting result, dropping message"
                );
                ProcessingOutcome::StoreFailed
            }
        }
    }
}
