use crate::domain::{MessageProcessor, ProcessorConfig};
use crate::nats::{ListenerConfig, LoggingTransportErrorReporter, QueueListener};
use common::domain::CountingResultRepository;
use common::nats::QueueConsumer;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct ResultWorkerConfig {
    pub queue_name: String,
    pub queue_group: Option<String>,
    pub max_in_flight: usize,
    pub drain_timeout: Duration,
}

/// Runner process signature used by `into_runner_process`
pub type WorkerProcess = Box<
    dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send,
>;

/// Wires a queue listener to the counting result repository
pub struct ResultWorker {
    listener: QueueListener,
}

impl ResultWorker {
    pub fn new(
        repository: Arc<dyn CountingResultRepository>,
        consumer: Arc<dyn QueueConsumer>,
        config: ResultWorkerConfig,
    ) -> Self {
        info!(queue = %config.queue_name, "Initializing result worker");

        let processor = Arc::new(MessageProcessor::new(
            ProcessorConfig {
                queue_name: config.queue_name.clone(),
            },
            repository,
        ));
        let reporter = Arc::new(LoggingTransportErrorReporter::new(config.queue_name.clone()));

        let listener = QueueListener::new(
            consumer,
            processor,
            reporter,
            ListenerConfig {
                queue_name: config.queue_name,
                queue_group: config.queue_group,
                max_in_flight: config.max_in_flight,
                drain_timeout: config.drain_timeout,
            },
        );

        info!("Result worker initialized");
        Self { listener }
    }

    /// Listen until the token is cancelled
    pub async fn run(self, ctx: CancellationToken) -> anyhow::Result<()> {
        self.listener.run(ctx).await
    }

    pub fn into_runner_process(self) -> WorkerProcess {
        Box::new(move |ctx| Box::pin(async move { self.run(ctx).await }))
    }
}
