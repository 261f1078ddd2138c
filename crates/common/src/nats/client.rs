use crate::nats::traits::{QueueConsumer, QueueSubscription};
use crate::nats::{QueueMessage, TransportError, TransportErrorKind};
use anyhow::{Context, Result};
use async_nats::header::NATS_MESSAGE_ID;
use async_nats::Event;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument};

/// Capacity of the transport fault channel; slow receivers see `Lagged`
const TRANSPORT_ERROR_CAPACITY: usize = 64;

pub struct NatsClient {
    client: async_nats::Client,
    transport_errors: broadcast::Sender<TransportError>,
}

impl NatsClient {
    pub async fn connect(url: &str, timeout: std::time::Duration) -> Result<Self> {
        info!(url = %url, timeout_ms = timeout.as_millis(), "Connecting to NATS");

        let (transport_errors, _) = broadcast::channel(TRANSPORT_ERROR_CAPACITY);
        let events = transport_errors.clone();

        // Reconnects are handled by async-nats; we only surface what happened
        let client = async_nats::ConnectOptions::new()
            .connection_timeout(timeout)
            .event_callback(move |event| {
                let events = events.clone();
                async move {
                    match transport_error_from_event(&event) {
                        Some(transport_error) => {
                            // No receiver means no listener is running yet
                            let _ = events.send(transport_error);
                        }
                        None => info!(event = %event, "NATS connection event"),
                    }
                }
            })
            .connect(url)
            .await
            .context("Failed to connect to NATS")?;

        info!("Successfully connected to NATS");
        Ok(Self {
            client,
            transport_errors,
        })
    }

    /// Create a QueueConsumer trait object from this client
    pub fn create_queue_consumer(&self) -> Arc<dyn QueueConsumer> {
        Arc::new(NatsQueueConsumer::new(
            self.client.clone(),
            self.transport_errors.clone(),
        ))
    }

    pub async fn close(&self) {
        info!("Closing NATS connection");
        if let Err(e) = self.client.flush().await {
            error!(error = %e, "Failed to flush NATS connection");
        }
        // Connection closes when the last client handle is dropped
    }
}

/// Map a connection event to a transport fault. `Connected` is not a fault.
pub fn transport_error_from_event(event: &Event) -> Option<TransportError> {
    #[allow(unreachable_patterns)]
    let kind = match event {
        Event::Connected => return None,
        Event::Disconnected => TransportErrorKind::Disconnected,
        Event::SlowConsumer(_) => TransportErrorKind::SlowConsumer,
        Event::ServerError(_) => TransportErrorKind::Server,
        Event::ClientError(_) => TransportErrorKind::Client,
        Event::LameDuckMode => TransportErrorKind::LameDuck,
        _ => TransportErrorKind::Other,
    };

    Some(TransportError::new(kind, event.to_string()))
}

/// Convert a core NATS message into a QueueMessage
fn queue_message_from_nats(message: async_nats::Message) -> QueueMessage {
    let message_id = message
        .headers
        .as_ref()
        .and_then(|headers| headers.get(NATS_MESSAGE_ID))
        .map(|value| value.as_str().to_string())
        .unwrap_or_else(|| xid::new().to_string());

    QueueMessage::new(message.subject.to_string(), message_id, message.payload)
}

/// Concrete implementation of QueueConsumer using core NATS subscriptions.
///
/// Core NATS delivers each message at most once and keeps no copy, which is
/// the receive-and-delete contract the worker is built around.
pub struct NatsQueueConsumer {
    client: async_nats::Client,
    transport_errors: broadcast::Sender<TransportError>,
}

impl NatsQueueConsumer {
    pub fn new(
        client: async_nats::Client,
        transport_errors: broadcast::Sender<TransportError>,
    ) -> Self {
        Self {
            client,
            transport_errors,
        }
    }
}

#[async_trait]
impl QueueConsumer for NatsQueueConsumer {
    #[instrument(skip(self), fields(queue = %queue_name))]
    async fn subscribe(
        &self,
        queue_name: &str,
        queue_group: Option<String>,
    ) -> Result<Box<dyn QueueSubscription>> {
        let subscriber = match queue_group {
            Some(group) => {
                debug!(queue_group = %group, "subscribing within queue group");
                self.client
                    .queue_subscribe(queue_name.to_string(), group)
                    .await
            }
            None => self.client.subscribe(queue_name.to_string()).await,
        }
        .context("Failed to subscribe to queue")?;

        Ok(Box::new(NatsQueueSubscription { subscriber }))
    }

    fn transport_errors(&self) -> broadcast::Receiver<TransportError> {
        self.transport_errors.subscribe()
    }
}

/// Concrete implementation of QueueSubscription over an async-nats Subscriber
pub struct NatsQueueSubscription {
    subscriber: async_nats::Subscriber,
}

#[async_trait]
impl QueueSubscription for NatsQueueSubscription {
    async fn next_message(&mut self) -> Option<QueueMessage> {
        self.subscriber.next().await.map(queue_message_from_nats)
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.subscriber
            .unsubscribe()
            .await
            .context("Failed to unsubscribe from queue")?;
        Ok(())
    }
}
