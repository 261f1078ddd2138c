use crate::nats::{QueueMessage, TransportError};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Trait for queue consumer operations
/// Abstracts subscribing to a queue and observing connection level faults
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Subscribe to a queue, optionally sharing deliveries within a queue group
    async fn subscribe(
        &self,
        queue_name: &str,
        queue_group: Option<String>,
    ) -> Result<Box<dyn QueueSubscription>>;

    /// Receiver for transport faults raised after this call
    fn transport_errors(&self) -> broadcast::Receiver<TransportError>;
}

/// Trait for an active subscription
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait QueueSubscription: Send {
    /// Wait for the next message. Returns None once the transport has closed
    /// the subscription. Must be cancel safe: dropping the future loses no message.
    async fn next_message(&mut self) -> Option<QueueMessage>;

    /// Release the subscription; no message is delivered afterwards
    async fn unsubscribe(&mut self) -> Result<()>;
}
