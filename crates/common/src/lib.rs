pub mod domain;
pub mod nats;
pub mod postgres;
pub mod telemetry;

// Re-export mocks when testing feature is enabled
#[cfg(any(test, feature = "testing"))]
pub use domain::MockCountingResultRepository;
#[cfg(any(test, feature = "testing"))]
pub use nats::MockQueueConsumer;
#[cfg(any(test, feature = "testing"))]
pub use nats::MockQueueSubscription;
