use crate::domain::{MessageProcessor, ProcessingOutcome};
use crate::nats::TransportErrorReporter;
use common::nats::{QueueConsumer, QueueSubscription, TransportError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of a QueueListener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Starting,
    Listening,
    Stopping,
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("cannot {operation} listener while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ListenerState,
    },

    #[error("failed to subscribe to queue {queue}: {source}")]
    Subscribe {
        queue: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("subscription to queue {queue} was closed by the transport")]
    SubscriptionClosed { queue: String },
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub queue_name: String,
    /// Queue group shared by worker replicas; None subscribes alone
    pub queue_group: Option<String>,
    /// Upper bound on messages processed at the same time
    pub max_in_flight: usize,
    /// How long `stop` waits for in-flight messages before abandoning them
    pub drain_timeout: Duration,
}

struct ActiveSubscription {
    cancel: CancellationToken,
    /// Cancelled by the dispatch task when the transport ends the subscription
    closed: CancellationToken,
    dispatch: JoinHandle<()>,
    faults: JoinHandle<()>,
}

/// Owns the queue subscription and feeds every delivered message to the
/// MessageProcessor.
///
/// The transport removes a message from the queue as soon as it is
/// delivered, so nothing here acknowledges or redelivers. Transport faults
/// go to the TransportErrorReporter and never stop the listener.
pub struct QueueListener {
    consumer: Arc<dyn QueueConsumer>,
    processor: Arc<MessageProcessor>,
    reporter: Arc<dyn TransportErrorReporter>,
    config: ListenerConfig,
    state: ListenerState,
    active: Option<ActiveSubscription>,
}

impl QueueListener {
    pub fn new(
        consumer: Arc<dyn QueueConsumer>,
        processor: Arc<MessageProcessor>,
        reporter: Arc<dyn TransportErrorReporter>,
        config: ListenerConfig,
    ) -> Self {
        Self {
            consumer,
            processor,
            reporter,
            config,
            state: ListenerState::Stopped,
            active: None,
        }
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    /// Subscribe and begin dispatching. Returns once the subscription is in
    /// place; messages are handled on background tasks.
    pub async fn start(&mut self) -> Result<(), ListenerError> {
        if self.state != ListenerState::Stopped {
            return Err(ListenerError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }

        self.state = ListenerState::Starting;
        info!(
            queue = %self.config.queue_name,
            queue_group = ?self.config.queue_group,
            "starting counting result listener"
        );

        // Take the fault receiver first so faults raised while subscribing are seen
        let faults = self.consumer.transport_errors();

        let subscription = match self
            .consumer
            .subscribe(&self.config.queue_name, self.config.queue_group.clone())
            .await
        {
            Ok(subscription) => subscription,
            Err(source) => {
                self.state = ListenerState::Stopped;
                return Err(ListenerError::Subscribe {
                    queue: self.config.queue_name.clone(),
                    source,
                });
            }
        };

        let cancel = CancellationToken::new();
        let closed = CancellationToken::new();

        let dispatch = tokio::spawn(dispatch_messages(
            subscription,
            Arc::clone(&self.processor),
            Arc::new(Semaphore::new(self.config.max_in_flight.max(1))),
            self.config.drain_timeout,
            cancel.clone(),
            closed.clone(),
        ));

        let faults = tokio::spawn(report_transport_errors(
            faults,
            Arc::clone(&self.reporter),
            cancel.clone(),
        ));

        self.active = Some(ActiveSubscription {
            cancel,
            closed,
            dispatch,
            faults,
        });
        self.state = ListenerState::Listening;

        info!(queue = %self.config.queue_name, "waiting for messages");
        Ok(())
    }

    /// Stop accepting deliveries, release the subscription and wait up to the
    /// drain timeout for in-flight messages. No processing runs after this
    /// returns. Stopping a stopped listener does nothing.
    pub async fn stop(&mut self) -> Result<(), ListenerError> {
        match self.state {
            ListenerState::Stopped => return Ok(()),
            ListenerState::Listening => {}
            state => {
                return Err(ListenerError::InvalidState {
                    operation: "stop",
                    state,
                })
            }
        }

        self.state = ListenerState::Stopping;
        debug!(queue = %self.config.queue_name, "stopping counting result listener");

        if let Some(active) = self.active.take() {
            active.cancel.cancel();

            if let Err(e) = active.dispatch.await {
                error!(error = %e, "message dispatch task failed");
            }
            if let Err(e) = active.faults.await {
                error!(error = %e, "transport error task failed");
            }
        }

        self.state = ListenerState::Stopped;
        info!(queue = %self.config.queue_name, "queue subscription closed");
        Ok(())
    }

    /// Listen until the token is cancelled, then stop. Fails if the
    /// transport ends the subscription first.
    pub async fn run(mut self, ctx: CancellationToken) -> anyhow::Result<()> {
        self.start().await?;

        let closed = self
            .active
            .as_ref()
            .map(|active| active.closed.clone())
            .unwrap_or_default();

        tokio::select! {
            _ = ctx.cancelled() => {
                self.stop().await?;
                Ok(())
            }
            _ = closed.cancelled() => {
                self.stop().await?;
                Err(ListenerError::SubscriptionClosed {
                    queue: self.config.queue_name.clone(),
                }
                .into())
            }
        }
    }
}

impl Drop for QueueListener {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
        }
    }
}

async fn dispatch_messages(
    mut subscription: Box<dyn QueueSubscription>,
    processor: Arc<MessageProcessor>,
    permits: Arc<Semaphore>,
    drain_timeout: Duration,
    cancel: CancellationToken,
    closed: CancellationToken,
) {
    let mut in_flight = JoinSet::new();

    loop {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = subscription.next_message() => message,
        };

        let Some(message) = message else {
            warn!(
                queue = %processor.queue_name(),
                "subscription closed by transport, no further messages will arrive"
            );
            closed.cancel();
            break;
        };

        let processor = Arc::clone(&processor);
        in_flight.spawn(async move {
            let _permit = permit;
            processor.process(message).await
        });

        while let Some(finished) = in_flight.try_join_next() {
            log_finished(finished);
        }
    }

    if let Err(e) = subscription.unsubscribe().await {
        error!(error = %e, "failed to release queue subscription");
    }

    drain(&mut in_flight, drain_timeout).await;
}

/// Wait for in-flight messages up to `timeout`, then abort the rest
async fn drain(in_flight: &mut JoinSet<ProcessingOutcome>, timeout: Duration) {
    if in_flight.is_empty() {
        return;
    }

    debug!(in_flight = in_flight.len(), "draining in-flight messages");

    let drained = tokio::time::timeout(timeout, async {
        while let Some(finished) = in_flight.join_next().await {
            log_finished(finished);
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            abandoned = in_flight.len(),
            timeout_ms = timeout.as_millis(),
            "drain timeout reached, abandoning in-flight messages"
        );
        in_flight.shutdown().await;
    }
}

fn log_finished(finished: Result<ProcessingOutcome, JoinError>) {
    match finished {
        Ok(outcome) => debug!(outcome = %outcome, "message handling finished"),
        Err(e) if e.is_panic() => error!(error = %e, "message processing panicked"),
        Err(e) => debug!(error = %e, "message processing cancelled"),
    }
}

async fn report_transport_errors(
    mut faults: broadcast::Receiver<TransportError>,
    reporter: Arc<dyn TransportErrorReporter>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = faults.recv() => match received {
                Ok(transport_error) => reporter.report(&transport_error),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "transport errors dropped before they could be reported");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProcessorConfig;
    use crate::nats::MockTransportErrorReporter;
    use async_trait::async_trait;
    use bytes::Bytes;
    use common::domain::{
        CountingResult, CountingResultRepository, DomainResult, MockCountingResultRepository,
    };
    use common::nats::{MockQueueConsumer, QueueMessage, TransportErrorKind};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::{mpsc, Barrier};

    const WAIT: Duration = Duration::from_secs(5);

    /// Subscription fed from a channel, recording whether it was released
    struct ChannelSubscription {
        messages: mpsc::Receiver<QueueMessage>,
        unsubscribed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl QueueSubscription for ChannelSubscription {
        async fn next_message(&mut self) -> Option<QueueMessage> {
            self.messages.recv().await
        }

        async fn unsubscribe(&mut self) -> anyhow::Result<()> {
            self.unsubscribed.store(true, Ordering::SeqCst);
            self.messages.close();
            Ok(())
        }
    }

    struct Harness {
        listener: QueueListener,
        messages: mpsc::Sender<QueueMessage>,
        faults: broadcast::Sender<TransportError>,
        unsubscribed: Arc<AtomicBool>,
    }

    fn harness(
        repository: Arc<dyn CountingResultRepository>,
        reporter: Arc<dyn TransportErrorReporter>,
        max_in_flight: usize,
    ) -> Harness {
        let (messages, rx) = mpsc::channel(16);
        let (faults, _) = broadcast::channel(16);
        let unsubscribed = Arc::new(AtomicBool::new(false));

        let subscription = ChannelSubscription {
            messages: rx,
            unsubscribed: Arc::clone(&unsubscribed),
        };

        let mut consumer = MockQueueConsumer::new();
        consumer
            .expect_subscribe()
            .withf(|queue: &str, group: &Option<String>| {
                queue == "counting_results" && group.as_deref() == Some("tally-worker")
            })
            .times(1)
            .return_once(move |_, _| Ok(Box::new(subscription) as Box<dyn QueueSubscription>));
        let fault_sender = faults.clone();
        consumer
            .expect_transport_errors()
            .returning(move || fault_sender.subscribe());

        let processor = Arc::new(MessageProcessor::new(
            ProcessorConfig {
                queue_name: "counting_results".to_string(),
            },
            repository,
        ));

        let listener = QueueListener::new(
            Arc::new(consumer),
            processor,
            reporter,
            ListenerConfig {
                queue_name: "counting_results".to_string(),
                queue_group: Some("tally-worker".to_string()),
                max_in_flight,
                drain_timeout: Duration::from_secs(1),
            },
        );

        Harness {
            listener,
            messages,
            faults,
            unsubscribed,
        }
    }

    fn message(id: &str, payload: &'static str) -> QueueMessage {
        QueueMessage::new("counting_results", id, Bytes::from_static(payload.as_bytes()))
    }

    /// Repository mock that forwards every saved result to a channel
    fn recording_repository(
        expected_calls: usize,
    ) -> (
        MockCountingResultRepository,
        mpsc::UnboundedReceiver<CountingResult>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut repo = MockCountingResultRepository::new();
        repo.expect_save()
            .times(expected_calls)
            .returning(move |result| {
                let _ = tx.send(result.clone());
                Ok(())
            });
        (repo, rx)
    }

    #[tokio::test]
    async fn test_start_moves_to_listening_and_stop_to_stopped() {
        let mut h = harness(
            Arc::new(MockCountingResultRepository::new()),
            Arc::new(MockTransportErrorReporter::new()),
            4,
        );

        assert_eq!(h.listener.state(), ListenerState::Stopped);

        h.listener.start().await.unwrap();
        assert_eq!(h.listener.state(), ListenerState::Listening);

        h.listener.stop().await.unwrap();
        assert_eq!(h.listener.state(), ListenerState::Stopped);
        assert!(h.unsubscribed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_no_dispatch_after_stop() {
        let mut h = harness(
            Arc::new(MockCountingResultRepository::new()),
            Arc::new(MockTransportErrorReporter::new()),
            4,
        );

        h.listener.start().await.unwrap();
        h.listener.stop().await.unwrap();

        let late = h
            .messages
            .send(message("late", r#"{"id":"late","count":1}"#))
            .await;

        assert!(late.is_err());
        assert_eq!(h.listener.state(), ListenerState::Stopped);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let mut h = harness(
            Arc::new(MockCountingResultRepository::new()),
            Arc::new(MockTransportErrorReporter::new()),
            4,
        );

        h.listener.start().await.unwrap();
        let second = h.listener.start().await;

        assert!(matches!(
            second,
            Err(ListenerError::InvalidState {
                operation: "start",
                state: ListenerState::Listening
            })
        ));

        h.listener.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let mut h = harness(
            Arc::new(MockCountingResultRepository::new()),
            Arc::new(MockTransportErrorReporter::new()),
            4,
        );

        assert!(h.listener.stop().await.is_ok());
        assert_eq!(h.listener.state(), ListenerState::Stopped);
    }

    #[tokio::test]
    async fn test_subscribe_failure_returns_to_stopped() {
        let mut consumer = MockQueueConsumer::new();
        consumer
            .expect_transport_errors()
            .returning(|| broadcast::channel(1).1);
        consumer
            .expect_subscribe()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("no route to host")));

        let processor = Arc::new(MessageProcessor::new(
            ProcessorConfig {
                queue_name: "counting_results".to_string(),
            },
            Arc::new(MockCountingResultRepository::new()),
        ));

        let mut listener = QueueListener::new(
            Arc::new(consumer),
            processor,
            Arc::new(MockTransportErrorReporter::new()),
            ListenerConfig {
                queue_name: "counting_results".to_string(),
                queue_group: None,
                max_in_flight: 1,
                drain_timeout: Duration::from_secs(1),
            },
        );

        let err = listener.start().await.unwrap_err();

        assert!(matches!(err, ListenerError::Subscribe { .. }));
        assert!(err.to_string().contains("counting_results"));
        assert_eq!(listener.state(), ListenerState::Stopped);
    }

    #[tokio::test]
    async fn test_every_message_is_processed_regardless_of_earlier_failures() {
        let (repo, mut saved) = recording_repository(2);
        let mut h = harness(
            Arc::new(repo),
            Arc::new(MockTransportErrorReporter::new()),
            1,
        );

        h.listener.start().await.unwrap();

        h.messages
            .send(message("m1", r#"{"Id":"c1","Count":42}"#))
            .await
            .unwrap();
        h.messages.send(message("m2", "not-json")).await.unwrap();
        h.messages
            .send(message("m3", r#"{"id":"c2","count":7}"#))
            .await
            .unwrap();

        let mut ids = Vec::new();
        for _ in 0..2 {
            let result = tokio::time::timeout(WAIT, saved.recv())
                .await
                .expect("timed out waiting for save")
                .expect("repository dropped");
            ids.push(result.id);
        }
        ids.sort();

        assert_eq!(ids, vec!["c1".to_string(), "c2".to_string()]);
        h.listener.stop().await.unwrap();
    }

    /// Blocks every save until two are running at once
    struct RendezvousRepository {
        barrier: Barrier,
        saved: mpsc::UnboundedSender<CountingResult>,
    }

    #[async_trait]
    impl CountingResultRepository for RendezvousRepository {
        async fn save(&self, result: &CountingResult) -> DomainResult<()> {
            self.barrier.wait().await;
            let _ = self.saved.send(result.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_messages_are_processed_concurrently() {
        let (tx, mut saved) = mpsc::unbounded_channel();
        let repository = Arc::new(RendezvousRepository {
            barrier: Barrier::new(2),
            saved: tx,
        });

        let mut h = harness(repository, Arc::new(MockTransportErrorReporter::new()), 2);
        h.listener.start().await.unwrap();

        h.messages
            .send(message("m1", r#"{"id":"a","count":1}"#))
            .await
            .unwrap();
        h.messages
            .send(message("m2", r#"{"id":"b","count":2}"#))
            .await
            .unwrap();

        let mut results = Vec::new();
        for _ in 0..2 {
            let result = tokio::time::timeout(WAIT, saved.recv())
                .await
                .expect("saves did not run concurrently")
                .expect("repository dropped");
            results.push(result);
        }
        results.sort_by(|a, b| a.id.cmp(&b.id));

        assert_eq!(
            results,
            vec![CountingResult::new("a", 1), CountingResult::new("b", 2)]
        );
        h.listener.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_transport_errors_are_reported_and_listener_keeps_running() {
        let (reported_tx, mut reported) = mpsc::unbounded_channel();
        let mut reporter = MockTransportErrorReporter::new();
        reporter
            .expect_report()
            .times(1)
            .returning(move |transport_error| {
                let _ = reported_tx.send(transport_error.clone());
            });

        let (repo, mut saved) = recording_repository(1);
        let mut h = harness(Arc::new(repo), Arc::new(reporter), 1);
        h.listener.start().await.unwrap();

        h.faults
            .send(TransportError::new(
                TransportErrorKind::Disconnected,
                "link lost",
            ))
            .unwrap();

        let transport_error = tokio::time::timeout(WAIT, reported.recv())
            .await
            .expect("timed out waiting for report")
            .expect("reporter dropped");
        assert_eq!(transport_error.kind, TransportErrorKind::Disconnected);
        assert_eq!(transport_error.message, "link lost");

        h.messages
            .send(message("m1", r#"{"id":"c5","count":5}"#))
            .await
            .unwrap();
        let result = tokio::time::timeout(WAIT, saved.recv())
            .await
            .expect("timed out waiting for save")
            .expect("repository dropped");

        assert_eq!(result.id, "c5");
        assert_eq!(h.listener.state(), ListenerState::Listening);
        h.listener.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_on_cancellation() {
        let h = harness(
            Arc::new(MockCountingResultRepository::new()),
            Arc::new(MockTransportErrorReporter::new()),
            1,
        );
        let unsubscribed = Arc::clone(&h.unsubscribed);
        let ctx = CancellationToken::new();

        let run = tokio::spawn(h.listener.run(ctx.clone()));
        ctx.cancel();

        tokio::time::timeout(WAIT, run)
            .await
            .expect("listener did not stop")
            .unwrap()
            .unwrap();
        assert!(unsubscribed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_run_fails_when_transport_closes_subscription() {
        let (repo, mut saved) = recording_repository(1);
        let h = harness(Arc::new(repo), Arc::new(MockTransportErrorReporter::new()), 1);
        let unsubscribed = Arc::clone(&h.unsubscribed);

        let run = tokio::spawn(h.listener.run(CancellationToken::new()));

        h.messages
            .send(message("m1", r#"{"id":"last","count":3}"#))
            .await
            .unwrap();
        drop(h.messages);

        let err = tokio::time::timeout(WAIT, run)
            .await
            .expect("listener kept running after subscription closed")
            .unwrap()
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ListenerError>(),
            Some(ListenerError::SubscriptionClosed { queue }) if queue == "counting_results"
        ));
        assert!(unsubscribed.load(Ordering::SeqCst));
        assert_eq!(saved.recv().await.unwrap().id, "last");
    }
}
