use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Message, OwnedMessage};
use rdkafka::{Offset, TopicPartitionList};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::kafka::config::GroupConsumerConfig;
use crate::kafka::context::PipelineConsumerContext;
use crate::kafka::offset_tracker::OffsetTracker;
use crate::metrics_consts::{
    CONSUMER_KAFKA_ERROR, CONSUMER_REJOINS, MESSAGES_ACKNOWLEDGED, MESSAGES_FAILED,
    MESSAGES_RECEIVED, OFFSETS_STORED,
};
use crate::processor::EventProcessor;
use crate::worker_pool::WorkerPool;

/// Source of messages for one consumer-group member.
///
/// Implemented over rdkafka for production and over an in-process channel in
/// `test_utils`.
#[async_trait]
pub trait GroupSubscription: Send + Sync + 'static {
    async fn next_message(&self) -> Result<OwnedMessage, KafkaError>;

    /// Store `offset` as processed for the partition, so the next commit
    /// resumes after it. Only called with offsets that every earlier message
    /// on the partition has caught up to.
    fn acknowledge(&self, topic: &str, partition: i32, offset: i64) -> Result<(), KafkaError>;

    /// Leave and join the group again after a failed session.
    fn rejoin(&self) -> Result<(), KafkaError>;

    /// Commit whatever has been acknowledged so far. Called once on shutdown.
    fn flush(&self) -> Result<(), KafkaError> {
        Ok(())
    }
}

pub struct KafkaSubscription {
    consumer: StreamConsumer<PipelineConsumerContext>,
    topic: String,
}

impl KafkaSubscription {
    pub fn new(
        config: &GroupConsumerConfig,
        offsets: Arc<OffsetTracker>,
    ) -> Result<Self, KafkaError> {
        let consumer: StreamConsumer<PipelineConsumerContext> = config
            .client_config()
            .create_with_context(PipelineConsumerContext::new(offsets))?;
        consumer.subscribe(&[config.topic.as_str()])?;

        info!(
            "Subscribed to topic {} as group {}",
            config.topic, config.group_id
        );

        Ok(Self {
            consumer,
            topic: config.topic.clone(),
        })
    }
}

#[async_trait]
impl GroupSubscription for KafkaSubscription {
    async fn next_message(&self) -> Result<OwnedMessage, KafkaError> {
        self.consumer.recv().await.map(|message| message.detach())
    }

    fn acknowledge(&self, topic: &str, partition: i32, offset: i64) -> Result<(), KafkaError> {
        // The committed position is the next offset to read
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(offset + 1))?;
        self.consumer.store_offsets(&tpl)
    }

    fn rejoin(&self) -> Result<(), KafkaError> {
        self.consumer.unsubscribe();
        self.consumer.subscribe(&[self.topic.as_str()])
    }

    fn flush(&self) -> Result<(), KafkaError> {
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
            other => other,
        }
    }
}

enum SessionEnd {
    Shutdown,
    Failed(KafkaError),
}

/// What the receive loop does after an error from the broker.
#[derive(Debug, PartialEq, Eq)]
enum ReceiveAction {
    /// Poll again straight away.
    Continue,
    /// Poll again after the delay, unless shutdown arrives first.
    Backoff(Duration),
    /// End the session and rejoin the group.
    Rejoin,
}

fn linear_backoff(step: Duration, attempt: u64, cap: Duration) -> Duration {
    let attempt = u32::try_from(attempt).unwrap_or(u32::MAX);
    step.saturating_mul(attempt).min(cap)
}

/// Map a receive error to the loop's next move and a metric label.
/// `attempt` counts consecutive errors in the current session, from 1.
fn classify_receive_error(e: &KafkaError, attempt: u64) -> (ReceiveAction, &'static str) {
    match e {
        KafkaError::MessageConsumption(RDKafkaErrorCode::PartitionEOF) => {
            (ReceiveAction::Continue, "partition_eof")
        }
        KafkaError::MessageConsumption(RDKafkaErrorCode::OperationTimedOut) => {
            (ReceiveAction::Continue, "timed_out")
        }
        KafkaError::MessageConsumption(_) => (
            ReceiveAction::Backoff(linear_backoff(
                Duration::from_millis(100),
                attempt,
                Duration::from_secs(1),
            )),
            "consumption",
        ),
        KafkaError::Global(
            RDKafkaErrorCode::AllBrokersDown | RDKafkaErrorCode::BrokerTransportFailure,
        ) => (
            ReceiveAction::Backoff(linear_backoff(
                Duration::from_millis(500),
                attempt,
                Duration::from_secs(5),
            )),
            "broker_unavailable",
        ),
        KafkaError::Global(RDKafkaErrorCode::Authentication) => {
            (ReceiveAction::Rejoin, "authentication")
        }
        KafkaError::Global(_) => (
            ReceiveAction::Backoff(linear_backoff(
                Duration::from_millis(250),
                attempt,
                Duration::from_secs(2),
            )),
            "global",
        ),
        KafkaError::MessageConsumptionFatal(_) => (ReceiveAction::Rejoin, "fatal"),
        KafkaError::Canceled => (ReceiveAction::Rejoin, "canceled"),
        KafkaError::Subscription(_) | KafkaError::ClientCreation(_) => {
            (ReceiveAction::Rejoin, "group")
        }
        _ => (
            ReceiveAction::Backoff(linear_backoff(
                Duration::from_millis(100),
                attempt,
                Duration::from_secs(1),
            )),
            "unexpected",
        ),
    }
}

/// Drives one consumer-group membership: pulls messages, hands them to the
/// worker pool, and rejoins the group when a session fails.
pub struct GroupConsumer {
    subscription: Arc<dyn GroupSubscription>,
    offsets: Arc<OffsetTracker>,
    rejoin_backoff: Duration,
}

impl GroupConsumer {
    /// Connect and subscribe. An error here means the process cannot consume
    /// at all.
    pub fn new(config: &GroupConsumerConfig) -> Result<Self, KafkaError> {
        let offsets = Arc::new(OffsetTracker::new());
        let subscription = KafkaSubscription::new(config, offsets.clone())?;
        Ok(Self {
            subscription: Arc::new(subscription),
            offsets,
            rejoin_backoff: config.rejoin_backoff,
        })
    }

    pub fn with_subscription(
        subscription: Arc<dyn GroupSubscription>,
        rejoin_backoff: Duration,
    ) -> Self {
        Self {
            subscription,
            offsets: Arc::new(OffsetTracker::new()),
            rejoin_backoff,
        }
    }

    pub async fn run(
        &self,
        shutdown: CancellationToken,
        pool: &WorkerPool,
        processor: Arc<EventProcessor>,
    ) {
        info!("Starting build log consumer loop");

        loop {
            match self.run_session(&shutdown, pool, &processor).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Failed(e) => {
                    error!(
                        "Consumer session failed: {}, rejoining group in {:?}",
                        e, self.rejoin_backoff
                    );
                    metrics::counter!(CONSUMER_REJOINS).increment(1);

                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(self.rejoin_backoff) => {}
                    }

                    // Consumption restarts from the committed offsets
                    self.offsets.clear();

                    // A failed rejoin surfaces again as a receive error in the next session
                    if let Err(e) = self.subscription.rejoin() {
                        error!("Failed to rejoin consumer group: {}", e);
                    }
                }
            }
        }

        info!("Build log consumer loop stopped");
    }

    /// Commit acknowledged offsets, used once the pool has drained.
    pub fn flush(&self) {
        if let Err(e) = self.subscription.flush() {
            warn!("Failed to commit offsets on shutdown: {}", e);
        }
    }

    async fn run_session(
        &self,
        shutdown: &CancellationToken,
        pool: &WorkerPool,
        processor: &Arc<EventProcessor>,
    ) -> SessionEnd {
        let mut consecutive_errors: u64 = 0;

        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return SessionEnd::Shutdown,
                received = self.subscription.next_message() => received,
            };

            let e = match received {
                Ok(message) => {
                    consecutive_errors = 0;
                    metrics::counter!(MESSAGES_RECEIVED).increment(1);
                    self.dispatch(message, pool, processor).await;
                    continue;
                }
                Err(e) => e,
            };

            consecutive_errors += 1;
            let (action, kind) = classify_receive_error(&e, consecutive_errors);
            metrics::counter!(CONSUMER_KAFKA_ERROR, "error" => kind).increment(1);

            match action {
                ReceiveAction::Continue => debug!("Kafka receive error ({}): {}", kind, e),
                ReceiveAction::Backoff(delay) => {
                    warn!(
                        "Kafka receive error ({}): {}, retrying in {:?}",
                        kind, e, delay
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return SessionEnd::Shutdown,
                        _ = sleep(delay) => {}
                    }
                }
                ReceiveAction::Rejoin => return SessionEnd::Failed(e),
            }
        }
    }

    async fn dispatch(
        &self,
        message: OwnedMessage,
        pool: &WorkerPool,
        processor: &Arc<EventProcessor>,
    ) {
        let subscription = self.subscription.clone();
        let offsets = self.offsets.clone();
        let processor = processor.clone();

        offsets.track(message.topic(), message.partition(), message.offset());

        pool.submit(async move {
            let (topic, partition, offset) =
                (message.topic(), message.partition(), message.offset());

            let store = |watermark: i64| subscription.acknowledge(topic, partition, watermark);
            let stored = match processor.process(&message).await {
                Ok(outcome) => {
                    debug!(topic, partition, offset, "processed message: {:?}", outcome);
                    metrics::counter!(MESSAGES_ACKNOWLEDGED).increment(1);
                    offsets.complete(topic, partition, offset, store)
                }
                Err(e) => {
                    error!(
                        topic,
                        partition,
                        offset,
                        retryable = e.is_retryable(),
                        "failed to process message, partition held below {}: {}",
                        offset,
                        e
                    );
                    metrics::counter!(MESSAGES_FAILED, "reason" => e.reason()).increment(1);
                    offsets.fail(topic, partition, offset, store)
                }
            };

            match stored {
                Ok(Some(watermark)) => {
                    debug!(topic, partition, "stored offset {}", watermark);
                    metrics::counter!(OFFSETS_STORED).increment(1);
                }
                Ok(None) => {}
                Err(e) => error!(topic, partition, offset, "failed to store offset: {}", e),
            }
        })
        .await;
    }
}
