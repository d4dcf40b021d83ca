use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rdkafka::message::OwnedMessage;

use build_log_consumer::kafka::GroupConsumer;
use build_log_consumer::pipeline::Pipeline;
use build_log_consumer::processor::EventProcessor;
use build_log_consumer::stores::deployment::{MemoryDeploymentStore, StatusWritePolicy};
use build_log_consumer::stores::log_sink::{LogSink, MemoryLogSink};
use build_log_consumer::test_utils::{
    event_payload, message_at, ChannelSubscription, SubscriptionFeed,
};
use build_log_consumer::types::{BuildLogEvent, DeploymentStatus};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn at(second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, second).unwrap()
}

/// Message for `deployment_id` at `offset` on partition 0, keyed by deployment.
pub fn build_log(offset: i64, deployment_id: &str, log: &str, second: u32) -> OwnedMessage {
    build_log_at(0, offset, deployment_id, log, second)
}

pub fn build_log_at(
    partition: i32,
    offset: i64,
    deployment_id: &str,
    log: &str,
    second: u32,
) -> OwnedMessage {
    let event = BuildLogEvent::new(deployment_id, log)
        .with_event_id(format!("{deployment_id}-{partition}-{offset}"))
        .with_timestamp(at(second));
    message_at(
        partition,
        offset,
        Some(deployment_id),
        Some(&event_payload(&event)),
    )
}

pub struct TestPipeline {
    pub pipeline: Pipeline,
    pub subscription: Arc<ChannelSubscription>,
    pub feed: SubscriptionFeed,
    pub deployments: Arc<MemoryDeploymentStore>,
    pub logs: Arc<MemoryLogSink>,
}

impl TestPipeline {
    pub fn new(pool_size: usize, policy: StatusWritePolicy) -> Self {
        let logs = Arc::new(MemoryLogSink::new());
        Self::with_sink(pool_size, policy, logs.clone(), logs)
    }

    /// Same as `new`, but the processor writes through `sink` while tests read
    /// back from `logs`.
    pub fn with_sink(
        pool_size: usize,
        policy: StatusWritePolicy,
        sink: Arc<dyn LogSink>,
        logs: Arc<MemoryLogSink>,
    ) -> Self {
        let deployments = Arc::new(MemoryDeploymentStore::new(policy));
        deployments.insert("D1", DeploymentStatus::Queued);
        deployments.insert("D2", DeploymentStatus::Queued);

        let (subscription, feed) = ChannelSubscription::new();
        let consumer =
            GroupConsumer::with_subscription(subscription.clone(), Duration::from_millis(10));
        let processor = EventProcessor::new(deployments.clone(), sink);
        let pipeline = Pipeline::new(consumer, processor, pool_size, WAIT);

        Self {
            pipeline,
            subscription,
            feed,
            deployments,
            logs,
        }
    }

    /// Run the pipeline until partition 0 has stored `offset` or later.
    pub async fn run_until_acknowledged(&self, offset: i64) {
        let subscription = self.subscription.clone();
        self.pipeline
            .run_until(async move {
                assert!(
                    subscription.wait_for_offset(0, offset, WAIT).await,
                    "expected offset {offset} to be stored, got {:?}",
                    subscription.acknowledged_offset(0)
                );
            })
            .await;
    }

    /// Run the pipeline until `count` lines for `deployment_id` reached the
    /// sink. Messages still in flight finish during the shutdown drain.
    pub async fn run_until_logged(&self, deployment_id: &str, count: u64) {
        let logs = self.logs.clone();
        self.pipeline
            .run_until(async move {
                assert!(
                    wait_for_count(&logs, deployment_id, count).await,
                    "expected {count} lines for {deployment_id}"
                );
            })
            .await;
    }
}

pub async fn wait_for_count(logs: &MemoryLogSink, deployment_id: &str, count: u64) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while logs.count(deployment_id).await.unwrap_or(0) < count {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    true
}
