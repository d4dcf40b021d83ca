//! In-process stand-ins for the broker and the stores, shared by unit and
//! integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::error::KafkaError;
use rdkafka::message::{OwnedHeaders, OwnedMessage};
use rdkafka::Timestamp;
use serde_json::json;
use tokio::sync::mpsc;

use crate::kafka::consumer::GroupSubscription;
use crate::stores::deployment::{DeploymentStore, DeploymentStoreError};
use crate::stores::log_sink::{LogQuery, LogSink, LogSinkError};
use crate::types::{BuildLogEvent, DeploymentStatus};

pub const TEST_TOPIC: &str = "build-logs";

pub fn message_at(
    partition: i32,
    offset: i64,
    key: Option<&str>,
    payload: Option<&str>,
) -> OwnedMessage {
    OwnedMessage::new(
        payload.map(|p| p.as_bytes().to_vec()),
        key.map(|k| k.as_bytes().to_vec()),
        TEST_TOPIC.to_string(),
        Timestamp::now(),
        partition,
        offset,
        Some(OwnedHeaders::new()),
    )
}

pub fn build_message(key: Option<&str>, payload: Option<&str>) -> OwnedMessage {
    message_at(0, 0, key, payload)
}

/// A well-formed message keyed by its deployment id.
pub fn log_message(deployment_id: &str, log: &str) -> OwnedMessage {
    let payload = json!({ "deployment_id": deployment_id, "log": log }).to_string();
    build_message(Some(deployment_id), Some(&payload))
}

pub fn event_payload(event: &BuildLogEvent) -> String {
    serde_json::to_string(event).unwrap_or_default()
}

/// Feeds a `ChannelSubscription`.
#[derive(Clone)]
pub struct SubscriptionFeed {
    tx: mpsc::UnboundedSender<Result<OwnedMessage, KafkaError>>,
}

impl SubscriptionFeed {
    /// Returns false once the subscription has been dropped.
    pub fn send(&self, message: OwnedMessage) -> bool {
        self.tx.send(Ok(message)).is_ok()
    }

    pub fn send_error(&self, error: KafkaError) -> bool {
        self.tx.send(Err(error)).is_ok()
    }
}

/// A group subscription backed by a channel. Records every stored offset
/// and rejoin so tests can assert on them. Once the feed is dropped and
/// drained, `next_message` waits forever, like an idle topic.
pub struct ChannelSubscription {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<OwnedMessage, KafkaError>>>,
    acknowledged: Mutex<Vec<(i32, i64)>>,
    rejoins: AtomicUsize,
    flushes: AtomicUsize,
}

impl ChannelSubscription {
    pub fn new() -> (Arc<Self>, SubscriptionFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = Arc::new(Self {
            rx: tokio::sync::Mutex::new(rx),
            acknowledged: Mutex::new(Vec::new()),
            rejoins: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
        });
        (subscription, SubscriptionFeed { tx })
    }

    /// (partition, offset) of every stored offset, in store order.
    pub fn acknowledged(&self) -> Vec<(i32, i64)> {
        self.acknowledged.lock().clone()
    }

    pub fn ack_count(&self) -> usize {
        self.acknowledged.lock().len()
    }

    /// Highest offset stored for `partition`.
    pub fn acknowledged_offset(&self, partition: i32) -> Option<i64> {
        self.acknowledged
            .lock()
            .iter()
            .filter(|(p, _)| *p == partition)
            .map(|(_, offset)| *offset)
            .max()
    }

    pub fn rejoin_count(&self) -> usize {
        self.rejoins.load(Ordering::SeqCst)
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Poll until `offset` or a later one has been stored for `partition`.
    /// False on timeout.
    pub async fn wait_for_offset(&self, partition: i32, offset: i64, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self
            .acknowledged_offset(partition)
            .map_or(true, |stored| stored < offset)
        {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }
}

#[async_trait]
impl GroupSubscription for ChannelSubscription {
    async fn next_message(&self) -> Result<OwnedMessage, KafkaError> {
        let next = self.rx.lock().await.recv().await;
        match next {
            Some(received) => received,
            None => std::future::pending().await,
        }
    }

    fn acknowledge(&self, _topic: &str, partition: i32, offset: i64) -> Result<(), KafkaError> {
        self.acknowledged.lock().push((partition, offset));
        Ok(())
    }

    fn rejoin(&self) -> Result<(), KafkaError> {
        self.rejoins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn flush(&self) -> Result<(), KafkaError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Fails the first `failures` calls, then behaves like the wrapped store.
/// Without an inner store, successful calls are no-ops.
pub struct FailingDeploymentStore {
    remaining: AtomicUsize,
    calls: AtomicUsize,
    inner: Option<Arc<dyn DeploymentStore>>,
}

impl FailingDeploymentStore {
    pub fn always() -> Self {
        Self::fail_first(usize::MAX, None)
    }

    pub fn fail_first(failures: usize, inner: Option<Arc<dyn DeploymentStore>>) -> Self {
        Self {
            remaining: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
            inner,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn take_failure(remaining: &AtomicUsize) -> bool {
    remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl DeploymentStore for FailingDeploymentStore {
    async fn update_status(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
    ) -> Result<(), DeploymentStoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.remaining) {
            return Err(DeploymentStoreError::Unavailable(
                "injected failure".to_string(),
            ));
        }
        match &self.inner {
            Some(inner) => inner.update_status(deployment_id, status).await,
            None => Ok(()),
        }
    }
}

/// Fails the first `failures` inserts, then forwards to the wrapped sink.
/// Reads always go to the wrapped sink.
pub struct FailingLogSink {
    remaining: AtomicUsize,
    inner: Option<Arc<dyn LogSink>>,
}

impl FailingLogSink {
    pub fn always() -> Self {
        Self::fail_first(usize::MAX, None)
    }

    pub fn fail_first(failures: usize, inner: Option<Arc<dyn LogSink>>) -> Self {
        Self {
            remaining: AtomicUsize::new(failures),
            inner,
        }
    }

    fn inner(&self) -> Result<&Arc<dyn LogSink>, LogSinkError> {
        self.inner
            .as_ref()
            .ok_or_else(|| LogSinkError::Unavailable("no backing sink".to_string()))
    }
}

#[async_trait]
impl LogSink for FailingLogSink {
    async fn insert(&self, event: &BuildLogEvent) -> Result<(), LogSinkError> {
        if take_failure(&self.remaining) {
            return Err(LogSinkError::Unavailable("injected failure".to_string()));
        }
        self.inner()?.insert(event).await
    }

    async fn query(
        &self,
        deployment_id: &str,
        query: &LogQuery,
    ) -> Result<Vec<BuildLogEvent>, LogSinkError> {
        self.inner()?.query(deployment_id, query).await
    }

    async fn count(&self, deployment_id: &str) -> Result<u64, LogSinkError> {
        self.inner()?.count(deployment_id).await
    }

    async fn delete_by_deployment(&self, deployment_id: &str) -> Result<(), LogSinkError> {
        self.inner()?.delete_by_deployment(deployment_id).await
    }
}
