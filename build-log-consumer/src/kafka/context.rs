use std::sync::Arc;

use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::{ClientContext, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::kafka::offset_tracker::OffsetTracker;
use crate::metrics_consts::{OFFSET_COMMIT_FAILURES, REBALANCE_EVENTS};

/// Observes group membership changes. Revoked partitions are dropped from the
/// offset tracker, so messages from them that are still in flight finish
/// without storing an offset.
pub struct PipelineConsumerContext {
    offsets: Arc<OffsetTracker>,
}

impl PipelineConsumerContext {
    pub fn new(offsets: Arc<OffsetTracker>) -> Self {
        Self { offsets }
    }
}

impl ClientContext for PipelineConsumerContext {}

impl ConsumerContext for PipelineConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                info!("Revoking {} partitions", partitions.count());
                for p in partitions.elements() {
                    self.offsets.clear_partition(p.topic(), p.partition());
                }
                metrics::counter!(REBALANCE_EVENTS, "event_type" => "revoke").increment(1);
            }
            Rebalance::Assign(partitions) => {
                debug!(
                    "Pre-rebalance assign event for {} partitions",
                    partitions.count()
                );
            }
            Rebalance::Error(e) => {
                error!("Rebalance error: {}", e);
                metrics::counter!(REBALANCE_EVENTS, "event_type" => "error").increment(1);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                let assigned: Vec<String> = partitions
                    .elements()
                    .iter()
                    .map(|p| format!("{}:{}", p.topic(), p.partition()))
                    .collect();
                info!("Assigned {} partitions: {:?}", assigned.len(), assigned);
                metrics::counter!(REBALANCE_EVENTS, "event_type" => "assign").increment(1);
            }
            Rebalance::Revoke(_) => {
                debug!("Post-rebalance revoke event");
            }
            Rebalance::Error(e) => {
                error!("Post-rebalance error: {}", e);
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!("Committed offsets for {} partitions", offsets.count()),
            // Auto-commit fires even when nothing new was stored
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => {
                warn!("Offset commit failed: {}", e);
                metrics::counter!(OFFSET_COMMIT_FAILURES).increment(1);
            }
        }
    }
}
