//! Offset tracker - decides which offset may be stored for each partition.
//!
//! Workers finish in any order, but an offset may only be stored once every
//! message delivered before it on the same partition has been processed
//! successfully. A message that failed keeps the partition's offset pinned
//! below it until it is delivered again and succeeds, or until the partition
//! is revoked and its state cleared.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PartitionKey {
    topic: String,
    partition: i32,
}

impl PartitionKey {
    fn new(topic: &str, partition: i32) -> Self {
        Self {
            topic: topic.to_string(),
            partition,
        }
    }
}

#[derive(Debug, Default)]
struct PartitionOffsets {
    /// Delivered and still being processed, with a count of outstanding
    /// deliveries per offset.
    pending: BTreeMap<i64, u32>,
    /// Processing failed and no later delivery has succeeded yet.
    failed: BTreeSet<i64>,
    /// Processed successfully, but above a pending or failed offset.
    completed: BTreeSet<i64>,
    /// Highest offset handed to the store so far.
    stored: Option<i64>,
}

impl PartitionOffsets {
    /// Drop one outstanding delivery of `offset`. False if none was tracked.
    fn settle(&mut self, offset: i64) -> bool {
        match self.pending.get_mut(&offset) {
            Some(outstanding) if *outstanding > 1 => *outstanding -= 1,
            Some(_) => {
                self.pending.remove(&offset);
            }
            None => return false,
        }
        true
    }

    fn blocked_at(&self) -> Option<i64> {
        let pending = self.pending.keys().next().copied();
        let failed = self.failed.first().copied();
        match (pending, failed) {
            (Some(p), Some(f)) => Some(p.min(f)),
            (p, f) => p.or(f),
        }
    }

    fn advance_with<E>(
        &mut self,
        store: impl FnOnce(i64) -> Result<(), E>,
    ) -> Result<Option<i64>, E> {
        match self.advance() {
            Some(watermark) => {
                store(watermark)?;
                Ok(Some(watermark))
            }
            None => Ok(None),
        }
    }

    /// Fold completed offsets below the lowest pending or failed one into the
    /// watermark. Returns the new watermark if it moved forward.
    fn advance(&mut self) -> Option<i64> {
        let blocked_at = self.blocked_at();

        let mut watermark = None;
        while let Some(&lowest) = self.completed.first() {
            if blocked_at.is_some_and(|blocked| lowest >= blocked) {
                break;
            }
            self.completed.remove(&lowest);
            watermark = Some(lowest);
        }

        // Only advance, never go backwards
        match (watermark, self.stored) {
            (Some(next), Some(stored)) if next <= stored => None,
            (Some(next), _) => {
                self.stored = Some(next);
                Some(next)
            }
            (None, _) => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: Mutex<HashMap<PartitionKey, PartitionOffsets>>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a delivered message. Must be called in receive order, before the
    /// message is handed to a worker.
    pub fn track(&self, topic: &str, partition: i32, offset: i64) {
        let mut partitions = self.partitions.lock();
        let state = partitions
            .entry(PartitionKey::new(topic, partition))
            .or_default();
        *state.pending.entry(offset).or_insert(0) += 1;
    }

    /// Record a successfully processed message. If that moves the partition's
    /// watermark, `store` is called with the new watermark while the tracker
    /// is still locked, so stores for one partition never arrive out of order.
    ///
    /// Offsets that were never tracked, or whose partition has since been
    /// cleared, are ignored.
    pub fn complete<E>(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        store: impl FnOnce(i64) -> Result<(), E>,
    ) -> Result<Option<i64>, E> {
        let mut partitions = self.partitions.lock();
        let Some(state) = partitions.get_mut(&PartitionKey::new(topic, partition)) else {
            debug!("Ignoring completion for untracked partition {topic}:{partition}");
            return Ok(None);
        };

        if !state.settle(offset) {
            debug!("Ignoring completion for untracked offset {topic}:{partition}@{offset}");
            return Ok(None);
        }
        state.failed.remove(&offset);
        state.completed.insert(offset);

        state.advance_with(store)
    }

    /// Record a message whose processing failed. Its offset holds the
    /// partition back until a later delivery of it succeeds. A failed replay
    /// of an offset that already succeeded does not, and may release the
    /// watermark, so `store` is handled as in `complete`.
    pub fn fail<E>(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        store: impl FnOnce(i64) -> Result<(), E>,
    ) -> Result<Option<i64>, E> {
        let mut partitions = self.partitions.lock();
        let Some(state) = partitions.get_mut(&PartitionKey::new(topic, partition)) else {
            return Ok(None);
        };

        let already_done =
            state.completed.contains(&offset) || state.stored.is_some_and(|s| offset <= s);
        if !state.settle(offset) {
            return Ok(None);
        }
        if !already_done {
            state.failed.insert(offset);
        }

        state.advance_with(store)
    }

    /// Lowest offset on the partition that has not been processed
    /// successfully, if any.
    pub fn lowest_pending(&self, topic: &str, partition: i32) -> Option<i64> {
        self.partitions
            .lock()
            .get(&PartitionKey::new(topic, partition))
            .and_then(PartitionOffsets::blocked_at)
    }

    /// Highest offset stored for the partition.
    pub fn stored_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        self.partitions
            .lock()
            .get(&PartitionKey::new(topic, partition))
            .and_then(|state| state.stored)
    }

    /// Forget a partition, e.g. when it is revoked.
    pub fn clear_partition(&self, topic: &str, partition: i32) {
        self.partitions
            .lock()
            .remove(&PartitionKey::new(topic, partition));
    }

    /// Forget every partition. Used when the consumer rejoins the group.
    pub fn clear(&self) {
        self.partitions.lock().clear();
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.lock().len()
    }
}
