use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::{LogQuery, LogSink, LogSinkError};
use crate::types::BuildLogEvent;

struct StoredEvent {
    seq: u64,
    event: BuildLogEvent,
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    events: Vec<StoredEvent>,
}

/// Log sink backed by a vector. Handy for local runs and tests, loses
/// everything on restart.
#[derive(Default)]
pub struct MemoryLogSink {
    inner: Mutex<Inner>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn insert(&self, event: &BuildLogEvent) -> Result<(), LogSinkError> {
        let mut event = event.clone();
        event.ensure_event_id();
        if event.timestamp.is_none() {
            event.timestamp = Some(Utc::now());
        }

        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.events.push(StoredEvent { seq, event });
        Ok(())
    }

    async fn query(
        &self,
        deployment_id: &str,
        query: &LogQuery,
    ) -> Result<Vec<BuildLogEvent>, LogSinkError> {
        let inner = self.inner.lock();

        let mut matching: Vec<&StoredEvent> = inner
            .events
            .iter()
            .filter(|stored| stored.event.deployment_id == deployment_id)
            .filter(|stored| match (&query.range, stored.event.timestamp) {
                (Some(range), Some(ts)) => range.contains(ts),
                _ => true,
            })
            .collect();
        matching.sort_by_key(|stored| (stored.event.timestamp, stored.seq));

        let limit = query.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(matching
            .into_iter()
            .skip(query.offset as usize)
            .take(limit)
            .map(|stored| stored.event.clone())
            .collect())
    }

    async fn count(&self, deployment_id: &str) -> Result<u64, LogSinkError> {
        let inner = self.inner.lock();
        Ok(inner
            .events
            .iter()
            .filter(|stored| stored.event.deployment_id == deployment_id)
            .count() as u64)
    }

    async fn delete_by_deployment(&self, deployment_id: &str) -> Result<(), LogSinkError> {
        self.inner
            .lock()
            .events
            .retain(|stored| stored.event.deployment_id != deployment_id);
        Ok(())
    }
}
