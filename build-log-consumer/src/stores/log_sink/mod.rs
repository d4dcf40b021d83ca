mod clickhouse;
mod memory;
mod postgres;

pub use self::clickhouse::ClickHouseLogSink;
pub use self::memory::MemoryLogSink;
pub use self::postgres::PostgresLogSink;

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::info;

use crate::config::Config;
use crate::types::BuildLogEvent;

pub const LOG_EVENTS_TABLE: &str = "log_events";

#[derive(Debug, thiserror::Error)]
pub enum LogSinkError {
    #[error("postgres log sink error: {0}")]
    Postgres(#[from] sqlx::Error),
    #[error("clickhouse log sink error: {0}")]
    ClickHouse(#[from] ::clickhouse::error::Error),
    #[error("log sink unavailable: {0}")]
    Unavailable(String),
}

impl LogSinkError {
    /// Network and connection failures. Anything else (bad query, schema
    /// mismatch) will fail the same way on every retry.
    pub fn is_transient(&self) -> bool {
        match self {
            LogSinkError::Postgres(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            LogSinkError::ClickHouse(e) => matches!(e, ::clickhouse::error::Error::Network(_)),
            LogSinkError::Unavailable(_) => true,
        }
    }
}

/// Inclusive time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogQuery {
    pub range: Option<TimeRange>,
    pub limit: Option<u64>,
    pub offset: u64,
}

/// Durable store of build log lines.
///
/// Every read returns events ascending by timestamp. Ties are broken by
/// arrival order where the backend can tell, which is not guaranteed to be
/// stable across backends. Returned events always carry a timestamp: when the
/// producer did not send one, the backend assigns ingestion time.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn insert(&self, event: &BuildLogEvent) -> Result<(), LogSinkError>;

    async fn query(
        &self,
        deployment_id: &str,
        query: &LogQuery,
    ) -> Result<Vec<BuildLogEvent>, LogSinkError>;

    async fn count(&self, deployment_id: &str) -> Result<u64, LogSinkError>;

    async fn delete_by_deployment(&self, deployment_id: &str) -> Result<(), LogSinkError>;

    async fn all_for_deployment(
        &self,
        deployment_id: &str,
    ) -> Result<Vec<BuildLogEvent>, LogSinkError> {
        self.query(deployment_id, &LogQuery::default()).await
    }

    async fn page(
        &self,
        deployment_id: &str,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<BuildLogEvent>, LogSinkError> {
        let query = LogQuery {
            limit: Some(limit),
            offset,
            ..Default::default()
        };
        self.query(deployment_id, &query).await
    }

    async fn in_time_range(
        &self,
        deployment_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<BuildLogEvent>, LogSinkError> {
        let query = LogQuery {
            range: Some(TimeRange::new(start, end)),
            ..Default::default()
        };
        self.query(deployment_id, &query).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSinkBackend {
    ClickHouse,
    Postgres,
    Memory,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown log sink backend: {0}, expected one of clickhouse, postgres, memory")]
pub struct UnknownBackend(String);

impl FromStr for LogSinkBackend {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "clickhouse" => Ok(LogSinkBackend::ClickHouse),
            "postgres" => Ok(LogSinkBackend::Postgres),
            "memory" => Ok(LogSinkBackend::Memory),
            _ => Err(UnknownBackend(s.to_string())),
        }
    }
}

/// Resolve the configured backend once, at startup.
pub async fn build_log_sink(config: &Config, pool: &PgPool) -> anyhow::Result<Arc<dyn LogSink>> {
    let sink: Arc<dyn LogSink> = match config.log_sink_backend {
        LogSinkBackend::ClickHouse => Arc::new(
            ClickHouseLogSink::connect(config)
                .await
                .with_context(|| format!("Failed to connect to ClickHouse at {}", config.clickhouse_url))?,
        ),
        LogSinkBackend::Postgres => Arc::new(PostgresLogSink::new(pool.clone())),
        LogSinkBackend::Memory => Arc::new(MemoryLogSink::new()),
    };

    info!("Log sink backend: {:?}", config.log_sink_backend);
    Ok(sink)
}
