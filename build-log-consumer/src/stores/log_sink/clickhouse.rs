use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ::clickhouse::{Client, Row};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{LogQuery, LogSink, LogSinkError, LOG_EVENTS_TABLE};
use crate::config::Config;
use crate::types::BuildLogEvent;

// timestamp is DateTime64(3), carried as unix millis on the wire
#[derive(Row, Debug, Serialize, Deserialize)]
struct LogEventRow {
    event_id: String,
    deployment_id: String,
    log: String,
    timestamp: i64,
}

impl LogEventRow {
    fn from_event(event: &BuildLogEvent) -> Self {
        let mut event_id = event.event_id.clone();
        if event_id.is_empty() {
            event_id = uuid::Uuid::now_v7().to_string();
        }
        Self {
            event_id,
            deployment_id: event.deployment_id.clone(),
            log: event.log.clone(),
            timestamp: event.timestamp.unwrap_or_else(Utc::now).timestamp_millis(),
        }
    }
}

impl From<LogEventRow> for BuildLogEvent {
    fn from(row: LogEventRow) -> Self {
        BuildLogEvent {
            event_id: row.event_id,
            deployment_id: row.deployment_id,
            log: row.log,
            timestamp: DateTime::from_timestamp_millis(row.timestamp),
        }
    }
}

/// Columnar log sink. Deletes go through a mutation, so they are eventually
/// visible rather than immediate.
pub struct ClickHouseLogSink {
    client: Client,
}

impl ClickHouseLogSink {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn connect(config: &Config) -> Result<Self, LogSinkError> {
        let client = Client::default()
            .with_url(config.clickhouse_url.clone())
            .with_database(config.clickhouse_database.clone())
            .with_user(config.clickhouse_user.clone())
            .with_password(config.clickhouse_password.clone());

        // Verify connection
        client.query("SELECT 1").execute().await?;

        info!(
            "Successfully connected to ClickHouse at {}",
            config.clickhouse_url
        );

        Ok(Self::new(client))
    }
}

fn select_sql(query: &LogQuery) -> String {
    let mut sql = format!("SELECT ?fields FROM {LOG_EVENTS_TABLE} WHERE deployment_id = ?");
    if query.range.is_some() {
        sql.push_str(
            " AND timestamp >= fromUnixTimestamp64Milli(?) AND timestamp <= fromUnixTimestamp64Milli(?)",
        );
    }
    sql.push_str(" ORDER BY timestamp ASC");
    if query.limit.is_some() {
        sql.push_str(" LIMIT ?");
    }
    if query.offset > 0 {
        sql.push_str(" OFFSET ?");
    }
    sql
}

#[async_trait]
impl LogSink for ClickHouseLogSink {
    async fn insert(&self, event: &BuildLogEvent) -> Result<(), LogSinkError> {
        let mut insert = self.client.insert(LOG_EVENTS_TABLE)?;
        insert.write(&LogEventRow::from_event(event)).await?;
        insert.end().await?;
        Ok(())
    }

    async fn query(
        &self,
        deployment_id: &str,
        query: &LogQuery,
    ) -> Result<Vec<BuildLogEvent>, LogSinkError> {
        let mut q = self.client.query(&select_sql(query)).bind(deployment_id);
        if let Some(range) = query.range {
            q = q
                .bind(range.start.timestamp_millis())
                .bind(range.end.timestamp_millis());
        }
        if let Some(limit) = query.limit {
            q = q.bind(limit);
        }
        if query.offset > 0 {
            q = q.bind(query.offset);
        }

        let rows = q.fetch_all::<LogEventRow>().await?;
        Ok(rows.into_iter().map(BuildLogEvent::from).collect())
    }

    async fn count(&self, deployment_id: &str) -> Result<u64, LogSinkError> {
        let count = self
            .client
            .query(&format!(
                "SELECT count() FROM {LOG_EVENTS_TABLE} WHERE deployment_id = ?"
            ))
            .bind(deployment_id)
            .fetch_one::<u64>()
            .await?;
        Ok(count)
    }

    async fn delete_by_deployment(&self, deployment_id: &str) -> Result<(), LogSinkError> {
        self.client
            .query(&format!(
                "ALTER TABLE {LOG_EVENTS_TABLE} DELETE WHERE deployment_id = ?"
            ))
            .bind(deployment_id)
            .execute()
            .await?;
        Ok(())
    }
}
