use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};

use super::{LogQuery, LogSink, LogSinkError};
use crate::types::BuildLogEvent;

// timestamp falls back to the server clock when the producer did not send one
const INSERT_LOG_EVENT: &str = r#"
    INSERT INTO log_events (event_id, deployment_id, log, timestamp)
    VALUES ($1, $2, $3, COALESCE($4, now()))
"#;

#[derive(sqlx::FromRow)]
struct LogEventRow {
    event_id: String,
    deployment_id: String,
    log: String,
    timestamp: DateTime<Utc>,
}

impl From<LogEventRow> for BuildLogEvent {
    fn from(row: LogEventRow) -> Self {
        BuildLogEvent {
            event_id: row.event_id,
            deployment_id: row.deployment_id,
            log: row.log,
            timestamp: Some(row.timestamp),
        }
    }
}

/// Relational log sink. See `migrations/` for the `log_events` table; the
/// `seq` column breaks timestamp ties by arrival.
pub struct PostgresLogSink {
    pool: PgPool,
}

impl PostgresLogSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn select_query<'a>(deployment_id: &'a str, query: &LogQuery) -> QueryBuilder<'a, Postgres> {
    let mut builder = QueryBuilder::new(
        "SELECT event_id, deployment_id, log, timestamp FROM log_events WHERE deployment_id = ",
    );
    builder.push_bind(deployment_id);

    if let Some(range) = query.range {
        builder.push(" AND timestamp >= ");
        builder.push_bind(range.start);
        builder.push(" AND timestamp <= ");
        builder.push_bind(range.end);
    }

    builder.push(" ORDER BY timestamp ASC, seq ASC");

    if let Some(limit) = query.limit {
        builder.push(" LIMIT ");
        builder.push_bind(limit as i64);
    }
    if query.offset > 0 {
        builder.push(" OFFSET ");
        builder.push_bind(query.offset as i64);
    }

    builder
}

#[async_trait]
impl LogSink for PostgresLogSink {
    async fn insert(&self, event: &BuildLogEvent) -> Result<(), LogSinkError> {
        sqlx::query(INSERT_LOG_EVENT)
            .bind(&event.event_id)
            .bind(&event.deployment_id)
            .bind(&event.log)
            .bind(event.timestamp)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn query(
        &self,
        deployment_id: &str,
        query: &LogQuery,
    ) -> Result<Vec<BuildLogEvent>, LogSinkError> {
        let rows: Vec<LogEventRow> = select_query(deployment_id, query)
            .build_query_as()
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(BuildLogEvent::from).collect())
    }

    async fn count(&self, deployment_id: &str) -> Result<u64, LogSinkError> {
        let count: i64 =
            sqlx::query_scalar("SELECT count(*) FROM log_events WHERE deployment_id = $1")
                .bind(deployment_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    async fn delete_by_deployment(&self, deployment_id: &str) -> Result<(), LogSinkError> {
        sqlx::query("DELETE FROM log_events WHERE deployment_id = $1")
            .bind(deployment_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
