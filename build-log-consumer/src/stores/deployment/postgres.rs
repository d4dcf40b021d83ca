use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

use super::{DeploymentStore, DeploymentStoreError, StatusWritePolicy};
use crate::types::DeploymentStatus;

const UPDATE_STATUS: &str = r#"
    UPDATE deployments
    SET status = $1, updated_at = now()
    WHERE id = $2
"#;

const UPDATE_STATUS_MONOTONIC: &str = r#"
    UPDATE deployments
    SET status = $1, updated_at = now()
    WHERE id = $2 AND status = ANY($3)
"#;

pub struct PostgresDeploymentStore {
    pool: PgPool,
    policy: StatusWritePolicy,
}

impl PostgresDeploymentStore {
    pub fn new(pool: PgPool, policy: StatusWritePolicy) -> Self {
        Self { pool, policy }
    }
}

#[async_trait]
impl DeploymentStore for PostgresDeploymentStore {
    async fn update_status(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
    ) -> Result<(), DeploymentStoreError> {
        let result = match self.policy {
            StatusWritePolicy::Overwrite => {
                sqlx::query(UPDATE_STATUS)
                    .bind(status.as_str())
                    .bind(deployment_id)
                    .execute(&self.pool)
                    .await?
            }
            StatusWritePolicy::Monotonic => {
                let allowed: Vec<String> = DeploymentStatus::predecessors_of(status)
                    .iter()
                    .map(|s| s.as_str().to_string())
                    .collect();

                sqlx::query(UPDATE_STATUS_MONOTONIC)
                    .bind(status.as_str())
                    .bind(deployment_id)
                    .bind(allowed)
                    .execute(&self.pool)
                    .await?
            }
        };

        if result.rows_affected() == 0 {
            debug!(
                deployment_id,
                status = %status,
                "status write matched no row (unknown deployment or guarded regression)"
            );
        }

        Ok(())
    }
}
