mod memory;
mod postgres;

pub use memory::MemoryDeploymentStore;
pub use postgres::PostgresDeploymentStore;

use std::str::FromStr;

use async_trait::async_trait;

use crate::types::DeploymentStatus;

/// How status writes treat the value already stored for a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusWritePolicy {
    /// Unconditional write, last writer wins.
    #[default]
    Overwrite,
    /// Only move forward through the lifecycle; regressions are dropped.
    Monotonic,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown status write policy: {0}, expected one of overwrite, monotonic")]
pub struct UnknownWritePolicy(String);

impl FromStr for StatusWritePolicy {
    type Err = UnknownWritePolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "overwrite" => Ok(StatusWritePolicy::Overwrite),
            "monotonic" => Ok(StatusWritePolicy::Monotonic),
            _ => Err(UnknownWritePolicy(s.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeploymentStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("deployment store unavailable: {0}")]
    Unavailable(String),
}

impl DeploymentStoreError {
    /// Connection level failures are worth a redelivery, rejected statements are not.
    pub fn is_transient(&self) -> bool {
        match self {
            DeploymentStoreError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            DeploymentStoreError::Unavailable(_) => true,
        }
    }
}

/// Write side of the deployments table, as seen by the ingestion pipeline.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    /// Set the status of a deployment. Unknown deployments are a silent no-op.
    async fn update_status(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
    ) -> Result<(), DeploymentStoreError>;
}
