use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{DeploymentStore, DeploymentStoreError, StatusWritePolicy};
use crate::types::DeploymentStatus;

/// In-process deployment table. Mirrors the postgres semantics: writes to
/// unknown deployments match nothing.
#[derive(Default)]
pub struct MemoryDeploymentStore {
    policy: StatusWritePolicy,
    statuses: Mutex<HashMap<String, DeploymentStatus>>,
    applied: Mutex<Vec<(String, DeploymentStatus)>>,
}

impl MemoryDeploymentStore {
    pub fn new(policy: StatusWritePolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    /// Register a deployment, as the CRUD layer would when it queues one.
    pub fn insert(&self, deployment_id: impl Into<String>, status: DeploymentStatus) {
        self.statuses.lock().insert(deployment_id.into(), status);
    }

    pub fn status(&self, deployment_id: &str) -> Option<DeploymentStatus> {
        self.statuses.lock().get(deployment_id).copied()
    }

    /// Every write that actually landed, in the order it landed.
    pub fn applied_writes(&self) -> Vec<(String, DeploymentStatus)> {
        self.applied.lock().clone()
    }

    pub fn write_count(&self, deployment_id: &str) -> usize {
        self.applied
            .lock()
            .iter()
            .filter(|(id, _)| id == deployment_id)
            .count()
    }
}

#[async_trait]
impl DeploymentStore for MemoryDeploymentStore {
    async fn update_status(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
    ) -> Result<(), DeploymentStoreError> {
        let mut statuses = self.statuses.lock();
        let Some(current) = statuses.get_mut(deployment_id) else {
            debug!(deployment_id, "status write for unknown deployment");
            return Ok(());
        };

        if self.policy == StatusWritePolicy::Monotonic && !current.can_advance_to(status) {
            debug!(
                deployment_id,
                current = %current,
                requested = %status,
                "dropping status regression"
            );
            return Ok(());
        }

        *current = status;
        self.applied.lock().push((deployment_id.to_string(), status));
        Ok(())
    }
}
