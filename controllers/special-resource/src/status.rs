//! Status condition updates for SpecialResources.
//!
//! Every write starts from a fresh copy of the resource and carries its
//! resourceVersion. A write that loses a race is not retried in a loop: the
//! resource is fetched once more to tell a deletion apart from a plain
//! conflict, and the update is then abandoned. The next reconcile writes the
//! status again.

use std::sync::Arc;

use async_trait::async_trait;
use crds::{ConditionState, SpecialResource};
use tracing::{debug, error};

use crate::cluster::{ClusterClient, ClusterError};
use crate::error::{ControllerError, StatusUpdateError};
use crate::queue::ResourceKey;

/// Reason used while a stateful template is being applied
pub const REASON_HANDLING_STATE: &str = "HandlingState";
/// Reason used once every state was applied
pub const REASON_RECONCILED: &str = "Reconciled";
/// Reason used when a reconcile failed
pub const REASON_RECONCILE_FAILED: &str = "ReconcileFailed";

/// Writes the Ready / Progressing / Errored conditions of a SpecialResource
#[async_trait]
pub trait StatusUpdater: Send + Sync {
    async fn set_as_ready(&self, resource: &SpecialResource, reason: &str, message: &str)
    -> Result<(), ControllerError>;

    async fn set_as_progressing(
        &self,
        resource: &SpecialResource,
        reason: &str,
        message: &str,
    ) -> Result<(), ControllerError>;

    async fn set_as_errored(
        &self,
        resource: &SpecialResource,
        reason: &str,
        message: &str,
    ) -> Result<(), ControllerError>;

    /// Best effort: failures are logged, never returned
    async fn update_display_state(&self, resource: &SpecialResource, state: &str);
}

/// [`StatusUpdater`] writing through a [`ClusterClient`]
pub struct ClusterStatusUpdater {
    cluster: Arc<dyn ClusterClient>,
}

impl std::fmt::Debug for ClusterStatusUpdater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterStatusUpdater").finish_non_exhaustive()
    }
}

impl ClusterStatusUpdater {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self { cluster }
    }

    async fn fetch(&self, key: &ResourceKey) -> Result<SpecialResource, ControllerError> {
        self.cluster
            .get_special_resource(key)
            .await?
            .ok_or_else(|| StatusUpdateError::NotFound(key.to_string()).into())
    }

    /// Refetch after a lost race and decide how to give up
    async fn resolve_conflict(&self, key: &ResourceKey) -> ControllerError {
        match self.cluster.get_special_resource(key).await {
            Ok(None) => StatusUpdateError::NotFound(key.to_string()).into(),
            Ok(Some(latest)) if latest.is_deleting() => {
                debug!("SpecialResource {} is marked for deletion, dropping status update", key);
                StatusUpdateError::MarkedForDeletion(key.to_string()).into()
            }
            Ok(Some(_)) => StatusUpdateError::Conflict(key.to_string()).into(),
            Err(e) => e.into(),
        }
    }

    async fn write(&self, resource: &SpecialResource, state: ConditionState) -> Result<(), ControllerError> {
        let key = ResourceKey::from_resource(resource);
        let mut latest = self.fetch(&key).await?;

        let status = latest.status.get_or_insert_with(Default::default);
        state.apply_to(&mut status.conditions);

        match self.cluster.patch_special_resource_status(&latest).await {
            Ok(()) => {
                debug!("SpecialResource {} is now {:?}", key, state.kind);
                Ok(())
            }
            Err(ClusterError::Conflict(_)) => Err(self.resolve_conflict(&key).await),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StatusUpdater for ClusterStatusUpdater {
    async fn set_as_ready(
        &self,
        resource: &SpecialResource,
        reason: &str,
        message: &str,
    ) -> Result<(), ControllerError> {
        self.write(resource, ConditionState::ready(reason, message)).await
    }

    async fn set_as_progressing(
        &self,
        resource: &SpecialResource,
        reason: &str,
        message: &str,
    ) -> Result<(), ControllerError> {
        self.write(resource, ConditionState::progressing(reason, message)).await
    }

    async fn set_as_errored(
        &self,
        resource: &SpecialResource,
        reason: &str,
        message: &str,
    ) -> Result<(), ControllerError> {
        self.write(resource, ConditionState::errored(reason, message)).await
    }

    async fn update_display_state(&self, resource: &SpecialResource, state: &str) {
        let key = ResourceKey::from_resource(resource);
        let mut latest = match self.fetch(&key).await {
            Ok(latest) => latest,
            Err(e) => {
                error!("Failed to fetch SpecialResource {} for display state: {}", key, e);
                return;
            }
        };

        let status = latest.status.get_or_insert_with(Default::default);
        if status.state == state {
            return;
        }
        status.state = state.to_string();

        if let Err(e) = self.cluster.patch_special_resource_status(&latest).await {
            error!("Failed to update display state of SpecialResource {}: {}", key, e);
        }
    }
}
