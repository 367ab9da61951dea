//! SpecialResource reconciler
//!
//! Handles: SpecialResource

use crds::SpecialResource;
use tracing::{debug, error, info, warn};

use super::Reconciler;
use crate::cluster::ClusterError;
use crate::error::{ControllerError, StatusUpdateError};
use crate::kernel::cluster_kernel_map;
use crate::queue::ResourceKey;
use crate::render::platform_name;
use crate::states::owner_reference;
use crate::status::{REASON_RECONCILE_FAILED, REASON_RECONCILED};

/// Display state after a successful reconcile
pub const DISPLAY_READY: &str = "Ready";
/// Display state after a failed reconcile
pub const DISPLAY_ERRORED: &str = "Errored";

impl Reconciler {
    /// Reconciles a SpecialResource.
    ///
    /// Missing and deleting resources are left alone, including ones that
    /// disappear or start deleting while a status write is in flight. Any
    /// other failure is written to the Errored condition and returned so the
    /// request is retried.
    pub async fn reconcile_special_resource(&self, key: &ResourceKey) -> Result<(), ControllerError> {
        info!("Reconciling SpecialResource {}", key);

        let Some(resource) = self.cluster.get_special_resource(key).await? else {
            info!("SpecialResource {} not found, nothing to do", key);
            return Ok(());
        };
        if resource.is_deleting() {
            info!("SpecialResource {} is being deleted, skipping", key);
            return Ok(());
        }

        match self.apply_special_resource(&resource).await {
            Ok(()) => {
                let ready = self
                    .status
                    .set_as_ready(&resource, REASON_RECONCILED, "Reconciled successfully")
                    .await;
                match ready {
                    Err(e) if resource_went_away(&e) => {
                        debug!("Abandoning reconcile of SpecialResource {}: {}", key, e);
                        return Ok(());
                    }
                    other => other?,
                }
                self.status.update_display_state(&resource, DISPLAY_READY).await;
                info!("SpecialResource {} reconciled", key);
                Ok(())
            }
            Err(e) if resource_went_away(&e) => {
                debug!("Abandoning reconcile of SpecialResource {}: {}", key, e);
                Ok(())
            }
            Err(e) => {
                error!("Failed to reconcile SpecialResource {}: {}", key, e);
                if let Err(status_err) = self
                    .status
                    .set_as_errored(&resource, REASON_RECONCILE_FAILED, &e.to_string())
                    .await
                {
                    warn!("Failed to mark SpecialResource {} as errored: {}", key, status_err);
                }
                self.status.update_display_state(&resource, DISPLAY_ERRORED).await;
                Err(e)
            }
        }
    }

    async fn apply_special_resource(&self, resource: &SpecialResource) -> Result<(), ControllerError> {
        let owner = owner_reference(resource)?;

        let namespace = resource.target_namespace();
        self.cluster
            .ensure_namespace(&namespace, &owner)
            .await
            .map_err(|e| match e {
                ClusterError::Forbidden(message) => ControllerError::Forbidden(message),
                other => other.into(),
            })?;

        let nodes = self.cluster.list_nodes(&resource.spec.node_selector).await?;
        let kernel_map = cluster_kernel_map(&nodes, &self.driver_toolkit_image);
        info!(
            "SpecialResource {} targets {} node(s) running {} kernel version(s)",
            resource.metadata.name.as_deref().unwrap_or_default(),
            nodes.len(),
            kernel_map.len()
        );

        let chart = self.helmer.load_chart(&resource.spec.chart).await?;
        let platform = platform_name(self.cluster.is_openshift().await?);

        self.engine
            .reconcile_states(resource, &chart, &resource.spec.set, &kernel_map, platform)
            .await
    }
}

/// A status write found the resource gone or being deleted
fn resource_went_away(error: &ControllerError) -> bool {
    matches!(
        error,
        ControllerError::StatusUpdate(StatusUpdateError::MarkedForDeletion(_) | StatusUpdateError::NotFound(_))
    )
}
