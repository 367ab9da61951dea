//! SpecialResourceModule reconciler
//!
//! Handles: SpecialResourceModule

use tracing::info;

use super::Reconciler;
use crate::error::ControllerError;
use crate::queue::ResourceKey;

impl Reconciler {
    /// Reconciles a SpecialResourceModule by syncing its declared watches.
    pub async fn reconcile_module(&self, key: &ResourceKey) -> Result<(), ControllerError> {
        info!("Reconciling SpecialResourceModule {}", key);

        let module = match self.cluster.get_special_resource_module(key).await? {
            Some(module) if module.metadata.deletion_timestamp.is_none() => module,
            _ => {
                info!("SpecialResourceModule {} is gone, dropping its watches", key);
                self.path_watcher.remove_subscriber(key);
                return Ok(());
            }
        };

        let watched = self.path_watcher.reconcile_watches(&module)?;
        info!("SpecialResourceModule {} declares {} watch(es)", key, watched);

        self.cluster
            .patch_module_status(key, u32::try_from(watched).unwrap_or(u32::MAX))
            .await?;
        Ok(())
    }
}
