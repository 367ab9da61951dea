//! Reconciliation logic for SpecialResource CRDs.
//!
//! This module is organized by resource:
//! - `special_resource`: namespace, kernel discovery and chart states
//! - `module`: external object watches of SpecialResourceModules

pub mod module;
pub mod special_resource;

use std::sync::Arc;

use async_trait::async_trait;
use helmer::HelmerTrait;

use crate::cluster::ClusterClient;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::path_watcher::PathWatcher;
use crate::queue::{ReconcileRequest, RequestHandler};
use crate::states::StateEngine;
use crate::status::StatusUpdater;

/// Reconciles SpecialResources and SpecialResourceModules.
pub struct Reconciler {
    pub(crate) cluster: Arc<dyn ClusterClient>,
    pub(crate) helmer: Arc<dyn HelmerTrait>,
    pub(crate) status: Arc<dyn StatusUpdater>,
    pub(crate) engine: StateEngine,
    pub(crate) path_watcher: Arc<PathWatcher>,
    /// Exposed to templates as `driverToolkitImage`
    driver_toolkit_image: String,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("driver_toolkit_image", &self.driver_toolkit_image)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        helmer: Arc<dyn HelmerTrait>,
        status: Arc<dyn StatusUpdater>,
        metrics: Arc<dyn Metrics>,
        path_watcher: Arc<PathWatcher>,
        driver_toolkit_image: impl Into<String>,
    ) -> Self {
        let engine = StateEngine::new(helmer.clone(), status.clone(), metrics, cluster.clone());
        Self {
            cluster,
            helmer,
            status,
            engine,
            path_watcher,
            driver_toolkit_image: driver_toolkit_image.into(),
        }
    }
}

#[async_trait]
impl RequestHandler for Reconciler {
    async fn handle(&self, request: &ReconcileRequest) -> Result<(), ControllerError> {
        match request {
            ReconcileRequest::SpecialResource(key) => self.reconcile_special_resource(key).await,
            ReconcileRequest::Module(key) => self.reconcile_module(key).await,
        }
    }
}
