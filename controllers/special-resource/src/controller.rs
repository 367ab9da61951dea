//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the cluster
//! client, the Helmer, the reconcile worker and the watchers of the
//! Special Resource Controller together.

use std::sync::Arc;

use crds::{API_GROUP, API_VERSION};
use helmer::KubeHelmer;
use kube::Client;
use kube::core::GroupVersionKind;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cluster::{ClusterClient, KubeClusterClient};
use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::events::EventPipeline;
use crate::filter::EventFilter;
use crate::lifecycle::Lifecycle;
use crate::metrics::{self, PrometheusMetrics};
use crate::path_watcher::PathWatcher;
use crate::queue::{ReconcileRequest, WorkQueue, Worker};
use crate::reconciler::Reconciler;
use crate::status::ClusterStatusUpdater;
use crate::storage::Storage;
use crate::watcher::{KubeWatchRegistry, Watcher, dispatch_watched_objects, openshift_owned_kinds, owned_kinds};

/// Ownership label key set by the Helmer for objects of an owner kind
fn owned_label(kind: &str) -> String {
    format!("{}.openshift.io/owned", kind.to_lowercase())
}

/// Main controller for special resources.
pub struct Controller {
    worker: JoinHandle<Result<(), ControllerError>>,
    special_resource_watcher: JoinHandle<Result<(), ControllerError>>,
    module_watcher: JoinHandle<Result<(), ControllerError>>,
    owned_watcher: JoinHandle<Result<(), ControllerError>>,
    object_dispatcher: JoinHandle<Result<(), ControllerError>>,
    metrics_server: JoinHandle<Result<(), ControllerError>>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller").finish_non_exhaustive()
    }
}

impl Controller {
    /// Creates a new controller instance and starts its background tasks.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing Special Resource Controller");

        let metrics_addr = config.metrics_socket_addr()?;

        // Create Kubernetes client
        let kube_client = Client::try_default().await?;

        let cluster: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(kube_client.clone()));
        let helmer = Arc::new(KubeHelmer::new(kube_client.clone(), config.charts_dir.clone()));
        let metrics = Arc::new(PrometheusMetrics::new()?);
        let status = Arc::new(ClusterStatusUpdater::new(cluster.clone()));

        let openshift = cluster.is_openshift().await?;
        info!("Running on {}", if openshift { "OpenShift" } else { "Kubernetes" });

        let (queue, receiver) = WorkQueue::new();

        // Single-object watches of SpecialResourceModules feed the path watcher
        let (object_sender, object_receiver) = mpsc::unbounded_channel();
        let registry = Arc::new(KubeWatchRegistry::new(kube_client.clone(), object_sender));
        let path_watcher = Arc::new(PathWatcher::new(registry));

        let reconciler = Arc::new(Reconciler::new(
            cluster.clone(),
            helmer,
            status,
            metrics.clone(),
            path_watcher.clone(),
            config.driver_toolkit_image(),
        ));

        let storage = Storage::new(
            cluster.clone(),
            config.operator_namespace.clone(),
            config.lifecycle_configmap.clone(),
        );
        let lifecycle = Lifecycle::new(cluster.clone(), storage);

        let special_resource_gvk = GroupVersionKind::gvk(API_GROUP, API_VERSION, "SpecialResource");
        let module_gvk = GroupVersionKind::gvk(API_GROUP, API_VERSION, "SpecialResourceModule");

        let special_resource_pipeline = Arc::new(EventPipeline::new(
            EventFilter::new(special_resource_gvk.clone(), owned_label(&special_resource_gvk.kind)),
            lifecycle.clone(),
            queue.clone(),
            ReconcileRequest::SpecialResource,
        ));
        let module_pipeline = Arc::new(EventPipeline::new(
            EventFilter::new(module_gvk.clone(), owned_label(&module_gvk.kind)),
            lifecycle,
            queue.clone(),
            ReconcileRequest::Module,
        ));

        let mut kinds = owned_kinds();
        if openshift {
            kinds.extend(openshift_owned_kinds());
        }

        let watcher_instance = Watcher::new(kube_client, config.watch_namespace.clone());

        // Start all background tasks
        let worker = {
            let worker = Worker::new(queue.clone(), receiver, reconciler, config.max_backoff_seconds);
            tokio::spawn(async move { worker.run().await })
        };

        let special_resource_watcher = {
            let watcher = watcher_instance.clone();
            let pipeline = special_resource_pipeline.clone();
            tokio::spawn(async move { watcher.watch_kind(special_resource_gvk, pipeline).await })
        };

        let module_watcher = {
            let watcher = watcher_instance.clone();
            tokio::spawn(async move { watcher.watch_kind(module_gvk, module_pipeline).await })
        };

        let owned_watcher = {
            let watcher = watcher_instance.clone();
            tokio::spawn(async move { watcher.watch_kinds(kinds, special_resource_pipeline).await })
        };

        let object_dispatcher = tokio::spawn(dispatch_watched_objects(object_receiver, path_watcher, queue));

        let metrics_server = tokio::spawn(metrics::serve(metrics_addr, metrics));

        Ok(Self {
            worker,
            special_resource_watcher,
            module_watcher,
            owned_watcher,
            object_dispatcher,
            metrics_server,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Special Resource Controller running");

        // Wait for any task to exit (they should run forever)
        tokio::select! {
            result = &mut self.worker => {
                result.map_err(|e| ControllerError::Watch(format!("Reconcile worker panicked: {}", e)))??;
            }
            result = &mut self.special_resource_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("SpecialResource watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("SpecialResource watcher error: {}", e)))?;
            }
            result = &mut self.module_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("SpecialResourceModule watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("SpecialResourceModule watcher error: {}", e)))?;
            }
            result = &mut self.owned_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("Owned object watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("Owned object watcher error: {}", e)))?;
            }
            result = &mut self.object_dispatcher => {
                result.map_err(|e| ControllerError::Watch(format!("Watched object dispatcher panicked: {}", e)))??;
            }
            result = &mut self.metrics_server => {
                result.map_err(|e| ControllerError::Watch(format!("Metrics server panicked: {}", e)))??;
            }
        }

        Ok(())
    }
}
