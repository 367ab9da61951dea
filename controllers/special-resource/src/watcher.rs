//! Kubernetes resource watchers.
//!
//! Every watched kind is streamed as `DynamicObject`s into an
//! [`EventPipeline`]. External objects followed by SpecialResourceModules
//! get one single-object watch each, started and stopped through
//! [`KubeWatchRegistry`]; their updates go to the path watcher.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::TryStreamExt;
use kube::api::{ApiResource, DynamicObject};
use kube::core::{GroupVersionKind, TypeMeta};
use kube::discovery::{self, Scope};
use kube::{Api, Client};
use kube_runtime::{WatchStreamExt, watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::ControllerError;
use crate::events::{EventPipeline, EventTracker};
use crate::path_watcher::{PathWatcher, WatchRegistry, WatchedResource};
use crate::queue::{ReconcileRequest, WorkQueue};

/// Kinds created from charts on every cluster
pub fn owned_kinds() -> Vec<GroupVersionKind> {
    vec![
        GroupVersionKind::gvk("", "v1", "Pod"),
        GroupVersionKind::gvk("apps", "v1", "DaemonSet"),
        GroupVersionKind::gvk("apps", "v1", "Deployment"),
        GroupVersionKind::gvk("", "v1", "ConfigMap"),
        GroupVersionKind::gvk("", "v1", "ServiceAccount"),
        GroupVersionKind::gvk("", "v1", "Secret"),
        GroupVersionKind::gvk("rbac.authorization.k8s.io", "v1", "Role"),
        GroupVersionKind::gvk("rbac.authorization.k8s.io", "v1", "RoleBinding"),
        GroupVersionKind::gvk("rbac.authorization.k8s.io", "v1", "ClusterRole"),
        GroupVersionKind::gvk("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding"),
        GroupVersionKind::gvk("storage.k8s.io", "v1", "CSIDriver"),
    ]
}

/// Additional kinds created from charts on OpenShift
pub fn openshift_owned_kinds() -> Vec<GroupVersionKind> {
    vec![
        GroupVersionKind::gvk("build.openshift.io", "v1", "BuildConfig"),
        GroupVersionKind::gvk("image.openshift.io", "v1", "ImageStream"),
        GroupVersionKind::gvk("security.openshift.io", "v1", "SecurityContextConstraints"),
    ]
}

/// List results may omit apiVersion and kind
fn fill_types(object: &mut DynamicObject, resource: &ApiResource) {
    if object.types.as_ref().is_none_or(|t| t.kind.is_empty()) {
        object.types = Some(TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        });
    }
}

/// Resolve a kind and build an API for it, scoped to `namespace` when the
/// kind is namespaced
async fn dynamic_api(
    client: &Client,
    gvk: &GroupVersionKind,
    namespace: Option<&str>,
) -> Result<(Api<DynamicObject>, ApiResource), ControllerError> {
    let (resource, capabilities) = discovery::pinned_kind(client, gvk).await?;
    let api = match (capabilities.scope, namespace) {
        (Scope::Namespaced, Some(ns)) if !ns.is_empty() => {
            Api::namespaced_with(client.clone(), ns, &resource)
        }
        _ => Api::all_with(client.clone(), &resource),
    };
    Ok((api, resource))
}

/// Watches Kubernetes resources for changes.
#[derive(Clone)]
pub struct Watcher {
    client: Client,
    watch_namespace: Option<String>,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("watch_namespace", &self.watch_namespace)
            .finish_non_exhaustive()
    }
}

impl Watcher {
    /// Creates a new watcher instance.
    pub fn new(client: Client, watch_namespace: Option<String>) -> Self {
        Self {
            client,
            watch_namespace,
        }
    }

    /// Streams one kind into `pipeline` until the stream fails.
    pub async fn watch_kind(
        &self,
        gvk: GroupVersionKind,
        pipeline: Arc<EventPipeline>,
    ) -> Result<(), ControllerError> {
        info!("Starting {} watcher", gvk.kind);
        let (api, resource) = dynamic_api(&self.client, &gvk, self.watch_namespace.as_deref()).await?;

        let mut tracker = EventTracker::new(gvk.clone());
        let mut stream = Box::pin(watcher(api, watcher::Config::default()));

        while let Some(event) = stream
            .try_next()
            .await
            .map_err(|e| ControllerError::Watch(format!("Watcher stream error: {}", e)))?
        {
            let event = event.modify(|object| fill_types(object, &resource));
            for change in tracker.observe(event) {
                pipeline.handle(change).await;
            }
        }

        Ok(())
    }

    /// Streams several kinds into the same pipeline; fails when any stream fails.
    pub async fn watch_kinds(
        &self,
        kinds: Vec<GroupVersionKind>,
        pipeline: Arc<EventPipeline>,
    ) -> Result<(), ControllerError> {
        let watches = kinds
            .into_iter()
            .map(|gvk| self.watch_kind(gvk, pipeline.clone()));
        futures::future::try_join_all(watches).await?;
        Ok(())
    }
}

/// [`WatchRegistry`] running one single-object watch task per resource
pub struct KubeWatchRegistry {
    client: Client,
    sender: mpsc::UnboundedSender<DynamicObject>,
    tasks: Mutex<HashMap<WatchedResource, JoinHandle<()>>>,
}

impl std::fmt::Debug for KubeWatchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeWatchRegistry").finish_non_exhaustive()
    }
}

impl KubeWatchRegistry {
    /// Objects seen by the watches are sent to `sender`
    pub fn new(client: Client, sender: mpsc::UnboundedSender<DynamicObject>) -> Self {
        Self {
            client,
            sender,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<WatchedResource, JoinHandle<()>>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl WatchRegistry for KubeWatchRegistry {
    fn register(&self, resource: &WatchedResource) -> Result<(), ControllerError> {
        let gvk = resource.gvk()?;
        let task = tokio::spawn(watch_object(
            self.client.clone(),
            gvk,
            resource.clone(),
            self.sender.clone(),
        ));
        if let Some(previous) = self.lock().insert(resource.clone(), task) {
            previous.abort();
        }
        Ok(())
    }

    fn deregister(&self, resource: &WatchedResource) {
        if let Some(task) = self.lock().remove(resource) {
            task.abort();
        }
    }
}

async fn watch_object(
    client: Client,
    gvk: GroupVersionKind,
    resource: WatchedResource,
    sender: mpsc::UnboundedSender<DynamicObject>,
) {
    info!("Watching {}", resource);
    if let Err(e) = forward_object(&client, &gvk, &resource, &sender).await {
        error!("Watch of {} stopped: {}", resource, e);
    }
}

async fn forward_object(
    client: &Client,
    gvk: &GroupVersionKind,
    resource: &WatchedResource,
    sender: &mpsc::UnboundedSender<DynamicObject>,
) -> Result<(), ControllerError> {
    let (api, api_resource) = dynamic_api(client, gvk, Some(&resource.namespace)).await?;
    let config = watcher::Config::default().fields(&format!("metadata.name={}", resource.name));
    let mut stream = Box::pin(watcher(api, config).applied_objects());

    while let Some(mut object) = stream
        .try_next()
        .await
        .map_err(|e| ControllerError::Watch(format!("Watcher stream error: {}", e)))?
    {
        fill_types(&mut object, &api_resource);
        if sender.send(object).is_err() {
            debug!("Dispatcher gone, stopping watch of {}", resource);
            break;
        }
    }
    Ok(())
}

/// Feeds objects from the single-object watches to the path watcher and
/// queues the modules whose watched values changed.
pub async fn dispatch_watched_objects(
    mut receiver: mpsc::UnboundedReceiver<DynamicObject>,
    path_watcher: Arc<PathWatcher>,
    queue: WorkQueue,
) -> Result<(), ControllerError> {
    while let Some(object) = receiver.recv().await {
        let modules = path_watcher.on_object_event(&object);
        queue.enqueue_all(modules.into_iter().map(ReconcileRequest::Module));
    }
    Err(ControllerError::Watch("watched object channel closed".to_string()))
}
