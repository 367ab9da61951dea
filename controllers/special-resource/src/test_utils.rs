//! Test utilities for unit testing reconcilers
//!
//! In-memory stand-ins for the cluster, the watch registry and the metrics
//! sink, plus builders for the objects the tests need.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use crds::*;
use helmer::{Chart, ChartFile, ChartMetadata, MockHelmer};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
use kube::ResourceExt;
use kube::api::{ApiResource, DynamicObject};
use kube::core::GroupVersionKind;

use crate::cluster::{ClusterClient, ClusterError};
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::path_watcher::{PathWatcher, WatchRegistry, WatchedResource};
use crate::queue::ResourceKey;
use crate::reconciler::Reconciler;
use crate::status::ClusterStatusUpdater;

fn matches_labels(labels: &BTreeMap<String, String>, selector: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// In-memory [`ClusterClient`]
#[derive(Default)]
pub struct MockClusterClient {
    special_resources: Mutex<BTreeMap<String, SpecialResource>>,
    modules: Mutex<BTreeMap<String, SpecialResourceModule>>,
    module_status: Mutex<BTreeMap<String, u32>>,
    nodes: Mutex<Vec<Node>>,
    pods: Mutex<Vec<Pod>>,
    namespaces: Mutex<BTreeSet<String>>,
    config_maps: Mutex<BTreeMap<(String, String), BTreeMap<String, String>>>,
    conflicts_left: Mutex<usize>,
    delete_on_conflict: Mutex<bool>,
    status_patch_attempts: Mutex<usize>,
    forbid_namespaces: Mutex<bool>,
    openshift: Mutex<bool>,
}

impl MockClusterClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_special_resource(&self, mut resource: SpecialResource) {
        if resource.metadata.resource_version.is_none() {
            resource.metadata.resource_version = Some("1".to_string());
        }
        self.special_resources
            .lock()
            .unwrap()
            .insert(resource.name_any(), resource);
    }

    pub fn special_resource(&self, key: &ResourceKey) -> Option<SpecialResource> {
        self.special_resources.lock().unwrap().get(&key.name).cloned()
    }

    pub fn remove_special_resource(&self, name: &str) {
        self.special_resources.lock().unwrap().remove(name);
    }

    pub fn add_module(&self, module: SpecialResourceModule) {
        self.modules.lock().unwrap().insert(module.name_any(), module);
    }

    pub fn remove_module(&self, name: &str) {
        self.modules.lock().unwrap().remove(name);
    }

    pub fn module_watched(&self, name: &str) -> Option<u32> {
        self.module_status.lock().unwrap().get(name).copied()
    }

    pub fn add_node(&self, node: Node) {
        self.nodes.lock().unwrap().push(node);
    }

    pub fn node_labels(&self, name: &str) -> BTreeMap<String, String> {
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .find(|n| n.name_any() == name)
            .map(|n| n.labels().clone())
            .unwrap_or_default()
    }

    pub fn add_pod(&self, pod: Pod) {
        self.pods.lock().unwrap().push(pod);
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.namespaces.lock().unwrap().contains(name)
    }

    pub fn config_map_data(&self, namespace: &str, name: &str) -> BTreeMap<String, String> {
        self.config_maps
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// The next `count` status writes fail with a conflict
    pub fn fail_next_status_patches_with_conflict(&self, count: usize) {
        *self.conflicts_left.lock().unwrap() = count;
    }

    /// Mark the stored SpecialResource as deleting when an injected conflict fires
    pub fn delete_on_conflict(&self) {
        *self.delete_on_conflict.lock().unwrap() = true;
    }

    pub fn status_patch_attempts(&self) -> usize {
        *self.status_patch_attempts.lock().unwrap()
    }

    pub fn forbid_namespaces(&self) {
        *self.forbid_namespaces.lock().unwrap() = true;
    }

    pub fn set_openshift(&self, openshift: bool) {
        *self.openshift.lock().unwrap() = openshift;
    }
}

#[async_trait]
impl ClusterClient for MockClusterClient {
    async fn get_special_resource(&self, key: &ResourceKey) -> Result<Option<SpecialResource>, ClusterError> {
        Ok(self.special_resource(key))
    }

    async fn patch_special_resource_status(&self, resource: &SpecialResource) -> Result<(), ClusterError> {
        *self.status_patch_attempts.lock().unwrap() += 1;
        {
            let mut conflicts = self.conflicts_left.lock().unwrap();
            if *conflicts > 0 {
                *conflicts -= 1;
                if *self.delete_on_conflict.lock().unwrap() {
                    if let Some(stored) = self.special_resources.lock().unwrap().get_mut(&resource.name_any()) {
                        let deleted: Time = serde_json::from_value(serde_json::json!("2024-01-01T00:00:00Z")).unwrap();
                        stored.metadata.deletion_timestamp = Some(deleted);
                    }
                }
                return Err(ClusterError::Conflict(resource.name_any()));
            }
        }

        let mut stored = self.special_resources.lock().unwrap();
        let current = stored
            .get_mut(&resource.name_any())
            .ok_or_else(|| ClusterError::NotFound(resource.name_any()))?;
        if current.metadata.resource_version != resource.metadata.resource_version {
            return Err(ClusterError::Conflict(resource.name_any()));
        }
        let next: u64 = current
            .metadata
            .resource_version
            .as_deref()
            .and_then(|rv| rv.parse().ok())
            .unwrap_or(0)
            + 1;
        current.status = resource.status.clone();
        current.metadata.resource_version = Some(next.to_string());
        Ok(())
    }

    async fn get_special_resource_module(
        &self,
        key: &ResourceKey,
    ) -> Result<Option<SpecialResourceModule>, ClusterError> {
        Ok(self.modules.lock().unwrap().get(&key.name).cloned())
    }

    async fn patch_module_status(&self, key: &ResourceKey, watched: u32) -> Result<(), ClusterError> {
        self.module_status.lock().unwrap().insert(key.name.clone(), watched);
        Ok(())
    }

    async fn list_nodes(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Node>, ClusterError> {
        Ok(self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .filter(|n| matches_labels(n.labels(), selector))
            .cloned()
            .collect())
    }

    async fn label_node(&self, node: &str, key: &str, value: &str) -> Result<(), ClusterError> {
        let mut nodes = self.nodes.lock().unwrap();
        let found = nodes
            .iter_mut()
            .find(|n| n.name_any() == node)
            .ok_or_else(|| ClusterError::NotFound(node.to_string()))?;
        found.labels_mut().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn ensure_namespace(&self, name: &str, _owner: &OwnerReference) -> Result<(), ClusterError> {
        if *self.forbid_namespaces.lock().unwrap() {
            return Err(ClusterError::Forbidden(format!("namespaces \"{}\" is forbidden", name)));
        }
        self.namespaces.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        match_labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, ClusterError> {
        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.namespace().as_deref() == Some(namespace) && matches_labels(p.labels(), match_labels))
            .cloned()
            .collect())
    }

    async fn upsert_config_map_entry(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), ClusterError> {
        self.config_maps
            .lock()
            .unwrap()
            .entry((namespace.to_string(), name.to_string()))
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_config_map_entry(&self, namespace: &str, name: &str, key: &str) -> Result<(), ClusterError> {
        if let Some(data) = self
            .config_maps
            .lock()
            .unwrap()
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            data.remove(key);
        }
        Ok(())
    }

    async fn is_openshift(&self) -> Result<bool, ClusterError> {
        Ok(*self.openshift.lock().unwrap())
    }
}

/// [`WatchRegistry`] that records calls
#[derive(Default)]
pub struct MockWatchRegistry {
    registered: Mutex<Vec<WatchedResource>>,
    deregistered: Mutex<Vec<WatchedResource>>,
    fail: Mutex<bool>,
}

impl MockWatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registered(&self) -> Vec<WatchedResource> {
        self.registered.lock().unwrap().clone()
    }

    pub fn deregistered(&self) -> Vec<WatchedResource> {
        self.deregistered.lock().unwrap().clone()
    }

    pub fn fail_registrations(&self) {
        *self.fail.lock().unwrap() = true;
    }
}

impl WatchRegistry for MockWatchRegistry {
    fn register(&self, resource: &WatchedResource) -> Result<(), ControllerError> {
        if *self.fail.lock().unwrap() {
            return Err(ControllerError::Watch(format!("cannot watch {}", resource)));
        }
        self.registered.lock().unwrap().push(resource.clone());
        Ok(())
    }

    fn deregister(&self, resource: &WatchedResource) {
        self.deregistered.lock().unwrap().push(resource.clone());
    }
}

/// [`Metrics`] sink that records every value
#[derive(Default)]
pub struct RecordingMetrics {
    values: Mutex<Vec<(String, String, i64)>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn values(&self) -> Vec<(String, String, i64)> {
        self.values.lock().unwrap().clone()
    }
}

impl Metrics for RecordingMetrics {
    fn set_completed_state(&self, resource: &str, state: &str, value: i64) {
        self.values
            .lock()
            .unwrap()
            .push((resource.to_string(), state.to_string(), value));
    }
}

/// Reconciler wired to in-memory collaborators
pub fn create_test_reconciler(
    cluster: Arc<MockClusterClient>,
    helmer: Arc<MockHelmer>,
    registry: Arc<MockWatchRegistry>,
) -> Reconciler {
    let status = Arc::new(ClusterStatusUpdater::new(cluster.clone()));
    Reconciler::new(
        cluster,
        helmer,
        status,
        Arc::new(RecordingMetrics::new()),
        Arc::new(PathWatcher::new(registry)),
        "registry/dtk:latest",
    )
}

pub const WORKER_SELECTOR: (&str, &str) = ("node-role.kubernetes.io/worker", "");

pub fn special_resource_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk(API_GROUP, API_VERSION, "SpecialResource")
}

pub fn daemonset_gvk() -> GroupVersionKind {
    GroupVersionKind::gvk("apps", "v1", "DaemonSet")
}

/// Helper to create test SpecialResource CRD
pub fn create_test_special_resource(name: &str) -> SpecialResource {
    SpecialResource {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            uid: Some(format!("uid-{}", name)),
            generation: Some(1),
            ..Default::default()
        },
        spec: SpecialResourceSpec {
            namespace: String::new(),
            chart: ChartReference::new(
                "simple-kmod",
                "0.0.1",
                RepositoryReference {
                    name: "chart".to_string(),
                    url: "file:///charts".to_string(),
                },
            ),
            set: serde_json::json!({ "kmodNames": ["simple-kmod"] }),
            node_selector: BTreeMap::from([(WORKER_SELECTOR.0.to_string(), WORKER_SELECTOR.1.to_string())]),
            debug: false,
        },
        status: None,
    }
}

/// Helper to create test SpecialResourceModule CRD
pub fn create_test_module(name: &str, watches: Vec<SpecialResourceModuleWatch>) -> SpecialResourceModule {
    SpecialResourceModule {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            uid: Some(format!("uid-{}", name)),
            ..Default::default()
        },
        spec: SpecialResourceModuleSpec {
            namespace: name.to_string(),
            chart: ChartReference::new("ping-pong", "0.0.1", RepositoryReference::default()),
            set: serde_json::Value::Null,
            watch: watches,
        },
        status: None,
    }
}

pub fn create_test_watch(kind: &str, name: &str, path: &str) -> SpecialResourceModuleWatch {
    SpecialResourceModuleWatch {
        api_version: "config.openshift.io/v1".to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        namespace: None,
        path: path.to_string(),
    }
}

/// Worker node labelled the way Node Feature Discovery labels it
pub fn create_test_node(
    name: &str,
    kernel: &str,
    os_id: &str,
    version_id: &str,
    rhel_version: Option<&str>,
) -> Node {
    let mut labels = BTreeMap::from([
        (WORKER_SELECTOR.0.to_string(), WORKER_SELECTOR.1.to_string()),
        ("feature.node.kubernetes.io/system-os_release.ID".to_string(), os_id.to_string()),
        (
            "feature.node.kubernetes.io/system-os_release.VERSION_ID".to_string(),
            version_id.to_string(),
        ),
    ]);
    if !kernel.is_empty() {
        labels.insert(helmer::KERNEL_VERSION_NODE_LABEL.to_string(), kernel.to_string());
    }
    if let Some(rhel) = rhel_version {
        labels.insert(
            "feature.node.kubernetes.io/system-os_release.RHEL_VERSION".to_string(),
            rhel.to_string(),
        );
    }
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn create_test_pod(namespace: &str, name: &str, labels: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn create_test_dynamic_object(gvk: &GroupVersionKind, name: &str, namespace: Option<&str>) -> DynamicObject {
    let object = DynamicObject::new(name, &ApiResource::from_gvk(gvk));
    match namespace {
        Some(ns) => object.within(ns),
        None => object,
    }
}

/// Chart with the given (file name, contents) templates
pub fn create_test_chart(templates: &[(&str, &str)]) -> Chart {
    Chart {
        metadata: ChartMetadata {
            name: "simple-kmod".to_string(),
            version: "0.0.1".to_string(),
            description: None,
        },
        templates: templates
            .iter()
            .map(|(name, data)| ChartFile::new(*name, *data))
            .collect(),
        values: serde_json::json!({ "kmodNames": ["default"] }),
    }
}

/// Template text marked kernel-affine
pub const KERNEL_AFFINE_TEMPLATE: &str = r#"apiVersion: apps/v1
kind: DaemonSet
metadata:
  name: driver-container
  annotations:
    specialresource.openshift.io/kernel-affine: "true"
"#;

/// Template text without the kernel-affine annotation
pub const PLAIN_TEMPLATE: &str = r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: config
"#;
