//! Cluster access for the controller.
//!
//! Every Kubernetes call the reconcilers make goes through [`ClusterClient`],
//! so reconcile logic can be unit tested against the in-memory mock in
//! `test_utils`. [`KubeClusterClient`] is the production implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use crds::{SpecialResource, SpecialResourceModule};
use helmer::FIELD_MANAGER;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::queue::ResourceKey;

/// API group only present on OpenShift clusters
const OPENSHIFT_CONFIG_GROUP: &str = "config.openshift.io";

/// Errors from cluster calls, with the status codes the reconcilers branch on
/// pulled out of the generic API error.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("Kubernetes error: {0}")]
    Kube(#[source] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound(ae.message.clone()),
            kube::Error::Api(ae) if ae.code == 409 => ClusterError::Conflict(ae.message.clone()),
            kube::Error::Api(ae) if ae.code == 403 => ClusterError::Forbidden(ae.message.clone()),
            _ => ClusterError::Kube(err),
        }
    }
}

/// Cluster operations used by the reconcilers
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_special_resource(&self, key: &ResourceKey) -> Result<Option<SpecialResource>, ClusterError>;

    /// Write `resource.status`, guarded by `resource`'s resourceVersion.
    /// A stale resourceVersion yields [`ClusterError::Conflict`].
    async fn patch_special_resource_status(&self, resource: &SpecialResource) -> Result<(), ClusterError>;

    async fn get_special_resource_module(
        &self,
        key: &ResourceKey,
    ) -> Result<Option<SpecialResourceModule>, ClusterError>;

    async fn patch_module_status(&self, key: &ResourceKey, watched: u32) -> Result<(), ClusterError>;

    /// Nodes whose labels match every entry of `selector`
    async fn list_nodes(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Node>, ClusterError>;

    async fn label_node(&self, node: &str, key: &str, value: &str) -> Result<(), ClusterError>;

    /// Create the namespace if it does not exist yet
    async fn ensure_namespace(&self, name: &str, owner: &OwnerReference) -> Result<(), ClusterError>;

    async fn list_pods(
        &self,
        namespace: &str,
        match_labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, ClusterError>;

    /// Set one key of a ConfigMap, creating the ConfigMap when missing
    async fn upsert_config_map_entry(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), ClusterError>;

    /// Remove one key of a ConfigMap; a missing ConfigMap is not an error
    async fn remove_config_map_entry(&self, namespace: &str, name: &str, key: &str) -> Result<(), ClusterError>;

    /// Whether the cluster serves the OpenShift config API group
    async fn is_openshift(&self) -> Result<bool, ClusterError>;
}

/// Render a label map as an equality-based label selector
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// [`ClusterClient`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl std::fmt::Debug for KubeClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterClient").finish_non_exhaustive()
    }
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn special_resources(&self) -> Api<SpecialResource> {
        Api::all(self.client.clone())
    }

    fn modules(&self) -> Api<SpecialResourceModule> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_special_resource(&self, key: &ResourceKey) -> Result<Option<SpecialResource>, ClusterError> {
        Ok(self.special_resources().get_opt(&key.name).await?)
    }

    async fn patch_special_resource_status(&self, resource: &SpecialResource) -> Result<(), ClusterError> {
        let name = resource.name_any();
        let patch = json!({
            "metadata": { "resourceVersion": resource.resource_version() },
            "status": resource.status.clone().unwrap_or_default(),
        });
        self.special_resources()
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!("Updated status of SpecialResource {}", name);
        Ok(())
    }

    async fn get_special_resource_module(
        &self,
        key: &ResourceKey,
    ) -> Result<Option<SpecialResourceModule>, ClusterError> {
        Ok(self.modules().get_opt(&key.name).await?)
    }

    async fn patch_module_status(&self, key: &ResourceKey, watched: u32) -> Result<(), ClusterError> {
        let patch = json!({ "status": { "watched": watched } });
        self.modules()
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn list_nodes(&self, selector: &BTreeMap<String, String>) -> Result<Vec<Node>, ClusterError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&label_selector(selector));
        Ok(api.list(&params).await?.items)
    }

    async fn label_node(&self, node: &str, key: &str, value: &str) -> Result<(), ClusterError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = json!({ "metadata": { "labels": { key: value } } });
        api.patch(node, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        Ok(())
    }

    async fn ensure_namespace(&self, name: &str, owner: &OwnerReference) -> Result<(), ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        if api.get_opt(name).await?.is_some() {
            debug!("Namespace {} already exists", name);
            return Ok(());
        }

        let owned_label = format!("{}.openshift.io/owned", owner.kind.to_lowercase());
        let namespace = json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {
                "name": name,
                "labels": {
                    "openshift.io/cluster-monitoring": "true",
                    owned_label: "true",
                },
                "ownerReferences": [owner],
            }
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&namespace))
            .await?;
        info!("Created namespace {}", name);
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        match_labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&label_selector(match_labels));
        Ok(api.list(&params).await?.items)
    }

    async fn upsert_config_map_entry(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), ClusterError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        if api.get_opt(name).await?.is_some() {
            let patch = json!({ "data": { key: value } });
            api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
            return Ok(());
        }

        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(key.to_string(), value.to_string())])),
            ..Default::default()
        };
        api.create(&PostParams::default(), &config_map).await?;
        info!("Created ConfigMap {}/{}", namespace, name);
        Ok(())
    }

    async fn remove_config_map_entry(&self, namespace: &str, name: &str, key: &str) -> Result<(), ClusterError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "data": { key: null } });
        match api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)).await {
            Ok(_) => Ok(()),
            Err(e) => match ClusterError::from(e) {
                ClusterError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn is_openshift(&self) -> Result<bool, ClusterError> {
        let groups = self.client.list_api_groups().await?;
        Ok(groups.groups.iter().any(|g| g.name == OPENSHIFT_CONFIG_GROUP))
    }
}
