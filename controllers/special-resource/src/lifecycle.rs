//! Pod bookkeeping for kernel-affine DaemonSets.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::api::DynamicObject;
use kube::ResourceExt;
use tracing::info;

use crate::cluster::{ClusterClient, ClusterError};
use crate::storage::{Storage, fnv64a};

/// Value recorded for every tracked pod
pub const POD_ENTRY_VALUE: &str = "*v1.Pod";

#[derive(Clone)]
pub struct Lifecycle {
    cluster: Arc<dyn ClusterClient>,
    storage: Storage,
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle").field("storage", &self.storage).finish_non_exhaustive()
    }
}

impl Lifecycle {
    pub fn new(cluster: Arc<dyn ClusterClient>, storage: Storage) -> Self {
        Self { cluster, storage }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Record every pod selected by the DaemonSet's `spec.selector.matchLabels`
    pub async fn update_daemonset_pods(&self, daemonset: &DynamicObject) -> Result<usize, ClusterError> {
        let namespace = daemonset.namespace().unwrap_or_default();
        let match_labels = match_labels(daemonset);
        info!(
            "Updating lifecycle entries for pods of DaemonSet {}/{}",
            namespace,
            daemonset.name_any()
        );

        let pods = self.cluster.list_pods(&namespace, &match_labels).await?;
        for pod in &pods {
            let key = fnv64a(&format!("{}{}", pod.namespace().unwrap_or_default(), pod.name_any()));
            self.storage.update_entry(&key, POD_ENTRY_VALUE).await?;
        }
        Ok(pods.len())
    }
}

fn match_labels(daemonset: &DynamicObject) -> BTreeMap<String, String> {
    daemonset
        .data
        .pointer("/spec/selector/matchLabels")
        .and_then(|labels| labels.as_object())
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}
