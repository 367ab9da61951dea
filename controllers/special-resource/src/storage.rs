//! Lifecycle side table.
//!
//! A ConfigMap in the operator namespace maps a hash of `namespace + name`
//! of objects the controller tracks (pods of kernel-affine DaemonSets) to
//! their type. Entries are dropped when the owned object goes away.

use std::sync::Arc;

use tracing::debug;

use crate::cluster::{ClusterClient, ClusterError};

const FNV64_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV64_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a of `input` as lowercase hex without padding
pub fn fnv64a(input: &str) -> String {
    let hash = input.bytes().fold(FNV64_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV64_PRIME)
    });
    format!("{:x}", hash)
}

/// Entries of the lifecycle ConfigMap
#[derive(Clone)]
pub struct Storage {
    cluster: Arc<dyn ClusterClient>,
    namespace: String,
    name: String,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Storage {
    pub fn new(cluster: Arc<dyn ClusterClient>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub async fn update_entry(&self, key: &str, value: &str) -> Result<(), ClusterError> {
        debug!("Lifecycle entry {} -> {} in {}/{}", key, value, self.namespace, self.name);
        self.cluster
            .upsert_config_map_entry(&self.namespace, &self.name, key, value)
            .await
    }

    pub async fn delete_entry(&self, key: &str) -> Result<(), ClusterError> {
        debug!("Removing lifecycle entry {} from {}/{}", key, self.namespace, self.name);
        self.cluster
            .remove_config_map_entry(&self.namespace, &self.name, key)
            .await
    }
}
