//! Kernel versions running in the cluster.
//!
//! Node Feature Discovery labels every node with its full kernel version and
//! OS release. The controller groups the nodes a SpecialResource targets by
//! kernel version; kernel-affine templates are applied once per group.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use helmer::{KERNEL_AFFINE_LABEL, KERNEL_VERSION_NODE_LABEL};
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use regex::Regex;
use tracing::{debug, warn};

const OS_RELEASE_ID_LABEL: &str = "feature.node.kubernetes.io/system-os_release.ID";
const OS_RELEASE_VERSION_ID_LABEL: &str = "feature.node.kubernetes.io/system-os_release.VERSION_ID";
const OS_RELEASE_RHEL_VERSION_LABEL: &str = "feature.node.kubernetes.io/system-os_release.RHEL_VERSION";

static KERNEL_AFFINE_LINE: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(&format!(r"(?m)^\s+{}:.*$", regex::escape(KERNEL_AFFINE_LABEL)))
});

/// OS and cluster details shared by every node running one kernel version
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeVersion {
    /// Cluster version major.minor (e.g. "4.10"); empty outside OpenShift
    pub cluster_version: String,
    /// OS version decimal (e.g. "8.4")
    pub os_version: String,
    /// e.g. "rhel8.4"
    pub os_major_minor: String,
    /// e.g. "rhel8"
    pub os_major: String,
    pub driver_toolkit_image: String,
}

/// Kernel full version -> node details, ordered by kernel version
pub type ClusterKernelMap = BTreeMap<String, NodeVersion>;

/// Whether the raw template declares the kernel-affine annotation.
/// Only the presence of the key on an indented line matters, not its value.
pub fn is_template_kernel_affine(data: &[u8]) -> bool {
    match KERNEL_AFFINE_LINE.as_ref() {
        Ok(re) => re.is_match(&String::from_utf8_lossy(data)),
        Err(_) => false,
    }
}

/// Kernel version and OS details of one node, if it reports a kernel version
pub fn node_version(node: &Node, driver_toolkit_image: &str) -> Option<(String, NodeVersion)> {
    let labels = node.labels();

    let kernel = labels
        .get(KERNEL_VERSION_NODE_LABEL)
        .cloned()
        .or_else(|| {
            node.status
                .as_ref()
                .and_then(|s| s.node_info.as_ref())
                .map(|info| info.kernel_version.clone())
        })
        .filter(|k| !k.is_empty())?;

    let os_id = labels.get(OS_RELEASE_ID_LABEL).map(String::as_str).unwrap_or_default();
    let version_id = labels
        .get(OS_RELEASE_VERSION_ID_LABEL)
        .map(String::as_str)
        .unwrap_or_default();

    // RHCOS reports the OpenShift version as VERSION_ID and the RHEL base separately
    let (cluster_version, os_version) = match os_id {
        "rhcos" => (
            version_id.to_string(),
            labels
                .get(OS_RELEASE_RHEL_VERSION_LABEL)
                .cloned()
                .unwrap_or_default(),
        ),
        _ => (String::new(), version_id.to_string()),
    };

    let os_prefix = match os_id {
        "rhcos" | "rhel" => "rhel",
        other => other,
    };
    let os_major = os_version.split('.').next().unwrap_or_default();

    Some((
        kernel,
        NodeVersion {
            cluster_version,
            os_major: format!("{}{}", os_prefix, os_major),
            os_major_minor: format!("{}{}", os_prefix, os_version),
            os_version,
            driver_toolkit_image: driver_toolkit_image.to_string(),
        },
    ))
}

/// Group nodes by kernel version. Nodes without a kernel version are skipped.
pub fn cluster_kernel_map(nodes: &[Node], driver_toolkit_image: &str) -> ClusterKernelMap {
    let mut map = ClusterKernelMap::new();
    for node in nodes {
        match node_version(node, driver_toolkit_image) {
            Some((kernel, version)) => {
                debug!("Node {} runs kernel {}", node.name_any(), kernel);
                map.entry(kernel).or_insert(version);
            }
            None => warn!("Node {} does not report a kernel version", node.name_any()),
        }
    }
    map
}
