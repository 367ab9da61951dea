//! Render context injected into chart values.

use helmer::coalesce;
use serde::Serialize;
use serde_json::Value;

use crate::kernel::NodeVersion;

/// Platform string for OpenShift clusters
pub const PLATFORM_OPENSHIFT: &str = "OCP";
/// Platform string for every other Kubernetes distribution
pub const PLATFORM_KUBERNETES: &str = "K8S";

/// Per-iteration render context. A fresh snapshot is built for every kernel
/// version of a fan-out and never mutated afterwards.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunInfo {
    pub kernel_full_version: String,
    pub operating_system_major: String,
    pub operating_system_major_minor: String,
    pub operating_system_decimal: String,
    pub cluster_version_major_minor: String,
    pub driver_toolkit_image: String,
    /// `<resource name>-<ordinal>` of the state being applied
    pub state_name: String,
    pub platform: String,
}

impl RunInfo {
    pub fn for_kernel(kernel: &str, version: &NodeVersion, state_name: &str, platform: &str) -> Self {
        Self {
            kernel_full_version: kernel.to_string(),
            operating_system_major: version.os_major.clone(),
            operating_system_major_minor: version.os_major_minor.clone(),
            operating_system_decimal: version.os_version.clone(),
            cluster_version_major_minor: version.cluster_version.clone(),
            driver_toolkit_image: version.driver_toolkit_image.clone(),
            state_name: state_name.to_string(),
            platform: platform.to_string(),
        }
    }

    /// Chart defaults, then user values, then this context; later layers win
    pub fn merge_values(&self, chart_values: &Value, user_values: &Value) -> Result<Value, serde_json::Error> {
        let run_info = serde_json::to_value(self)?;
        Ok(coalesce(&coalesce(chart_values, user_values), &run_info))
    }
}

pub fn platform_name(openshift: bool) -> &'static str {
    if openshift {
        PLATFORM_OPENSHIFT
    } else {
        PLATFORM_KUBERNETES
    }
}
