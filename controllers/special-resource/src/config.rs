//! Controller configuration loaded from environment variables.

use std::net::SocketAddr;

use envconfig::Envconfig;

use crate::error::ControllerError;

/// Runtime configuration of the Special Resource Controller
#[derive(Envconfig, Clone, Debug)]
pub struct ControllerConfig {
    /// Namespace the operator runs in; holds the lifecycle ConfigMap
    #[envconfig(from = "OPERATOR_NAMESPACE", default = "openshift-special-resource-operator")]
    pub operator_namespace: String,

    /// Restrict owned-object watches to one namespace (all namespaces when unset)
    #[envconfig(from = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    #[envconfig(from = "METRICS_ADDR", default = "0.0.0.0:8080")]
    pub metrics_addr: String,

    #[envconfig(from = "LIFECYCLE_CONFIGMAP", default = "special-resource-lifecycle")]
    pub lifecycle_configmap: String,

    /// Base directory for chart repositories with relative or empty URLs
    #[envconfig(from = "CHARTS_DIR", default = "/charts")]
    pub charts_dir: String,

    /// Driver toolkit image exposed to templates as `driverToolkitImage`
    #[envconfig(from = "DRIVER_TOOLKIT_IMAGE")]
    pub driver_toolkit_image: Option<String>,

    /// Upper bound of the requeue backoff
    #[envconfig(from = "MAX_BACKOFF_SECONDS", default = "300")]
    pub max_backoff_seconds: u64,
}

impl ControllerConfig {
    /// Load from the process environment
    pub fn load() -> Result<Self, ControllerError> {
        Self::init_from_env().map_err(|e| ControllerError::InvalidConfig(e.to_string()))
    }

    /// Parsed metrics listen address
    pub fn metrics_socket_addr(&self) -> Result<SocketAddr, ControllerError> {
        self.metrics_addr.parse().map_err(|e| {
            ControllerError::InvalidConfig(format!("METRICS_ADDR '{}': {}", self.metrics_addr, e))
        })
    }

    pub fn driver_toolkit_image(&self) -> &str {
        self.driver_toolkit_image.as_deref().unwrap_or_default()
    }
}
