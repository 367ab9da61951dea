//! Helmer errors

use thiserror::Error;

/// Errors that can occur while loading, rendering or applying a chart
#[derive(Debug, Error)]
pub enum HelmerError {
    /// Repository URL scheme is not supported
    #[error("Unsupported chart repository: {0}")]
    UnsupportedRepository(String),

    /// Chart directory or Chart.yaml missing
    #[error("Chart not found: {0}")]
    ChartNotFound(String),

    /// Chart.yaml version differs from the requested one
    #[error("Chart {name} has version {found}, expected {expected}")]
    VersionMismatch {
        name: String,
        expected: String,
        found: String,
    },

    /// Filesystem error while reading a chart
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Template failed to compile or render
    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),

    /// A rendered document is not a usable Kubernetes object
    #[error("Invalid manifest in {template}: {reason}")]
    InvalidManifest { template: String, reason: String },

    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// One or more objects failed to apply
    #[error("{} object(s) failed to apply: {}", .0.len(), .0.join("; "))]
    Apply(Vec<String>),
}
