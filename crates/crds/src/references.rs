//! Chart references for SpecialResource CRDs
//!
//! A SpecialResource (or SpecialResourceModule) points at the chart that
//! provisions its hardware stack. The chart is resolved by the Helmer from
//! the repository URL; `file://` repositories resolve to a local directory.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Repository that serves a chart
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryReference {
    /// Repository name (e.g., "chart")
    pub name: String,

    /// Repository URL (e.g., "file:///charts/example")
    pub url: String,
}

/// Reference to a versioned chart inside a repository
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChartReference {
    /// Chart name (e.g., "simple-kmod")
    pub name: String,

    /// Chart version (e.g., "0.0.1")
    pub version: String,

    /// Repository the chart is loaded from
    pub repository: RepositoryReference,
}

impl ChartReference {
    /// Create a reference to `name`-`version` in the given repository
    pub fn new(name: impl Into<String>, version: impl Into<String>, repository: RepositoryReference) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            repository,
        }
    }

    /// Directory name used for unpacked charts: `<name>-<version>`
    pub fn directory_name(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

impl std::fmt::Display for ChartReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.repository.name, self.name, self.version)
    }
}

/// Schema for free-form chart values
///
/// Values are arbitrary YAML trees; the API server must keep unknown fields.
pub(crate) fn free_form_values(_: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    })
}
