//! Chart models
//!
//! A chart is a directory with a `Chart.yaml`, an optional `values.yaml` and
//! a `templates/` directory. Templates keep their path relative to the chart
//! root as their name (e.g. `templates/0001-namespace.yaml`).

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Contents of `Chart.yaml`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One template file of a chart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartFile {
    /// Path relative to the chart root
    pub name: String,
    /// Raw template bytes
    pub data: Vec<u8>,
}

impl ChartFile {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    /// File name without the directory part
    pub fn base_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    /// Helper templates hold shared macros and never render objects themselves
    pub fn is_helper(&self) -> bool {
        let base = self.base_name();
        base.starts_with('_') || base.ends_with(".tpl")
    }

    /// Template contents as text (lossy)
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// A loaded chart
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Chart {
    pub metadata: ChartMetadata,
    pub templates: Vec<ChartFile>,
    /// Chart default values (`values.yaml`)
    pub values: Value,
}

impl Chart {
    /// Same metadata and default values, different template set
    pub fn with_templates(&self, templates: Vec<ChartFile>) -> Self {
        Self {
            metadata: self.metadata.clone(),
            templates,
            values: self.values.clone(),
        }
    }

    /// Names of the templates, in chart order
    pub fn template_names(&self) -> Vec<String> {
        self.templates.iter().map(|t| t.name.clone()).collect()
    }
}

/// Everything a single apply call needs
#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub chart: Chart,
    /// Fully merged values (`Values` in templates)
    pub values: Value,
    /// Owner set on every applied object
    pub owner: OwnerReference,
    /// Release name (the owning resource's name)
    pub name: String,
    /// Namespace for namespaced objects without an explicit one
    pub namespace: String,
    pub node_selector: BTreeMap<String, String>,
    pub kernel_full_version: String,
    pub operating_system_decimal: String,
    pub debug: bool,
}

impl ApplyRequest {
    /// Request with no node selector, kernel or OS information
    pub fn new(
        chart: Chart,
        values: Value,
        owner: OwnerReference,
        name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            chart,
            values,
            owner,
            name: name.into(),
            namespace: namespace.into(),
            node_selector: BTreeMap::new(),
            kernel_full_version: String::new(),
            operating_system_decimal: String::new(),
            debug: false,
        }
    }

    /// Label key marking objects owned by this request's owner kind
    pub fn owned_label(&self) -> String {
        format!("{}.openshift.io/owned", self.owner.kind.to_lowercase())
    }
}

/// Deep-merge `overlay` over `base`; the overlay wins on leaf conflicts.
///
/// Maps merge recursively, every other value is replaced. A `null` leaf in
/// the overlay deletes the key; a `null` overlay as a whole leaves `base`
/// unchanged.
pub fn coalesce(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (_, Value::Null) => base.clone(),
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in overlay_map {
                if value.is_null() {
                    merged.remove(key);
                    continue;
                }
                let next = match merged.get(key) {
                    Some(existing) => coalesce(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        _ => overlay.clone(),
    }
}
