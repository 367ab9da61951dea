//! SpecialResourceModule CRD
//!
//! Like a SpecialResource, but additionally declares external objects whose
//! fields it depends on. Each watch names one object and one dotted path; a
//! change of the string at that path triggers a reconcile of the module.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::references::{ChartReference, free_form_values};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "sro.openshift.io",
    version = "v1beta1",
    kind = "SpecialResourceModule",
    plural = "specialresourcemodules",
    shortname = "srm",
    status = "SpecialResourceModuleStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct SpecialResourceModuleSpec {
    /// Namespace the chart objects are created in
    #[serde(default)]
    pub namespace: String,

    /// Chart that provisions the module
    pub chart: ChartReference,

    /// User values merged over the chart defaults
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    #[schemars(schema_with = "free_form_values")]
    pub set: serde_json::Value,

    /// External object fields this module depends on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub watch: Vec<SpecialResourceModuleWatch>,
}

/// One (object, dotted path) dependency
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub struct SpecialResourceModuleWatch {
    /// apiVersion of the watched object (e.g., "config.openshift.io/v1")
    pub api_version: String,

    /// Kind of the watched object (e.g., "ClusterVersion")
    pub kind: String,

    /// Name of the watched object
    pub name: String,

    /// Namespace of the watched object; absent for cluster-scoped kinds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Dotted path to a string field (e.g., "status.desired.version")
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SpecialResourceModuleStatus {
    /// Number of watches currently registered for this module
    #[serde(default)]
    pub watched: u32,
}
