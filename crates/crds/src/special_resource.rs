//! SpecialResource CRD
//!
//! Declares a hardware enablement stack (kernel module, driver container,
//! device plugin) that the controller provisions from a chart onto every
//! node matching the node selector.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::{Condition, ConditionState};
use crate::references::{ChartReference, free_form_values};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "sro.openshift.io",
    version = "v1beta1",
    kind = "SpecialResource",
    plural = "specialresources",
    shortname = "sr",
    status = "SpecialResourceStatus",
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SpecialResourceSpec {
    /// Namespace the chart objects are created in (defaults to the resource name)
    #[serde(default)]
    pub namespace: String,

    /// Chart that provisions the stack
    pub chart: ChartReference,

    /// User values merged over the chart defaults
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    #[schemars(schema_with = "free_form_values")]
    pub set: serde_json::Value,

    /// Node labels selecting the nodes the stack targets
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Log rendered templates and merged values
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SpecialResourceStatus {
    /// Human-facing display state ("Ready", "Errored", ...)
    #[serde(default)]
    pub state: String,

    /// Ready / Progressing / Errored records
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl SpecialResource {
    /// Namespace the chart objects land in; an empty `spec.namespace` means
    /// the resource name.
    pub fn target_namespace(&self) -> String {
        if self.spec.namespace.is_empty() {
            self.metadata.name.clone().unwrap_or_default()
        } else {
            self.spec.namespace.clone()
        }
    }

    /// Active condition state, if the status carries exactly one `True` record
    pub fn condition_state(&self) -> Option<ConditionState> {
        self.status
            .as_ref()
            .and_then(|s| ConditionState::from_conditions(&s.conditions))
    }

    /// Whether a deletion timestamp is set
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
