//! Chart state execution.
//!
//! A chart is split into ordered stateful templates, shared named templates
//! and stateless templates. Each stateful template is one provisioning step:
//! it is applied together with the named templates, once, or once per kernel
//! version running in the cluster when it is kernel-affine. Stateless
//! templates follow in a single apply at the end.

use std::sync::Arc;

use crds::SpecialResource;
use helmer::{ApplyRequest, Chart, ChartFile, HelmerTrait};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::assets::{ClassifiedTemplates, ordinal_prefix};
use crate::cluster::ClusterClient;
use crate::error::ControllerError;
use crate::kernel::{ClusterKernelMap, is_template_kernel_affine};
use crate::metrics::Metrics;
use crate::render::RunInfo;
use crate::status::{REASON_HANDLING_STATE, StatusUpdater};

/// Node label value set once a state completed
pub const STATE_READY: &str = "Ready";

/// Instance name of a state: `<resource name>-<ordinal>`
pub fn state_instance_name(resource_name: &str, template: &ChartFile) -> String {
    match ordinal_prefix(&template.name) {
        Some(ordinal) => format!("{}-{}", resource_name, ordinal),
        None => resource_name.to_string(),
    }
}

/// Node label marking a completed state
pub fn state_label(state_name: &str) -> String {
    format!("specialresource.openshift.io/state-{}", state_name)
}

/// Runs the states of one chart for one SpecialResource
pub struct StateEngine {
    helmer: Arc<dyn HelmerTrait>,
    status: Arc<dyn StatusUpdater>,
    metrics: Arc<dyn Metrics>,
    cluster: Arc<dyn ClusterClient>,
}

impl std::fmt::Debug for StateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateEngine").finish_non_exhaustive()
    }
}

impl StateEngine {
    pub fn new(
        helmer: Arc<dyn HelmerTrait>,
        status: Arc<dyn StatusUpdater>,
        metrics: Arc<dyn Metrics>,
        cluster: Arc<dyn ClusterClient>,
    ) -> Self {
        Self {
            helmer,
            status,
            metrics,
            cluster,
        }
    }

    /// Apply every state of `chart` in order, then the stateless remainder.
    ///
    /// `user_values` are layered over the chart defaults and under the
    /// per-kernel render context.
    pub async fn reconcile_states(
        &self,
        resource: &SpecialResource,
        chart: &Chart,
        user_values: &Value,
        kernel_map: &ClusterKernelMap,
        platform: &str,
    ) -> Result<(), ControllerError> {
        let name = resource.name_any();
        let owner = owner_reference(resource)?;
        let templates = ClassifiedTemplates::from_templates(&chart.templates);
        let mut last_run_info: Option<RunInfo> = None;

        for state in &templates.stateful {
            info!("Executing state {} for SpecialResource {}", state.name, name);
            self.status
                .set_as_progressing(resource, REASON_HANDLING_STATE, &format!("Working on: {}", state.name))
                .await?;

            if resource.spec.debug {
                info!("Debug active. Showing YAML contents of {}:\n{}", state.name, state.text());
            }

            let state_name = state_instance_name(&name, state);
            let step = chart.with_templates(templates.with_named([state.clone()]));
            let kernel_affine = is_template_kernel_affine(&state.data);

            if kernel_map.is_empty() {
                return Err(ControllerError::NoKernelVersion);
            }

            let total = kernel_map.len();
            let mut replicas = 0;
            for (kernel, version) in kernel_map {
                let run_info = RunInfo::for_kernel(kernel, version, &state_name, platform);
                let values = run_info.merge_values(&chart.values, user_values)?;
                if resource.spec.debug {
                    info!(
                        "Debug active. Showing YAML values for {}:\n{}",
                        state.name,
                        serde_yaml::to_string(&values).unwrap_or_default()
                    );
                }

                let request = self.apply_request(resource, &owner, step.clone(), values, &run_info, resource.spec.debug);
                let result = self.helmer.run(request).await;
                replicas += 1;
                last_run_info = Some(run_info);

                if let Err(e) = result {
                    if replicas == total {
                        self.metrics.set_completed_state(&name, &state.name, 0);
                        return Err(ControllerError::StateFailed {
                            state: state.name.clone(),
                            source: e,
                        });
                    }
                    warn!(
                        "State {} failed for kernel {} ({} of {}), continuing: {}",
                        state.name, kernel, replicas, total, e
                    );
                }

                if !kernel_affine {
                    break;
                }
            }

            self.metrics.set_completed_state(&name, &state.name, 1);
            self.label_nodes(resource, &state_name).await?;
        }

        let run_info = match last_run_info {
            Some(run_info) => run_info,
            None => self.context_free_run_info(kernel_map, &name, platform)?,
        };
        let values = run_info.merge_values(&chart.values, user_values)?;
        let stateless = chart.with_templates(templates.with_named(templates.stateless.iter().cloned()));
        info!(
            "Applying {} stateless template(s) for SpecialResource {}",
            templates.stateless.len(),
            name
        );
        let request = self.apply_request(resource, &owner, stateless, values, &run_info, false);
        self.helmer.run(request).await?;
        Ok(())
    }

    /// Render context for charts without stateful templates: the first kernel
    fn context_free_run_info(
        &self,
        kernel_map: &ClusterKernelMap,
        name: &str,
        platform: &str,
    ) -> Result<RunInfo, ControllerError> {
        let (kernel, version) = kernel_map.iter().next().ok_or(ControllerError::NoKernelVersion)?;
        Ok(RunInfo::for_kernel(kernel, version, name, platform))
    }

    fn apply_request(
        &self,
        resource: &SpecialResource,
        owner: &OwnerReference,
        chart: Chart,
        values: Value,
        run_info: &RunInfo,
        debug: bool,
    ) -> ApplyRequest {
        let mut request = ApplyRequest::new(chart, values, owner.clone(), resource.name_any(), resource.target_namespace());
        request.node_selector = resource.spec.node_selector.clone();
        request.kernel_full_version = run_info.kernel_full_version.clone();
        request.operating_system_decimal = run_info.operating_system_decimal.clone();
        request.debug = debug;
        request
    }

    /// Mark the nodes this resource targets as having completed the state
    async fn label_nodes(&self, resource: &SpecialResource, state_name: &str) -> Result<(), ControllerError> {
        let key = state_label(state_name);
        let nodes = self.cluster.list_nodes(&resource.spec.node_selector).await?;
        for node in &nodes {
            if node.labels().get(&key).map(String::as_str) == Some(STATE_READY) {
                continue;
            }
            debug!("Labelling node {} with {}={}", node.name_any(), key, STATE_READY);
            self.cluster.label_node(&node.name_any(), &key, STATE_READY).await?;
        }
        Ok(())
    }
}

pub fn owner_reference(resource: &SpecialResource) -> Result<OwnerReference, ControllerError> {
    resource
        .controller_owner_ref(&())
        .ok_or_else(|| ControllerError::InvalidResource(format!("SpecialResource {} has no uid", resource.name_any())))
}
