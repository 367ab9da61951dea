//! Kubernetes-backed Helmer
//!
//! Charts are read from local `file://` repositories. Templates are rendered
//! with minijinja: chart values are exposed as `Values`, and helper templates
//! (`_*.tpl`, `*.tpl`) are registered so rendered templates can `include` or
//! `import` them. Every rendered document is decorated with the ownership
//! label and owner reference, then server-side applied.

use std::path::{Path, PathBuf};

use kube::Client;
use kube::api::{Api, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::discovery::Scope;
use minijinja::{AutoEscape, Environment, context};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crds::ChartReference;

use crate::error::HelmerError;
use crate::helmer_trait::HelmerTrait;
use crate::models::{ApplyRequest, Chart, ChartFile, ChartMetadata};
use crate::{FIELD_MANAGER, KERNEL_AFFINE_LABEL, KERNEL_VERSION_NODE_LABEL};

/// Kinds whose pod template is labelled and node-selected like the object itself
const WORKLOAD_KINDS: [&str; 3] = ["DaemonSet", "Deployment", "StatefulSet"];

/// Helmer that applies rendered charts to a live cluster
#[derive(Clone)]
pub struct KubeHelmer {
    client: Client,
    charts_dir: PathBuf,
}

impl std::fmt::Debug for KubeHelmer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeHelmer")
            .field("charts_dir", &self.charts_dir)
            .finish_non_exhaustive()
    }
}

impl KubeHelmer {
    /// Create a new Helmer
    ///
    /// # Arguments
    /// * `client` - Kubernetes client used for discovery and apply
    /// * `charts_dir` - Base directory for repositories without an absolute `file://` URL
    pub fn new(client: Client, charts_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            charts_dir: charts_dir.into(),
        }
    }

    /// Local directory backing a chart repository
    fn repository_dir(&self, reference: &ChartReference) -> Result<PathBuf, HelmerError> {
        let url = reference.repository.url.trim();
        if url.is_empty() {
            return Ok(self.charts_dir.join(&reference.repository.name));
        }

        let Some(path) = url.strip_prefix("file://") else {
            return Err(HelmerError::UnsupportedRepository(url.to_string()));
        };

        let path = Path::new(path);
        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            Ok(self.charts_dir.join(path))
        }
    }

    /// Resolve, patch and server-side apply one rendered object
    async fn apply_object(&self, request: &ApplyRequest, mut object: Value) -> Result<(), HelmerError> {
        let (api_version, kind) = type_of(&object).ok_or_else(|| HelmerError::InvalidManifest {
            template: describe(&object),
            reason: "missing apiVersion or kind".to_string(),
        })?;

        let gvk = match api_version.split_once('/') {
            Some((group, version)) => GroupVersionKind::gvk(group, version, &kind),
            None => GroupVersionKind::gvk("", &api_version, &kind),
        };
        let (resource, capabilities) = kube::discovery::pinned_kind(&self.client, &gvk).await?;
        let namespaced = matches!(capabilities.scope, Scope::Namespaced);

        decorate(&mut object, request, namespaced)?;

        let name = string_at(&object, "/metadata/name").unwrap_or_default();
        let api: Api<DynamicObject> = match string_at(&object, "/metadata/namespace") {
            Some(namespace) if namespaced => Api::namespaced_with(self.client.clone(), &namespace, &resource),
            _ => Api::all_with(self.client.clone(), &resource),
        };

        api.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&object))
            .await?;

        debug!("Applied {}/{}", kind, name);
        Ok(())
    }
}

#[async_trait::async_trait]
impl HelmerTrait for KubeHelmer {
    async fn load_chart(&self, reference: &ChartReference) -> Result<Chart, HelmerError> {
        let repository = self.repository_dir(reference)?;

        let mut chart_dir = None;
        for candidate in [repository.join(reference.directory_name()), repository.join(&reference.name)] {
            if tokio::fs::try_exists(candidate.join("Chart.yaml")).await? {
                chart_dir = Some(candidate);
                break;
            }
        }
        let chart_dir = chart_dir.ok_or_else(|| HelmerError::ChartNotFound(reference.to_string()))?;

        let chart = load_chart_dir(&chart_dir).await?;
        if !reference.version.is_empty() && chart.metadata.version != reference.version {
            return Err(HelmerError::VersionMismatch {
                name: reference.name.clone(),
                expected: reference.version.clone(),
                found: chart.metadata.version,
            });
        }

        info!(
            "Loaded chart {} from {} ({} templates)",
            reference,
            chart_dir.display(),
            chart.templates.len()
        );
        Ok(chart)
    }

    async fn run(&self, request: ApplyRequest) -> Result<(), HelmerError> {
        let objects = render_manifests(&request)?;
        debug!(
            "Rendered {} objects for {} (kernel {:?})",
            objects.len(),
            request.name,
            request.kernel_full_version
        );

        let mut failures = Vec::new();
        for rendered in objects {
            let id = describe(&rendered.object);
            if request.debug {
                let yaml = serde_yaml::to_string(&rendered.object).unwrap_or_default();
                info!("Debug active. Applying {} from {}:\n{}", id, rendered.template, yaml);
            }
            if let Err(e) = self.apply_object(&request, rendered.object).await {
                warn!("Failed to apply {} from {}: {}", id, rendered.template, e);
                failures.push(format!("{id}: {e}"));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(HelmerError::Apply(failures))
        }
    }
}

/// Read `Chart.yaml`, `values.yaml` and `templates/` from a chart directory
pub async fn load_chart_dir(dir: &Path) -> Result<Chart, HelmerError> {
    let metadata_path = dir.join("Chart.yaml");
    if !tokio::fs::try_exists(&metadata_path).await? {
        return Err(HelmerError::ChartNotFound(dir.display().to_string()));
    }
    let metadata: ChartMetadata = serde_yaml::from_str(&tokio::fs::read_to_string(&metadata_path).await?)?;

    let values_path = dir.join("values.yaml");
    let values = if tokio::fs::try_exists(&values_path).await? {
        let raw = tokio::fs::read_to_string(&values_path).await?;
        serde_yaml::from_str::<Value>(&raw)?
    } else {
        Value::Null
    };

    let mut templates = Vec::new();
    let templates_dir = dir.join("templates");
    if tokio::fs::try_exists(&templates_dir).await? {
        let mut entries = tokio::fs::read_dir(&templates_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let data = tokio::fs::read(entry.path()).await?;
            templates.push(ChartFile::new(format!("templates/{file_name}"), data));
        }
    }
    templates.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(Chart {
        metadata,
        templates,
        values,
    })
}

/// One object produced by rendering a template
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedObject {
    /// Template the object came from
    pub template: String,
    pub object: Value,
}

/// Render every non-helper template of the request's chart into objects
pub fn render_manifests(request: &ApplyRequest) -> Result<Vec<RenderedObject>, HelmerError> {
    let mut env = Environment::new();
    env.set_auto_escape_callback(|_| AutoEscape::None);
    for file in &request.chart.templates {
        let source = String::from_utf8(file.data.clone()).map_err(|e| HelmerError::InvalidManifest {
            template: file.name.clone(),
            reason: e.to_string(),
        })?;
        env.add_template_owned(file.name.clone(), source)?;
    }

    let ctx = context! {
        Values => minijinja::Value::from_serialize(&request.values),
        Release => context! {
            Name => request.name.as_str(),
            Namespace => request.namespace.as_str(),
        },
        Chart => context! {
            Name => request.chart.metadata.name.as_str(),
            Version => request.chart.metadata.version.as_str(),
        },
    };

    let mut objects = Vec::new();
    for file in request.chart.templates.iter().filter(|f| !f.is_helper()) {
        let rendered = env.get_template(&file.name)?.render(&ctx)?;
        for document in serde_yaml::Deserializer::from_str(&rendered) {
            let object = Value::deserialize(document)?;
            if object.is_null() {
                continue;
            }
            validate(&file.name, &object)?;
            objects.push(RenderedObject {
                template: file.name.clone(),
                object,
            });
        }
    }
    Ok(objects)
}

fn validate(template: &str, object: &Value) -> Result<(), HelmerError> {
    let reason = if !object.is_object() {
        "document is not a mapping"
    } else if type_of(object).is_none() {
        "missing apiVersion or kind"
    } else if string_at(object, "/metadata/name").is_none() {
        "missing metadata.name"
    } else {
        return Ok(());
    };
    Err(HelmerError::InvalidManifest {
        template: template.to_string(),
        reason: reason.to_string(),
    })
}

/// Stamp ownership, namespace and scheduling onto a rendered object.
///
/// Kernel-affine objects get the kernel version appended to their name and
/// are pinned to nodes running that kernel, so one copy exists per version.
pub fn decorate(object: &mut Value, request: &ApplyRequest, namespaced: bool) -> Result<(), HelmerError> {
    let owner = serde_json::to_value(&request.owner)?;
    let owned_label = request.owned_label();
    let described = describe(object);
    let Some(root) = object.as_object_mut() else {
        return Ok(());
    };
    let kind = root
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let metadata = child_map(root, "metadata", &described)?;
    if namespaced {
        if !metadata.contains_key("namespace") {
            metadata.insert("namespace".to_string(), Value::String(request.namespace.clone()));
        }
    } else {
        metadata.remove("namespace");
    }
    metadata.insert("ownerReferences".to_string(), Value::Array(vec![owner]));

    let labels = child_map(metadata, "labels", &described)?;
    labels.insert(owned_label.clone(), Value::String("true".to_string()));
    let kernel_affine = labels.contains_key(KERNEL_AFFINE_LABEL) && !request.kernel_full_version.is_empty();

    if kernel_affine {
        let name = metadata.get("name").and_then(Value::as_str).unwrap_or_default();
        let suffixed = format!("{}-{}", name, kernel_suffix(&request.kernel_full_version));
        metadata.insert("name".to_string(), Value::String(suffixed));
    }

    if WORKLOAD_KINDS.contains(&kind.as_str()) {
        let template = child_map(child_map(root, "spec", &described)?, "template", &described)?;
        child_map(child_map(template, "metadata", &described)?, "labels", &described)?
            .insert(owned_label, Value::String("true".to_string()));

        if !request.node_selector.is_empty() || kernel_affine {
            let selector = child_map(child_map(template, "spec", &described)?, "nodeSelector", &described)?;
            for (key, value) in &request.node_selector {
                selector.insert(key.clone(), Value::String(value.clone()));
            }
            if kernel_affine {
                selector.insert(
                    KERNEL_VERSION_NODE_LABEL.to_string(),
                    Value::String(request.kernel_full_version.clone()),
                );
            }
        }
    }

    Ok(())
}

/// Kernel version made safe for use in an object name
fn kernel_suffix(kernel: &str) -> String {
    kernel
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
        .collect()
}

fn child_map<'a>(
    parent: &'a mut Map<String, Value>,
    key: &str,
    object: &str,
) -> Result<&'a mut Map<String, Value>, HelmerError> {
    let slot = parent.entry(key).or_insert(Value::Null);
    if slot.is_null() {
        *slot = Value::Object(Map::new());
    }
    slot.as_object_mut().ok_or_else(|| HelmerError::InvalidManifest {
        template: object.to_string(),
        reason: format!("{key} is not a map"),
    })
}

fn type_of(object: &Value) -> Option<(String, String)> {
    let api_version = object.get("apiVersion")?.as_str()?;
    let kind = object.get("kind")?.as_str()?;
    Some((api_version.to_string(), kind.to_string()))
}

fn string_at(object: &Value, pointer: &str) -> Option<String> {
    object.pointer(pointer).and_then(Value::as_str).map(str::to_string)
}

fn describe(object: &Value) -> String {
    let kind = object.get("kind").and_then(Value::as_str).unwrap_or("<unknown>");
    let name = string_at(object, "/metadata/name").unwrap_or_else(|| "<unnamed>".to_string());
    format!("{kind}/{name}")
}
