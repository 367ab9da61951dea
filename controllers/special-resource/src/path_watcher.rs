//! Path-diff watcher for SpecialResourceModules.
//!
//! A module declares external objects and dotted paths inside them. The
//! watcher keeps, per (object, path), the last string seen there and the set
//! of modules that depend on it. An event for a tracked object re-reads every
//! tracked path and returns the modules whose value changed.
//!
//! Registration (reconcile path) and dispatch (watch tasks) share one lock,
//! and the low-level watch for a new object is started only after its entry
//! is recorded, so the first event of a watch always finds its subscribers.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crds::{SpecialResourceModule, SpecialResourceModuleWatch};
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use kube::ResourceExt;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::error::ControllerError;
use crate::queue::ResourceKey;

/// External object a module depends on. `namespace` is empty for
/// cluster-scoped objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchedResource {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl WatchedResource {
    pub fn from_watch(watch: &SpecialResourceModuleWatch) -> Self {
        Self {
            api_version: watch.api_version.clone(),
            kind: watch.kind.clone(),
            name: watch.name.clone(),
            namespace: watch.namespace.clone().unwrap_or_default(),
        }
    }

    /// Identity of an incoming object, if it carries apiVersion and kind
    pub fn from_object(object: &DynamicObject) -> Option<Self> {
        let types = object.types.as_ref()?;
        Some(Self {
            api_version: types.api_version.clone(),
            kind: types.kind.clone(),
            name: object.name_any(),
            namespace: object.namespace().unwrap_or_default(),
        })
    }

    pub fn gvk(&self) -> Result<GroupVersionKind, ControllerError> {
        if self.kind.is_empty() || self.api_version.is_empty() {
            return Err(ControllerError::InvalidResource(format!(
                "watch needs apiVersion and kind, got '{}' '{}'",
                self.api_version, self.kind
            )));
        }
        let (group, version) = match self.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", self.api_version.as_str()),
        };
        Ok(GroupVersionKind::gvk(group, version, &self.kind))
    }
}

impl std::fmt::Display for WatchedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{} {}/{}", self.api_version, self.kind, self.name)
        } else {
            write!(f, "{} {}/{}/{}", self.api_version, self.kind, self.namespace, self.name)
        }
    }
}

/// Starts and stops the low-level watch of one external object.
///
/// Called with the watcher lock held: implementations must not block and
/// must not call back into the [`PathWatcher`].
pub trait WatchRegistry: Send + Sync {
    fn register(&self, resource: &WatchedResource) -> Result<(), ControllerError>;
    fn deregister(&self, resource: &WatchedResource);
}

#[derive(Debug, Default)]
struct PathObservation {
    last_value: String,
    subscribers: BTreeSet<ResourceKey>,
}

type TrackedPaths = BTreeMap<String, PathObservation>;

/// Tracks (object, path) observations for every module
pub struct PathWatcher {
    registry: Arc<dyn WatchRegistry>,
    tracked: Mutex<HashMap<WatchedResource, TrackedPaths>>,
}

impl std::fmt::Debug for PathWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathWatcher").finish_non_exhaustive()
    }
}

/// Why a path could not be read
#[derive(Debug, PartialEq, Eq)]
enum Extraction {
    Missing,
    NotAString(String),
}

impl PathWatcher {
    pub fn new(registry: Arc<dyn WatchRegistry>) -> Self {
        Self {
            registry,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<WatchedResource, TrackedPaths>> {
        match self.tracked.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Bring the module's subscriptions in line with its declared watches.
    /// Returns the number of distinct (object, path) pairs it now follows.
    pub fn reconcile_watches(&self, module: &SpecialResourceModule) -> Result<usize, ControllerError> {
        let subscriber = ResourceKey::from_resource(module);
        let mut declared: Vec<(WatchedResource, String)> = Vec::new();
        for watch in &module.spec.watch {
            let entry = (WatchedResource::from_watch(watch), watch.path.clone());
            if !declared.contains(&entry) {
                declared.push(entry);
            }
        }

        let keep: HashSet<(WatchedResource, String)> = declared.iter().cloned().collect();
        let mut tracked = self.lock();
        self.prune(&mut tracked, &subscriber, &keep);

        for (resource, path) in &declared {
            let first_for_resource = !tracked.contains_key(resource);
            let observation = tracked
                .entry(resource.clone())
                .or_default()
                .entry(path.clone())
                .or_default();
            if !observation.subscribers.insert(subscriber.clone()) {
                continue;
            }
            info!("SpecialResourceModule {} watches {} at {}", subscriber, resource, path);

            if first_for_resource {
                if let Err(e) = self.registry.register(resource) {
                    error!("Failed to start watching {}: {}", resource, e);
                    tracked.remove(resource);
                    return Err(e);
                }
            }
        }

        Ok(declared.len())
    }

    /// Drop every subscription of a module that no longer exists
    pub fn remove_subscriber(&self, subscriber: &ResourceKey) {
        let mut tracked = self.lock();
        self.prune(&mut tracked, subscriber, &HashSet::new());
    }

    fn prune(
        &self,
        tracked: &mut HashMap<WatchedResource, TrackedPaths>,
        subscriber: &ResourceKey,
        keep: &HashSet<(WatchedResource, String)>,
    ) {
        let mut emptied = Vec::new();
        for (resource, paths) in tracked.iter_mut() {
            paths.retain(|path, observation| {
                if !keep.contains(&(resource.clone(), path.clone()))
                    && observation.subscribers.remove(subscriber)
                {
                    info!("SpecialResourceModule {} no longer watches {} at {}", subscriber, resource, path);
                }
                !observation.subscribers.is_empty()
            });
            if paths.is_empty() {
                emptied.push(resource.clone());
            }
        }

        for resource in emptied {
            tracked.remove(&resource);
            self.registry.deregister(&resource);
            info!("Stopped watching {}", resource);
        }
    }

    /// Modules to reconcile because a tracked value of `object` changed
    pub fn on_object_event(&self, object: &DynamicObject) -> Vec<ResourceKey> {
        let Some(resource) = WatchedResource::from_object(object) else {
            debug!("Ignoring watched object {} without apiVersion/kind", object.name_any());
            return Vec::new();
        };

        let mut tracked = self.lock();
        let Some(paths) = tracked.get_mut(&resource) else {
            return Vec::new();
        };

        let document = match serde_json::to_value(object) {
            Ok(document) => document,
            Err(e) => {
                error!("Failed to serialize {}: {}", resource, e);
                return Vec::new();
            }
        };

        let mut triggered = BTreeSet::new();
        for (path, observation) in paths.iter_mut() {
            let value = match extract_string(&document, path) {
                Ok(value) => value,
                Err(Extraction::Missing) => {
                    info!("Could not obtain property at path {} of {}", path, resource);
                    continue;
                }
                Err(Extraction::NotAString(found)) => {
                    error!("Value at path {} of {} is {}, expected a string", path, resource, found);
                    continue;
                }
            };

            if observation.last_value != value {
                debug!("Value at {} of {} changed to '{}'", path, resource, value);
                triggered.extend(observation.subscribers.iter().cloned());
            } else {
                debug!("Value at {} of {} did not change", path, resource);
            }
            observation.last_value = value;
        }

        if !triggered.is_empty() {
            info!("{} triggers reconciliation of {} SpecialResourceModule(s)", resource, triggered.len());
        }
        triggered.into_iter().collect()
    }

    /// Current subscribers of one (object, path)
    #[cfg(test)]
    pub fn subscribers(&self, resource: &WatchedResource, path: &str) -> Vec<ResourceKey> {
        self.lock()
            .get(resource)
            .and_then(|paths| paths.get(path))
            .map(|observation| observation.subscribers.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn is_tracked(&self, resource: &WatchedResource) -> bool {
        self.lock().contains_key(resource)
    }
}

fn extract_string(document: &Value, path: &str) -> Result<String, Extraction> {
    let mut current = document;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment).ok_or(Extraction::Missing)?,
            other => return Err(Extraction::NotAString(type_name(other).to_string())),
        };
    }
    match current {
        Value::String(s) => Ok(s.clone()),
        other => Err(Extraction::NotAString(type_name(other).to_string())),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "a map",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_string() {
        let doc = json!({ "status": { "desired": { "version": "4.10.3" }, "count": 3 } });
        assert_eq!(extract_string(&doc, "status.desired.version"), Ok("4.10.3".to_string()));
        assert_eq!(extract_string(&doc, "status.missing"), Err(Extraction::Missing));
        assert_eq!(
            extract_string(&doc, "status.count"),
            Err(Extraction::NotAString("a number".to_string()))
        );
        assert_eq!(
            extract_string(&doc, "status.count.deeper"),
            Err(Extraction::NotAString("a number".to_string()))
        );
    }
}
