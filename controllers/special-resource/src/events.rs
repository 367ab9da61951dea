//! Event pipeline: turns watch stream updates into reconcile requests.
//!
//! A watch stream only reports the current state of an object. The
//! [`EventTracker`] of each stream remembers the last version it saw so the
//! filter can compare old and new on update, and so objects that vanished
//! while the stream was reconnecting still produce a delete.

use std::collections::{HashMap, HashSet};

use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use kube::ResourceExt;
use kube_runtime::watcher;
use tracing::{debug, error};

use crate::filter::{Bookkeeping, EventFilter, EventObject, FilterOutcome};
use crate::lifecycle::Lifecycle;
use crate::queue::{ReconcileRequest, ResourceKey, WorkQueue};

/// Change to one object, as seen by the filter
#[derive(Debug, Clone)]
pub enum ResourceEvent {
    Create(EventObject),
    Update { old: EventObject, new: EventObject },
    Delete(EventObject),
    /// Re-listed without changes
    Generic(EventObject),
}

impl ResourceEvent {
    /// The object as it is now (or was, for deletes)
    pub fn object(&self) -> &EventObject {
        match self {
            ResourceEvent::Create(o) | ResourceEvent::Delete(o) | ResourceEvent::Generic(o) => o,
            ResourceEvent::Update { new, .. } => new,
        }
    }
}

type ObjectId = (Option<String>, String);

fn object_id(object: &DynamicObject) -> ObjectId {
    (object.namespace(), object.name_any())
}

/// Classifies watcher events of one stream
#[derive(Debug)]
pub struct EventTracker {
    source: GroupVersionKind,
    known: HashMap<ObjectId, DynamicObject>,
    /// Objects seen during the current relist, if one is in progress
    relisted: Option<HashSet<ObjectId>>,
}

impl EventTracker {
    pub fn new(source: GroupVersionKind) -> Self {
        Self {
            source,
            known: HashMap::new(),
            relisted: None,
        }
    }

    fn wrap(&self, object: DynamicObject) -> EventObject {
        EventObject::new(self.source.clone(), object)
    }

    fn apply(&mut self, object: DynamicObject) -> ResourceEvent {
        let id = object_id(&object);
        match self.known.insert(id, object.clone()) {
            None => ResourceEvent::Create(self.wrap(object)),
            Some(old) if old.resource_version() == object.resource_version() => {
                ResourceEvent::Generic(self.wrap(object))
            }
            Some(old) => ResourceEvent::Update {
                old: self.wrap(old),
                new: self.wrap(object),
            },
        }
    }

    pub fn observe(&mut self, event: watcher::Event<DynamicObject>) -> Vec<ResourceEvent> {
        match event {
            watcher::Event::Apply(object) => vec![self.apply(object)],
            watcher::Event::Delete(object) => {
                self.known.remove(&object_id(&object));
                vec![ResourceEvent::Delete(self.wrap(object))]
            }
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(object) => {
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(object_id(&object));
                }
                vec![self.apply(object)]
            }
            watcher::Event::InitDone => {
                let Some(relisted) = self.relisted.take() else {
                    return Vec::new();
                };
                let gone: Vec<ObjectId> = self
                    .known
                    .keys()
                    .filter(|id| !relisted.contains(*id))
                    .cloned()
                    .collect();
                let removed: Vec<DynamicObject> =
                    gone.into_iter().filter_map(|id| self.known.remove(&id)).collect();
                removed
                    .into_iter()
                    .map(|object| ResourceEvent::Delete(self.wrap(object)))
                    .collect()
            }
        }
    }
}

/// Filters events for one primary kind and queues the affected primaries
pub struct EventPipeline {
    filter: EventFilter,
    lifecycle: Lifecycle,
    queue: WorkQueue,
    request: fn(ResourceKey) -> ReconcileRequest,
}

impl std::fmt::Debug for EventPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPipeline")
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

impl EventPipeline {
    pub fn new(
        filter: EventFilter,
        lifecycle: Lifecycle,
        queue: WorkQueue,
        request: fn(ResourceKey) -> ReconcileRequest,
    ) -> Self {
        Self {
            filter,
            lifecycle,
            queue,
            request,
        }
    }

    pub fn evaluate(&self, event: &ResourceEvent) -> FilterOutcome {
        match event {
            ResourceEvent::Create(o) => self.filter.on_create(o),
            ResourceEvent::Update { old, new } => self.filter.on_update(old, new),
            ResourceEvent::Delete(o) => self.filter.on_delete(o),
            ResourceEvent::Generic(o) => self.filter.on_generic(o),
        }
    }

    /// Primaries to reconcile for an admitted object: itself, or the owners
    /// of the primary kind
    pub fn targets(&self, event: &EventObject) -> Vec<ReconcileRequest> {
        if self.filter.is_primary_kind(event) {
            let object = &event.object;
            return vec![(self.request)(ResourceKey {
                name: object.name_any(),
                namespace: object.namespace(),
            })];
        }
        event
            .object
            .owner_references()
            .iter()
            .filter(|owner| owner.kind == self.filter.primary().kind)
            .map(|owner| (self.request)(ResourceKey::cluster(owner.name.clone())))
            .collect()
    }

    /// Run the filter, its bookkeeping, and queue the resulting requests
    pub async fn handle(&self, event: ResourceEvent) {
        let outcome = self.evaluate(&event);
        if let Some(bookkeeping) = &outcome.bookkeeping {
            self.bookkeep(bookkeeping).await;
        }
        if !outcome.admit {
            return;
        }

        let object = event.object();
        let requests = self.targets(object);
        debug!(
            "{} {} admitted, queueing {} request(s)",
            object.kind(),
            object.object.name_any(),
            requests.len()
        );
        self.queue.enqueue_all(requests);
    }

    async fn bookkeep(&self, bookkeeping: &Bookkeeping) {
        match bookkeeping {
            Bookkeeping::RefreshDaemonSetPods(daemonset) => {
                if let Err(e) = self.lifecycle.update_daemonset_pods(daemonset).await {
                    error!("Failed to record pods of DaemonSet {}: {}", daemonset.name_any(), e);
                }
            }
            Bookkeeping::EvictEntry(key) => {
                if let Err(e) = self.lifecycle.storage().delete_entry(key).await {
                    error!("Failed to remove lifecycle entry {}: {}", key, e);
                }
            }
        }
    }
}
