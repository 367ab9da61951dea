//! Event admission.
//!
//! Decides which cluster events lead to a reconcile. Objects count when they
//! are of the primary kind or owned by it (owner reference or ownership
//! label). Kernel-affine owned objects get their own update rule so that
//! pods replaced during an OS upgrade still wake the controller.
//!
//! The filter is pure: the bookkeeping it asks for comes back in the
//! [`FilterOutcome`] and is carried out by the event pipeline.

use helmer::KERNEL_AFFINE_LABEL;
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use kube::ResourceExt;
use tracing::debug;

use crate::storage::fnv64a;

/// An object as delivered by a watch stream
#[derive(Debug, Clone)]
pub struct EventObject {
    /// GVK of the watch that produced the event. Objects from list calls may
    /// arrive without `apiVersion`/`kind`; this marker stands in for them.
    pub source: GroupVersionKind,
    pub object: DynamicObject,
}

impl EventObject {
    pub fn new(source: GroupVersionKind, object: DynamicObject) -> Self {
        Self { source, object }
    }

    /// Group and kind the object itself declares, if populated
    fn declared_group_kind(&self) -> Option<(&str, &str)> {
        let types = self.object.types.as_ref()?;
        if types.kind.is_empty() {
            return None;
        }
        let group = match types.api_version.split_once('/') {
            Some((group, _)) => group,
            None => "",
        };
        Some((group, types.kind.as_str()))
    }

    /// Kind of the object, falling back to the watch's kind
    pub fn kind(&self) -> &str {
        match self.declared_group_kind() {
            Some((_, kind)) => kind,
            None => self.source.kind.as_str(),
        }
    }

    fn generation(&self) -> Option<i64> {
        self.object.metadata.generation
    }

    fn resource_version(&self) -> Option<&str> {
        self.object.metadata.resource_version.as_deref()
    }
}

/// Side effect requested alongside an admission decision
#[derive(Debug, Clone, PartialEq)]
pub enum Bookkeeping {
    /// Record the pods of this DaemonSet in the lifecycle table
    RefreshDaemonSetPods(DynamicObject),
    /// Drop this key from the lifecycle table
    EvictEntry(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterOutcome {
    pub admit: bool,
    pub bookkeeping: Option<Bookkeeping>,
}

impl FilterOutcome {
    fn admit() -> Self {
        Self {
            admit: true,
            bookkeeping: None,
        }
    }

    fn reject() -> Self {
        Self {
            admit: false,
            bookkeeping: None,
        }
    }

    fn from_admit(admit: bool) -> Self {
        Self {
            admit,
            bookkeeping: None,
        }
    }

    fn with(mut self, bookkeeping: Bookkeeping) -> Self {
        self.bookkeeping = Some(bookkeeping);
        self
    }
}

/// Admission predicate for one primary kind
#[derive(Debug, Clone)]
pub struct EventFilter {
    primary: GroupVersionKind,
    owned_label: String,
}

impl EventFilter {
    pub fn new(primary: GroupVersionKind, owned_label: impl Into<String>) -> Self {
        Self {
            primary,
            owned_label: owned_label.into(),
        }
    }

    pub fn primary(&self) -> &GroupVersionKind {
        &self.primary
    }

    pub fn is_primary_kind(&self, event: &EventObject) -> bool {
        match event.declared_group_kind() {
            Some((group, kind)) => group == self.primary.group && kind == self.primary.kind,
            None => {
                !self.is_owned(event)
                    && event.source.group == self.primary.group
                    && event.source.kind == self.primary.kind
            }
        }
    }

    pub fn is_owned(&self, event: &EventObject) -> bool {
        let object = &event.object;
        object
            .owner_references()
            .iter()
            .any(|owner| owner.kind == self.primary.kind)
            || object.labels().contains_key(&self.owned_label)
    }

    fn primary_or_owned(&self, event: &EventObject) -> bool {
        self.is_primary_kind(event) || self.is_owned(event)
    }

    pub fn on_create(&self, event: &EventObject) -> FilterOutcome {
        FilterOutcome::from_admit(self.primary_or_owned(event))
    }

    pub fn on_update(&self, old: &EventObject, new: &EventObject) -> FilterOutcome {
        let generation_changed = old.generation() != new.generation();
        let version_changed = old.resource_version() != new.resource_version();
        let name = new.object.name_any();

        if self.is_owned(new) && is_kernel_affine(new) {
            if !generation_changed && !version_changed {
                return FilterOutcome::reject();
            }
            debug!(
                "UPDATE owned kernel-affine {} {} changed generation or resourceVersion",
                new.kind(),
                name
            );
            if is_daemonset(new) && generation_changed {
                return FilterOutcome::admit().with(Bookkeeping::RefreshDaemonSetPods(new.object.clone()));
            }
            return FilterOutcome::admit();
        }

        // Status-only writes keep the generation
        if !generation_changed {
            return FilterOutcome::reject();
        }
        if !version_changed {
            return FilterOutcome::reject();
        }

        if self.is_primary_kind(new) {
            debug!("UPDATE {} {} generation changed", self.primary.kind, name);
            return FilterOutcome::admit();
        }

        if self.is_owned(new) {
            debug!("UPDATE owned {} {} generation changed", new.kind(), name);
            if is_daemonset(new) {
                return FilterOutcome::admit().with(Bookkeeping::RefreshDaemonSetPods(new.object.clone()));
            }
            return FilterOutcome::admit();
        }

        FilterOutcome::reject()
    }

    pub fn on_delete(&self, event: &EventObject) -> FilterOutcome {
        if self.is_primary_kind(event) {
            return FilterOutcome::admit();
        }

        if self.is_owned(event) {
            let object = &event.object;
            let key = fnv64a(&format!(
                "{}{}",
                object.namespace().unwrap_or_default(),
                object.name_any()
            ));
            return FilterOutcome::admit().with(Bookkeeping::EvictEntry(key));
        }

        FilterOutcome::reject()
    }

    pub fn on_generic(&self, event: &EventObject) -> FilterOutcome {
        FilterOutcome::from_admit(self.primary_or_owned(event))
    }
}

/// Objects labelled kernel-affine by the Helmer
pub fn is_kernel_affine(event: &EventObject) -> bool {
    event.object.labels().contains_key(KERNEL_AFFINE_LABEL)
}

fn is_daemonset(event: &EventObject) -> bool {
    event.kind() == "DaemonSet"
}
