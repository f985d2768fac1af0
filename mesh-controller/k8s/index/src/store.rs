use fsm_mesh_controller_core::broker::EventKind;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

/// Resources of a single kind keyed by namespace and name.
///
/// Cluster-scoped resources are stored under the empty namespace. Iteration
/// is ordered by `(namespace, name)`, which keeps every query over the store
/// deterministic.
#[derive(Debug)]
pub struct Store<T> {
    items: BTreeMap<(String, String), T>,
}

impl<T> Default for Store<T> {
    fn default() -> Self {
        Self {
            items: BTreeMap::new(),
        }
    }
}

impl<T: Resource> Store<T> {
    /// Stores the resource. Returns `None` when an identical resource version
    /// was already stored.
    pub(crate) fn insert(&mut self, resource: T) -> Option<EventKind> {
        let key = (
            resource.namespace().unwrap_or_default(),
            resource.name_unchecked(),
        );
        let version = resource.resource_version();
        match self.items.insert(key, resource) {
            None => Some(EventKind::Added),
            Some(prev) if version.is_some() && prev.resource_version() == version => None,
            Some(_) => Some(EventKind::Updated),
        }
    }
}

impl<T> Store<T> {
    pub(crate) fn remove(&mut self, namespace: &str, name: &str) -> Option<T> {
        self.items
            .remove(&(namespace.to_string(), name.to_string()))
    }

    pub(crate) fn get(&self, namespace: &str, name: &str) -> Option<&T> {
        self.items.get(&(namespace.to_string(), name.to_string()))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.items.values()
    }

    pub(crate) fn in_namespace<'a>(&'a self, namespace: &'a str) -> impl Iterator<Item = &'a T> + 'a {
        self.items
            .range((namespace.to_string(), String::new())..)
            .take_while(move |((ns, _), _)| ns == namespace)
            .map(|(_, item)| item)
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn len_in(&self, namespace: &str) -> usize {
        self.in_namespace(namespace).count()
    }
}
