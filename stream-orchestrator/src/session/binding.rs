//! Tab to page-instance bindings.

use crate::types::ids::{PageInstanceId, Route, SessionKey, TabId};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// `{ route, pageInstanceId, tabId }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Binding {
    pub route: Route,
    pub page_instance_id: PageInstanceId,
    pub tab_id: TabId,
    pub bound_at: DateTime<Utc>,
}

impl Binding {
    pub fn session_key(&self) -> SessionKey {
        SessionKey {
            route: self.route.clone(),
            tab_id: self.tab_id.clone(),
        }
    }
}

/// In-memory map from tab to its current binding.
#[derive(Debug, Default)]
pub struct BindingRegistry {
    bindings: DashMap<TabId, Binding>,
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `tab_id` to `route`.
    ///
    /// Rebinding the same route returns the existing page instance so a reload keeps its
    /// session identity; a different route mints a new instance and replaces the old binding.
    pub fn bind(&self, tab_id: &TabId, route: &Route) -> PageInstanceId {
        match self.bindings.entry(tab_id.clone()) {
            Entry::Occupied(existing) if existing.get().route == *route => {
                existing.get().page_instance_id.clone()
            }
            entry => {
                let binding = Binding {
                    route: route.clone(),
                    page_instance_id: PageInstanceId::random(),
                    tab_id: tab_id.clone(),
                    bound_at: Utc::now(),
                };
                let page_instance_id = binding.page_instance_id.clone();
                tracing::debug!(
                    "bound tab {} to {} as {}",
                    tab_id,
                    route,
                    page_instance_id
                );
                entry.insert(binding);
                page_instance_id
            }
        }
    }

    pub fn lookup(&self, tab_id: &TabId) -> Option<Binding> {
        self.bindings.get(tab_id).map(|b| b.clone())
    }

    pub fn unbind(&self, tab_id: &TabId) -> Option<Binding> {
        self.bindings.remove(tab_id).map(|(_, b)| b)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_and_lookup() {
        let registry = BindingRegistry::new();
        let tab = TabId::new("t1");
        let pid = registry.bind(&tab, &Route::new("/r"));

        let binding = registry.lookup(&tab).unwrap();
        assert_eq!(binding.page_instance_id, pid);
        assert_eq!(binding.route.as_str(), "/r");
        assert_eq!(binding.session_key(), SessionKey::new("/r", "t1"));
    }

    #[test]
    fn test_rebind_same_route_is_idempotent() {
        let registry = BindingRegistry::new();
        let tab = TabId::new("t1");
        let first = registry.bind(&tab, &Route::new("/r"));
        let second = registry.bind(&tab, &Route::new("/r"));
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_rebind_other_route_overwrites() {
        let registry = BindingRegistry::new();
        let tab = TabId::new("t1");
        let first = registry.bind(&tab, &Route::new("/a"));
        let second = registry.bind(&tab, &Route::new("/b"));
        assert_ne!(first, second);

        let binding = registry.lookup(&tab).unwrap();
        assert_eq!(binding.route.as_str(), "/b");
        assert_eq!(binding.page_instance_id, second);

        // back to the first route mints yet another instance
        let third = registry.bind(&tab, &Route::new("/a"));
        assert_ne!(third, first);
    }

    #[test]
    fn test_lookup_unknown_and_unbind() {
        let registry = BindingRegistry::new();
        assert!(registry.lookup(&TabId::new("nope")).is_none());

        let tab = TabId::new("t1");
        registry.bind(&tab, &Route::new("/r"));
        assert!(registry.unbind(&tab).is_some());
        assert!(registry.is_empty());
    }
}
