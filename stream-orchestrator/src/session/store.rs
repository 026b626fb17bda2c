//! Persistent selection store for tab-scoped UI state.

use crate::types::ids::SessionKey;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;

/// Key-value store keyed by `(route, tabId)`.
///
/// Read when a tab binds, written on every selection change. Implementations own their own
/// failure handling; the orchestrator never retries a store call.
pub trait SelectionStore: Send + Sync {
    fn load(&self, key: &SessionKey) -> Option<Value>;

    fn save(&self, key: &SessionKey, selection: Value);

    fn remove(&self, key: &SessionKey);
}

struct StoredSelection {
    value: Value,
    updated_at: DateTime<Utc>,
}

/// In-memory store for standalone use and tests
#[derive(Default)]
pub struct InMemorySelectionStore {
    selections: DashMap<SessionKey, StoredSelection>,
}

impl InMemorySelectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updated_at(&self, key: &SessionKey) -> Option<DateTime<Utc>> {
        self.selections.get(key).map(|s| s.updated_at)
    }

    pub fn len(&self) -> usize {
        self.selections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selections.is_empty()
    }
}

impl SelectionStore for InMemorySelectionStore {
    fn load(&self, key: &SessionKey) -> Option<Value> {
        self.selections.get(key).map(|s| s.value.clone())
    }

    fn save(&self, key: &SessionKey, selection: Value) {
        self.selections.insert(
            key.clone(),
            StoredSelection {
                value: selection,
                updated_at: Utc::now(),
            },
        );
    }

    fn remove(&self, key: &SessionKey) {
        self.selections.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_save_and_load() {
        let store = InMemorySelectionStore::new();
        let key = SessionKey::new("/cs25", "t1");
        assert!(store.load(&key).is_none());

        store.save(&key, json!({"selected_ids": ["25.1301"]}));
        assert_eq!(store.load(&key).unwrap()["selected_ids"][0], "25.1301");
        assert!(store.updated_at(&key).is_some());
    }

    #[test]
    fn test_keys_are_route_and_tab_scoped() {
        let store = InMemorySelectionStore::new();
        store.save(&SessionKey::new("/a", "t1"), json!(1));
        store.save(&SessionKey::new("/b", "t1"), json!(2));
        store.save(&SessionKey::new("/a", "t2"), json!(3));

        assert_eq!(store.len(), 3);
        assert_eq!(store.load(&SessionKey::new("/b", "t1")), Some(json!(2)));
    }

    #[test]
    fn test_overwrite_and_remove() {
        let store = InMemorySelectionStore::new();
        let key = SessionKey::new("/a", "t1");
        store.save(&key, json!({"v": 1}));
        store.save(&key, json!({"v": 2}));
        assert_eq!(store.load(&key).unwrap()["v"], 2);

        store.remove(&key);
        assert!(store.is_empty());
    }
}
