//! One live cancellation token per session key.

use crate::supervisor::cell::RunCell;
use crate::types::ids::{RunId, SessionKey};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Registry entry for the active run of a session.
#[derive(Clone)]
pub struct RunHandle {
    pub run_id: RunId,
    pub token: CancellationToken,
    pub run: Arc<RunCell>,
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.run_id)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct CancellationRegistry {
    entries: DashMap<SessionKey, RunHandle>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handle` as the active run, returning the run it replaces.
    ///
    /// The caller owns cancelling the returned handle.
    pub fn install(&self, key: SessionKey, handle: RunHandle) -> Option<RunHandle> {
        self.entries.insert(key, handle)
    }

    /// Release the entry only if it still belongs to `run_id`.
    ///
    /// A finished run must not evict the run that superseded it.
    pub fn remove_if(&self, key: &SessionKey, run_id: &RunId) -> Option<RunHandle> {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(entry) if entry.get().run_id == *run_id => Some(entry.remove()),
            _ => None,
        }
    }

    pub fn take(&self, key: &SessionKey) -> Option<RunHandle> {
        self.entries.remove(key).map(|(_, handle)| handle)
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn active_run_id(&self, key: &SessionKey) -> Option<RunId> {
        self.entries.get(key).map(|h| h.run_id.clone())
    }

    pub fn session_keys(&self) -> Vec<SessionKey> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::run::Run;

    fn handle(key: &SessionKey, run_id: &str) -> RunHandle {
        let run_id = RunId::new(run_id);
        RunHandle {
            run_id: run_id.clone(),
            token: CancellationToken::new(),
            run: Arc::new(RunCell::new(Run::new(run_id, key.clone(), None))),
        }
    }

    #[test]
    fn test_install_returns_previous() {
        let registry = CancellationRegistry::new();
        let key = SessionKey::new("/r", "t1");

        assert!(registry.install(key.clone(), handle(&key, "run_1")).is_none());
        let previous = registry
            .install(key.clone(), handle(&key, "run_2"))
            .unwrap();
        assert_eq!(previous.run_id.as_str(), "run_1");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.active_run_id(&key).unwrap().as_str(), "run_2");
    }

    #[test]
    fn test_remove_if_ignores_superseded_run() {
        let registry = CancellationRegistry::new();
        let key = SessionKey::new("/r", "t1");
        registry.install(key.clone(), handle(&key, "run_1"));
        registry.install(key.clone(), handle(&key, "run_2"));

        assert!(registry.remove_if(&key, &RunId::new("run_1")).is_none());
        assert!(registry.contains(&key));
        assert!(registry.remove_if(&key, &RunId::new("run_2")).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_keys_isolate_tabs_on_same_route() {
        let registry = CancellationRegistry::new();
        let a = SessionKey::new("/r", "t1");
        let b = SessionKey::new("/r", "t2");
        registry.install(a.clone(), handle(&a, "run_a"));
        registry.install(b.clone(), handle(&b, "run_b"));

        let taken = registry.take(&a).unwrap();
        assert_eq!(taken.run_id.as_str(), "run_a");
        assert!(!registry.contains(&a));
        assert!(registry.contains(&b));
    }
}
