//! Bounded audit trail of bus traffic.

use crate::types::envelope::Envelope;
use crate::types::ids::SessionKey;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// One audit record. Observability only, never consulted for control flow.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<SessionKey>,
    pub human_label: String,
    #[serde(flatten)]
    pub envelope: Envelope,
}

/// Ring buffer of wire entries; the oldest entry is evicted past capacity.
#[derive(Debug)]
pub struct WireLog {
    entries: Mutex<VecDeque<WireEntry>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl WireLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn append(
        &self,
        envelope: Envelope,
        session_key: Option<SessionKey>,
        human_label: impl Into<String>,
    ) -> WireEntry {
        let entry = WireEntry {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
            session_key,
            human_label: human_label.into(),
            envelope,
        };
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.push_back(entry.clone());
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        entry
    }

    /// All retained entries, oldest first
    pub fn snapshot(&self) -> Vec<WireEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().cloned().collect()
    }

    /// Retained entries with an id greater than `since_id`
    pub fn since(&self, since_id: u64) -> Vec<WireEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .filter(|e| e.id > since_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::envelope::Party;
    use serde_json::json;

    fn envelope(n: u64) -> Envelope {
        Envelope::new(Party::Orchestrator, Party::Page, "test", json!({ "n": n }))
    }

    #[test]
    fn test_append_assigns_increasing_ids() {
        let log = WireLog::new(10);
        let a = log.append(envelope(1), None, "one");
        let b = log.append(envelope(2), Some(SessionKey::new("/r", "t1")), "two");
        assert!(b.id > a.id);
        assert_eq!(log.len(), 2);
        assert_eq!(log.snapshot()[1].human_label, "two");
    }

    #[test]
    fn test_evicts_oldest_past_capacity() {
        let log = WireLog::new(3);
        for n in 0..5 {
            log.append(envelope(n), None, format!("entry {}", n));
        }
        let entries = log.snapshot();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].envelope.payload["n"], 2);
        assert_eq!(entries[2].envelope.payload["n"], 4);
    }

    #[test]
    fn test_since() {
        let log = WireLog::new(10);
        let first = log.append(envelope(1), None, "a");
        log.append(envelope(2), None, "b");
        log.append(envelope(3), None, "c");
        assert_eq!(log.since(first.id).len(), 2);
        assert!(log.since(u64::MAX).is_empty());
    }

    #[test]
    fn test_entry_serialization_flattens_envelope() {
        let log = WireLog::new(10);
        let entry = log.append(envelope(7), Some(SessionKey::new("/r", "t1")), "label");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["channel"], "test");
        assert_eq!(json["from"], "orchestrator");
        assert_eq!(json["humanLabel"], "label");
        assert_eq!(json["sessionKey"]["tabId"], "t1");
    }

    #[test]
    fn test_zero_capacity_keeps_one() {
        let log = WireLog::new(0);
        log.append(envelope(1), None, "a");
        log.append(envelope(2), None, "b");
        assert_eq!(log.len(), 1);
        assert_eq!(log.capacity(), 1);
        log.clear();
        assert!(log.is_empty());
    }
}
