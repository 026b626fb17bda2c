//! Envelopes: the unit of communication on every bus channel.

use crate::types::ids::{RunId, SessionKey};
use crate::types::state::RunPhase;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Party on either end of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Party {
    Page,
    Console,
    Backend,
    Orchestrator,
    PersistentStore,
}

/// `{ from, to, channel, payload, metadata? }`
///
/// Handlers and subscribers only ever see `&Envelope` or a clone of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: Party,
    pub to: Party,
    pub channel: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Envelope {
    pub fn new(from: Party, to: Party, channel: impl Into<String>, payload: Value) -> Self {
        Self {
            from,
            to,
            channel: channel.into(),
            payload,
            metadata: None,
        }
    }

    /// Command sent by the page to the orchestrator
    pub fn command(channel: impl Into<String>, payload: Value) -> Self {
        Self::new(Party::Page, Party::Orchestrator, channel, payload)
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// String-valued metadata field
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.as_ref()?.get(key)?.as_str()
    }

    /// Tab explicitly targeted by this envelope, if any
    pub fn tab_id(&self) -> Option<&str> {
        self.metadata_str("tabId")
    }
}

/// Metadata attached to every page delivery belonging to a run.
pub fn run_metadata(key: &SessionKey, run_id: &RunId) -> Value {
    serde_json::json!({
        "runId": run_id,
        "route": key.route,
        "tabId": key.tab_id,
    })
}

/// Payload of page deliveries for streaming runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Raw backend frame, forwarded with its own `type`
    Frame { frame: Value },
    /// Coalesced item frames
    Items { items: Vec<Value> },
    /// Throttled progress counters
    Progress {
        done: u64,
        total: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    /// Lifecycle transition; terminal phases are delivered exactly once
    Phase {
        phase: RunPhase,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
}

impl StreamEvent {
    pub fn phase(phase: RunPhase) -> Self {
        StreamEvent::Phase {
            phase,
            message: None,
            code: None,
            details: None,
        }
    }

    pub fn label(&self) -> String {
        match self {
            StreamEvent::Frame { frame } => format!(
                "frame {}",
                frame.get("type").and_then(Value::as_str).unwrap_or("?")
            ),
            StreamEvent::Items { items } => format!("items x{}", items.len()),
            StreamEvent::Progress { done, total, .. } => format!("progress {}/{}", done, total),
            StreamEvent::Phase { phase, .. } => format!("phase {}", phase),
        }
    }
}

/// `metadata.event` values for non-streaming request/response flows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestEvent {
    Started,
    Progress,
    Success,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_party_serialization() {
        assert_eq!(
            serde_json::to_string(&Party::PersistentStore).unwrap(),
            "\"persistent-store\""
        );
        assert_eq!(serde_json::to_string(&Party::Page).unwrap(), "\"page\"");
    }

    #[test]
    fn test_envelope_metadata_access() {
        let env = Envelope::command("run.stop", Value::Null)
            .with_metadata(serde_json::json!({"tabId": "t9"}));
        assert_eq!(env.tab_id(), Some("t9"));
        assert_eq!(env.from, Party::Page);
        assert_eq!(env.to, Party::Orchestrator);
        assert!(env.metadata_str("missing").is_none());
    }

    #[test]
    fn test_stream_event_shape() {
        let event = StreamEvent::Progress {
            done: 3,
            total: 10,
            source: Some("needsTables.progress".to_string()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "progress");
        assert_eq!(json["done"], 3);
        assert_eq!(json["source"], "needsTables.progress");

        let phase = serde_json::to_value(StreamEvent::phase(RunPhase::Aborted)).unwrap();
        assert_eq!(phase["kind"], "phase");
        assert_eq!(phase["phase"], "aborted");
        assert!(phase.get("message").is_none());
    }

    #[test]
    fn test_run_metadata() {
        let key = SessionKey::new("/r", "t1");
        let meta = run_metadata(&key, &RunId::new("run_1"));
        assert_eq!(meta["runId"], "run_1");
        assert_eq!(meta["route"], "/r");
        assert_eq!(meta["tabId"], "t1");
    }
}
