//! Command payloads accepted on the inbound channels.

use crate::error::{OrchestratorError, Result};
use crate::types::envelope::Envelope;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound command channels.
pub mod channels {
    pub const RUN_START: &str = "run.start";
    pub const RUN_STOP: &str = "run.stop";
    pub const REQUEST: &str = "request";
    pub const SELECTION_UPDATE: &str = "selection.update";
    pub const TAB_BIND: &str = "tab.bind";
    pub const TAB_ACTIVATE: &str = "tab.activate";

    /// Page channel used when a run names no sink
    pub const DEFAULT_STREAM: &str = "stream";
    /// Page channel carrying a restored selection after bind
    pub const SELECTION_RESTORE: &str = "selection.restore";
    /// Console channel for notes that never reach the page
    pub const CONSOLE_NOTE: &str = "console.note";
}

/// `run.start` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRun {
    /// Endpoint path (joined onto the backend URL) or absolute URL
    pub endpoint: String,
    /// Logical consumer; frames tagged with another sink are ignored
    #[serde(default)]
    pub sink: Option<String>,
    /// Business body, e.g. `{ "query": ... }` or `{ "payload": ..., "metadata": ... }`
    #[serde(default)]
    pub body: Value,
    /// Send the stored selection as `context`
    #[serde(default)]
    pub include_selection: bool,
}

impl StartRun {
    pub fn new(endpoint: impl Into<String>, body: Value) -> Self {
        Self {
            endpoint: endpoint.into(),
            sink: None,
            body,
            include_selection: false,
        }
    }

    pub fn with_sink(mut self, sink: impl Into<String>) -> Self {
        self.sink = Some(sink.into());
        self
    }

    /// Page channel that receives this run's deliveries
    pub fn page_channel(&self) -> &str {
        self.sink.as_deref().unwrap_or(channels::DEFAULT_STREAM)
    }
}

/// `request` payload for non-streaming request/response flows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestCommand {
    pub endpoint: String,
    /// Page channel for the started/success/error envelopes
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub body: Value,
}

/// `tab.bind` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindTab {
    pub tab_id: String,
    pub route: String,
}

/// `tab.activate` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivateTab {
    pub tab_id: String,
}

/// Decode an envelope payload into a command type.
pub fn parse_command<T: DeserializeOwned>(envelope: &Envelope) -> Result<T> {
    serde_json::from_value(envelope.payload.clone())
        .map_err(|e| OrchestratorError::invalid_command(&envelope.channel, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_run() {
        let env = Envelope::command(
            channels::RUN_START,
            serde_json::json!({
                "endpoint": "/cs25/needs_panel/run/stream",
                "sink": "needs_panel",
                "body": {"payload": {"query": "heat exchanger"}},
            }),
        );
        let cmd: StartRun = parse_command(&env).unwrap();
        assert_eq!(cmd.endpoint, "/cs25/needs_panel/run/stream");
        assert_eq!(cmd.page_channel(), "needs_panel");
        assert!(!cmd.include_selection);
    }

    #[test]
    fn test_default_page_channel() {
        let cmd = StartRun::new("/run", Value::Null);
        assert_eq!(cmd.page_channel(), channels::DEFAULT_STREAM);
    }

    #[test]
    fn test_parse_invalid_command() {
        let env = Envelope::command(channels::RUN_START, serde_json::json!({"sink": 1}));
        let err = parse_command::<StartRun>(&env).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_COMMAND");
    }
}
