//! Classification of decoded backend frames.
//!
//! Frames arrive either bare (`{"type":"run_start","tab_id":...}`) or wrapped in the
//! `{type, tab_id, payload, metadata}` envelope. Field lookups check the top level first and
//! then the nested `payload`, `data` and `metadata` objects.

use crate::types::ids::BackendRunId;
use serde_json::Value;

/// Fields an item may carry as its natural identifier, in lookup order.
const ITEM_KEY_FIELDS: [&str; 5] = ["trace_uuid", "id", "need_id", "uuid", "key"];

const NESTED: [&str; 3] = ["payload", "data", "metadata"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// `run_start` / `*.runStart`
    RunStart,
    /// `run_end` / `*.runEnd`
    RunEnd,
    /// `progress` / `batch_progress` / `*.progress` / `*.batchProgress`
    Progress,
    /// One streamed result
    Item,
    /// Several streamed results in one frame
    ItemsBatch,
    /// Backend reports it stopped the run
    Aborted,
    /// Backend reports a failure inside the run
    Error,
    /// Keep-alive
    Ping,
    Other,
}

impl FrameKind {
    pub fn from_type(t: &str) -> Self {
        let suffix = t.rsplit_once('.').map(|(_, s)| s);
        match (t, suffix) {
            ("ping", _) => FrameKind::Ping,
            ("run_start", _) | (_, Some("runStart")) => FrameKind::RunStart,
            ("run_end", _) | (_, Some("runEnd")) => FrameKind::RunEnd,
            ("progress" | "batch_progress", _) | (_, Some("progress" | "batchProgress")) => {
                FrameKind::Progress
            }
            ("item" | "item_done", _) | (_, Some("item" | "itemDone")) => FrameKind::Item,
            ("items_done", _) | (_, Some("itemsBatch")) => FrameKind::ItemsBatch,
            ("aborted", _) | (_, Some("aborted")) => FrameKind::Aborted,
            ("error", _) | (_, Some("error")) => FrameKind::Error,
            _ => FrameKind::Other,
        }
    }
}

/// One decoded frame with its kind resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    value: Value,
    kind: FrameKind,
}

impl Frame {
    pub fn classify(value: Value) -> Self {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .map(FrameKind::from_type)
            .unwrap_or(FrameKind::Other);
        Self { value, kind }
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn type_name(&self) -> &str {
        self.value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    /// Prefix of a namespaced type (`needsTables` for `needsTables.runEnd`); `None` when bare
    pub fn namespace(&self) -> Option<&str> {
        self.type_name().rsplit_once('.').map(|(ns, _)| ns)
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    /// Look a field up at the top level, then in the nested objects.
    fn field(&self, name: &str) -> Option<&Value> {
        if let Some(v) = self.value.get(name) {
            return Some(v);
        }
        NESTED
            .iter()
            .filter_map(|n| self.value.get(*n))
            .find_map(|nested| nested.get(name))
    }

    fn first_str(&self, names: &[&str]) -> Option<&str> {
        names
            .iter()
            .find_map(|n| self.field(n))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn backend_run_id(&self) -> Option<BackendRunId> {
        self.first_str(&["run_id", "runId"]).map(BackendRunId::new)
    }

    /// Logical consumer tag (`sink`, or `context` when it is a plain string)
    pub fn sink(&self) -> Option<&str> {
        self.first_str(&["sink", "context"])
    }

    pub fn tab_id(&self) -> Option<&str> {
        self.first_str(&["tab_id", "tabId"])
    }

    pub fn counter(&self, name: &str) -> Option<u64> {
        let v = self.field(name)?;
        v.as_u64()
            .or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
    }

    /// `(done, total)` carried by the frame, either may be missing
    pub fn progress(&self) -> (Option<u64>, Option<u64>) {
        (self.counter("done"), self.counter("total"))
    }

    /// Streamed results carried by an item or batch frame.
    pub fn items(&self) -> Vec<Value> {
        match self.kind {
            FrameKind::Item => self
                .field("item")
                .cloned()
                .map(|item| vec![item])
                .unwrap_or_default(),
            FrameKind::ItemsBatch => self
                .field("items")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    pub fn error_message(&self) -> Option<String> {
        self.first_str(&["message", "error"]).map(str::to_string)
    }
}

/// Natural identifier of an item, falling back to its canonical JSON text.
pub fn item_key(item: &Value) -> String {
    ITEM_KEY_FIELDS
        .iter()
        .filter_map(|f| item.get(*f))
        .find_map(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| item.to_string())
}
