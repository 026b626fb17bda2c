//! Run phases and orchestrator status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle phase of one run.
///
/// `idle -> requesting -> streaming -> {completed | aborted | errored} -> idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Requesting,
    Streaming,
    /// Serialized as `done` for the page
    #[serde(rename = "done")]
    Completed,
    Aborted,
    /// Serialized as `error` for the page
    #[serde(rename = "error")]
    Errored,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunPhase::Completed | RunPhase::Aborted | RunPhase::Errored
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, RunPhase::Requesting | RunPhase::Streaming)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Idle => "idle",
            RunPhase::Requesting => "requesting",
            RunPhase::Streaming => "streaming",
            RunPhase::Completed => "done",
            RunPhase::Aborted => "aborted",
            RunPhase::Errored => "error",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestrator-level status reported to state subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorStatus {
    #[default]
    Idle,
    Streaming,
    Cancelling,
    Error,
}
