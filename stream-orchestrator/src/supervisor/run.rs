//! Bookkeeping for one backend run.

use crate::types::frame::{item_key, Frame, FrameKind};
use crate::types::ids::{BackendRunId, RunId, SessionKey};
use crate::types::input::channels;
use crate::types::state::RunPhase;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;

/// Per-run instrumentation, logged when the run ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub frames_decoded: u64,
    pub frames_applied: u64,
    pub malformed_lines: u64,
    pub stale_run_drops: u64,
    pub foreign_drops: u64,
    pub duplicate_items: u64,
    pub batches_flushed: u64,
    pub progress_suppressed: u64,
}

/// Whether a frame belongs to the run it was decoded for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    /// Carries a backend run id other than the one this run learned
    StaleRun,
    /// Tagged for another sink or tab
    Foreign,
}

#[derive(Debug)]
pub struct Run {
    pub run_id: RunId,
    pub session_key: SessionKey,
    sink: Option<String>,
    backend_run_id: Option<BackendRunId>,
    seen_ids: HashSet<String>,
    total: Option<u64>,
    done: u64,
    phase: RunPhase,
    error_message: Option<String>,
    /// Namespace of the `runStart` that opened the run; `Some(None)` for a bare `run_start`
    opened_by: Option<Option<String>>,
    pub stats: RunStats,
}

impl Run {
    pub fn new(run_id: RunId, session_key: SessionKey, sink: Option<String>) -> Self {
        Self {
            run_id,
            session_key,
            sink,
            backend_run_id: None,
            seen_ids: HashSet::new(),
            total: None,
            done: 0,
            phase: RunPhase::Requesting,
            error_message: None,
            opened_by: None,
            stats: RunStats::default(),
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: RunPhase) {
        self.phase = phase;
    }

    pub fn sink(&self) -> Option<&str> {
        self.sink.as_deref()
    }

    /// Page channel receiving this run's deliveries
    pub fn page_channel(&self) -> &str {
        self.sink.as_deref().unwrap_or(channels::DEFAULT_STREAM)
    }

    pub fn backend_run_id(&self) -> Option<&BackendRunId> {
        self.backend_run_id.as_ref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn record_error(&mut self, message: Option<String>) {
        self.error_message = Some(message.unwrap_or_else(|| "backend reported an error".to_string()));
    }

    /// `(done, total)` as reported to the page; total is 0 while unknown
    pub fn progress(&self) -> (u64, u64) {
        (self.done, self.total.unwrap_or(0))
    }

    pub fn seen_count(&self) -> usize {
        self.seen_ids.len()
    }

    /// Check a frame against the run's sink, tab and backend run id.
    ///
    /// The first lifecycle frame carrying a backend run id fixes it for the rest of the run.
    pub fn admit(&mut self, frame: &Frame) -> Admission {
        if frame
            .tab_id()
            .is_some_and(|tab| tab != self.session_key.tab_id.as_str())
        {
            self.stats.foreign_drops += 1;
            return Admission::Foreign;
        }
        if let (Some(frame_sink), Some(sink)) = (frame.sink(), self.sink.as_deref()) {
            if frame_sink != sink {
                self.stats.foreign_drops += 1;
                return Admission::Foreign;
            }
        }
        let Some(id) = frame.backend_run_id() else {
            return Admission::Accept;
        };
        if let Some(known) = &self.backend_run_id {
            if *known != id {
                self.stats.stale_run_drops += 1;
                return Admission::StaleRun;
            }
            return Admission::Accept;
        }
        if matches!(frame.kind(), FrameKind::RunStart | FrameKind::RunEnd) {
            tracing::debug!("run {} learned backend run id {}", self.run_id, id);
            self.backend_run_id = Some(id);
        }
        Admission::Accept
    }

    /// Whether a lifecycle frame is the run's own rather than a step nested inside it.
    ///
    /// The first `runStart` fixes the run's namespace (bare or `<ns>.`). Later lifecycle frames
    /// in another namespace belong to nested steps. Before any start, every lifecycle frame is
    /// the run's own.
    pub fn owns_lifecycle(&mut self, frame: &Frame) -> bool {
        let namespace = frame.namespace();
        if let Some(opened) = &self.opened_by {
            return opened.as_deref() == namespace;
        }
        if frame.kind() == FrameKind::RunStart {
            self.opened_by = Some(namespace.map(str::to_string));
        }
        true
    }

    /// Fold progress counters in, keeping `done` non-decreasing and never above a known total.
    ///
    /// A total smaller than the progress already reported is raised to it instead.
    pub fn apply_progress(&mut self, done: Option<u64>, total: Option<u64>) -> (u64, u64) {
        if let Some(t) = total {
            let t = t.max(self.done);
            self.total = Some(self.total.map_or(t, |current| current.max(t)));
        }
        if let Some(d) = done {
            let d = self.total.map_or(d, |t| d.min(t));
            self.done = self.done.max(d);
        }
        self.progress()
    }

    /// Keep only items not seen before in this run; each fresh item advances `done`.
    pub fn record_items(&mut self, items: Vec<Value>) -> Vec<Value> {
        let mut fresh = Vec::with_capacity(items.len());
        for item in items {
            if self.seen_ids.insert(item_key(&item)) {
                fresh.push(item);
            } else {
                self.stats.duplicate_items += 1;
            }
        }
        if !fresh.is_empty() {
            let seen = self.seen_ids.len() as u64;
            self.apply_progress(Some(seen), None);
        }
        fresh
    }

    /// Final counters for a completed run: `done == total`.
    pub fn complete(&mut self) -> (u64, u64) {
        let total = self.total.unwrap_or(self.done).max(self.done);
        self.total = Some(total);
        self.done = total;
        (total, total)
    }

    /// Drop everything learned so far and mark the run aborted.
    pub fn abort(&mut self) {
        self.seen_ids.clear();
        self.phase = RunPhase::Aborted;
    }
}
