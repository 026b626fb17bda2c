//! Run supervision: at most one active backend run per session key.
//!
//! ```text
//! idle -> requesting -> streaming -> { done | aborted | error } -> idle
//! ```
//!
//! Each run is driven by one spawned task that processes its frames strictly in decode order.
//! The task and the abort path share the run's lock, so once `stop` (or a superseding `start`)
//! returns, no further frame of that run reaches the page. A stop issued by a page callback
//! during one of the run's own deliveries is applied as soon as that callback returns.

pub mod cancellation;
pub mod cell;
pub mod driver;
pub mod run;

pub use cancellation::{CancellationRegistry, RunHandle};
pub use cell::{RunCell, RunGuard};
pub use run::{Admission, Run, RunStats};

use crate::backend::{BackendRequest, BackendTransport};
use crate::bus::ChannelRouter;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::ProgressThrottle;
use crate::types::envelope::{run_metadata, StreamEvent};
use crate::types::ids::{RunId, SessionKey};
use crate::types::state::{OrchestratorStatus, RunPhase};
use driver::RunDriver;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Console channel receiving per-run stats when a run ends
pub const RUN_END_CONSOLE_CHANNEL: &str = "run.end";
/// Console channel receiving transport, protocol and timeout failures
pub const RUN_ERROR_CONSOLE_CHANNEL: &str = "run.error";

/// Timing knobs for run drivers
#[derive(Debug, Clone, Copy)]
pub struct RunSettings {
    pub flush_delay: Duration,
    pub idle_timeout: Option<Duration>,
}

impl From<&OrchestratorConfig> for RunSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            flush_delay: config.flush_delay(),
            idle_timeout: config.stream_idle_timeout(),
        }
    }
}

/// Everything needed to start one run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub session_key: SessionKey,
    pub run_id: RunId,
    pub sink: Option<String>,
    pub request: BackendRequest,
}

#[derive(Clone)]
pub struct RunSupervisor {
    bus: Arc<ChannelRouter>,
    transport: Arc<dyn BackendTransport>,
    registry: Arc<CancellationRegistry>,
    throttle: Arc<ProgressThrottle>,
    settings: RunSettings,
}

impl RunSupervisor {
    pub fn new(
        bus: Arc<ChannelRouter>,
        transport: Arc<dyn BackendTransport>,
        throttle: ProgressThrottle,
        settings: RunSettings,
    ) -> Self {
        Self {
            bus,
            transport,
            registry: Arc::new(CancellationRegistry::new()),
            throttle: Arc::new(throttle),
            settings,
        }
    }

    pub fn registry(&self) -> &CancellationRegistry {
        &self.registry
    }

    pub fn is_active(&self, key: &SessionKey) -> bool {
        self.registry.contains(key)
    }

    pub fn active_run_id(&self, key: &SessionKey) -> Option<RunId> {
        self.registry.active_run_id(key)
    }

    /// Start a run, aborting whatever run the session already has.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, request: RunRequest) -> Result<RunId> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| OrchestratorError::Runtime(e.to_string()))?;

        let RunRequest {
            session_key,
            run_id,
            sink,
            request,
        } = request;

        let run = Arc::new(RunCell::new(Run::new(
            run_id.clone(),
            session_key.clone(),
            sink,
        )));
        let token = CancellationToken::new();
        let handle = RunHandle {
            run_id: run_id.clone(),
            token: token.clone(),
            run: run.clone(),
        };

        if let Some(previous) = self.registry.install(session_key.clone(), handle) {
            tracing::info!(
                "run {} superseded by {} on {}",
                previous.run_id,
                run_id,
                session_key
            );
            self.abort_run(previous, "superseded");
        }

        tracing::info!("starting run {} on {} -> {}", run_id, session_key, request.url);
        self.bus
            .set_status(OrchestratorStatus::Streaming, Some(session_key.clone()));
        let live = {
            let mut guard = run.lock();
            self.emit(&mut guard, StreamEvent::phase(RunPhase::Requesting))
        };
        if !live {
            tracing::debug!("run {} stopped before its driver started", run_id);
            return Ok(run_id);
        }

        let driver = RunDriver::new(self.clone(), run, token, request);
        runtime.spawn(driver.drive());
        Ok(run_id)
    }

    /// Abort the session's active run. Returns `false` when nothing was running.
    pub fn stop(&self, key: &SessionKey) -> bool {
        let Some(handle) = self.registry.take(key) else {
            tracing::debug!("stop on {} with no active run", key);
            return false;
        };
        self.bus
            .set_status(OrchestratorStatus::Cancelling, Some(key.clone()));
        let aborted = self.abort_run(handle, "stopped");
        self.settle_status(key);
        aborted
    }

    /// Abort every active run, e.g. on shutdown.
    pub fn stop_all(&self) -> usize {
        self.registry
            .session_keys()
            .iter()
            .filter(|key| self.stop(key))
            .count()
    }

    /// Cancel the network read, then mark the run aborted under its lock.
    ///
    /// Called from a page callback inside one of the run's own deliveries, the abort is parked
    /// and applied by the lock holder once the callback returns.
    fn abort_run(&self, handle: RunHandle, reason: &str) -> bool {
        handle.token.cancel();
        if handle.run.held_here() {
            tracing::debug!("run {} abort parked until its delivery returns", handle.run_id);
            return handle.run.park_abort(reason);
        }
        let mut run = handle.run.lock();
        self.abort_locked(&mut run, reason)
    }

    fn abort_locked(&self, run: &mut RunGuard<'_>, reason: &str) -> bool {
        if run.phase().is_terminal() {
            return false;
        }
        run.abort();
        self.throttle.forget(&run.session_key);
        tracing::info!("run {} aborted ({})", run.run_id, reason);
        self.emit(
            run,
            StreamEvent::Phase {
                phase: RunPhase::Aborted,
                message: Some(reason.to_string()),
                code: None,
                details: None,
            },
        );
        self.report_end(run);
        true
    }

    /// Idle once no session has an active run.
    fn settle_status(&self, key: &SessionKey) {
        let status = if self.registry.is_empty() {
            OrchestratorStatus::Idle
        } else {
            OrchestratorStatus::Streaming
        };
        self.bus.set_status(status, Some(key.clone()));
    }

    /// Deliver a stream event for `run` on its page channel.
    ///
    /// Returns `false` when the page aborted the run during the delivery; the abort has then
    /// been applied and the caller must deliver nothing more for this run.
    fn emit(&self, run: &mut RunGuard<'_>, event: StreamEvent) -> bool {
        run.sync_finished();
        self.send_event(run, event);
        match run.take_parked_abort() {
            Some(reason) => {
                self.abort_locked(run, &reason);
                false
            }
            None => true,
        }
    }

    fn send_event(&self, run: &Run, event: StreamEvent) {
        let payload = match serde_json::to_value(&event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("cannot serialize {} for run {}: {}", event.label(), run.run_id, e);
                return;
            }
        };
        self.bus.send_to_page(
            run.page_channel(),
            payload,
            Some(run_metadata(&run.session_key, &run.run_id)),
            &event.label(),
        );
    }

    /// Log the run's stats and hand them to the console.
    fn report_end(&self, run: &Run) {
        tracing::info!(
            "run {} on {} ended {}: {:?}",
            run.run_id,
            run.session_key,
            run.phase(),
            run.stats
        );
        self.bus.send_to_console(
            RUN_END_CONSOLE_CHANNEL,
            json!({
                "runId": run.run_id,
                "sessionKey": run.session_key,
                "phase": run.phase(),
                "backendRunId": run.backend_run_id(),
                "stats": run.stats,
            }),
            &format!("run {} {}", run.run_id, run.phase()),
        );
    }

    /// Release the registry entry of a run that ended on its own.
    fn release(&self, run: &Run, failed: bool) {
        self.throttle.forget(&run.session_key);
        self.report_end(run);
        self.registry.remove_if(&run.session_key, &run.run_id);
        if failed {
            self.bus
                .set_status(OrchestratorStatus::Error, Some(run.session_key.clone()));
        } else {
            self.settle_status(&run.session_key);
        }
    }
}
