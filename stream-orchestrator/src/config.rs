//! Configuration for the stream orchestrator.

use serde::Deserialize;
use std::time::Duration;

fn default_backend_url() -> String {
    "http://127.0.0.1:8000".to_string()
}
fn default_wire_capacity() -> usize {
    600
}
fn default_flush_delay_ms() -> u64 {
    50
}
fn default_progress_min_interval_ms() -> u64 {
    50
}
fn default_stream_idle_timeout_sec() -> u64 {
    60
}
fn default_broadcast_capacity() -> usize {
    256
}
fn default_excerpt_limit() -> usize {
    200
}

/// Orchestrator configuration, loaded from `ORCHESTRATOR_*` variables.
#[derive(Clone, Debug, Deserialize)]
pub struct OrchestratorConfig {
    /// Base URL that relative run/request endpoints are joined onto
    #[serde(default = "default_backend_url")]
    pub backend_url: String,

    /// Maximum number of wire entries kept for the console
    #[serde(default = "default_wire_capacity")]
    pub wire_capacity: usize,

    /// Coalescing window for item frames
    #[serde(default = "default_flush_delay_ms")]
    pub flush_delay_ms: u64,

    /// Minimum spacing between progress deliveries per session
    #[serde(default = "default_progress_min_interval_ms")]
    pub progress_min_interval_ms: u64,

    /// Inactivity bound for a streaming run (0 disables)
    #[serde(default = "default_stream_idle_timeout_sec")]
    pub stream_idle_timeout_sec: u64,

    /// Depth of the console and state broadcast channels
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,

    /// Characters of a failed response body kept in protocol errors
    #[serde(default = "default_excerpt_limit")]
    pub excerpt_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            wire_capacity: default_wire_capacity(),
            flush_delay_ms: default_flush_delay_ms(),
            progress_min_interval_ms: default_progress_min_interval_ms(),
            stream_idle_timeout_sec: default_stream_idle_timeout_sec(),
            broadcast_capacity: default_broadcast_capacity(),
            excerpt_limit: default_excerpt_limit(),
        }
    }
}

impl OrchestratorConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        envy::prefixed("ORCHESTRATOR_")
            .from_env::<OrchestratorConfig>()
            .unwrap_or_else(|e| {
                tracing::warn!("Invalid ORCHESTRATOR_* configuration, using defaults: {}", e);
                Self::default()
            })
    }

    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }

    pub fn progress_min_interval(&self) -> Duration {
        Duration::from_millis(self.progress_min_interval_ms)
    }

    /// Idle bound for streams, `None` when disabled
    pub fn stream_idle_timeout(&self) -> Option<Duration> {
        (self.stream_idle_timeout_sec > 0)
            .then(|| Duration::from_secs(self.stream_idle_timeout_sec))
    }

    /// Resolve an endpoint against `backend_url` unless it is already absolute.
    pub fn resolve_endpoint(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return endpoint.to_string();
        }
        format!(
            "{}/{}",
            self.backend_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }
}
