//! Stream Orchestrator - session orchestration and streaming-event multiplexing for tab-bound UIs.
//!
//! This crate binds logical sessions to browser tabs, routes named commands and events between
//! the page, a debug console and a backend agent service, and consumes newline-delimited JSON
//! responses with cancellation, supersession, deduplication and rate-limited delivery.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  commands   ┌─────────────────────────────────────────┐
//! │     Page     │────────────▶│             ChannelRouter               │
//! │              │◀────────────│  handlers · binding accessor · wire log │
//! └──────────────┘ (channel,   └──────┬───────────────────────┬──────────┘
//!                   envelope)         │                       │ wire entries,
//!                                     ▼                       ▼ state changes
//!                     ┌───────────────────────────┐   ┌──────────────┐
//!                     │       RunSupervisor       │   │   Console    │
//!                     │  CancellationRegistry     │   └──────────────┘
//!                     │  run driver task per run  │
//!                     └─────────────┬─────────────┘
//!                                   │ HTTP POST, chunked NDJSON
//!                                   ▼
//!           FrameDecoder ─▶ classify ─▶ lifecycle / progress (throttled)
//!                                   └──▶ items ─▶ CoalescingBuffer ─▶ page
//! ```
//!
//! # Modules
//!
//! - `config`: Orchestrator configuration
//! - `error`: Error types
//! - `logging`: tracing subscriber setup
//! - `types`: IDs, envelopes, frames, command payloads and phases
//! - `session`: Binding registry and selection store
//! - `bus`: Channel router and wire audit trail
//! - `events`: Frame decoder, coalescing buffer and progress throttle
//! - `supervisor`: Run lifecycle and cancellation
//! - `backend`: Backend transport
//! - `orchestrator`: Composition root
//!
//! # Environment Variables
//!
//! - `ORCHESTRATOR_BACKEND_URL`: Base URL for relative endpoints (default: http://127.0.0.1:8000)
//! - `ORCHESTRATOR_WIRE_CAPACITY`: Wire entries kept for the console (default: 600)
//! - `ORCHESTRATOR_FLUSH_DELAY_MS`: Item coalescing window (default: 50)
//! - `ORCHESTRATOR_PROGRESS_MIN_INTERVAL_MS`: Progress throttle interval (default: 50)
//! - `ORCHESTRATOR_STREAM_IDLE_TIMEOUT_SEC`: Stream inactivity bound, 0 disables (default: 60)
//! - `ORCHESTRATOR_BROADCAST_CAPACITY`: Console/state subscriber depth (default: 256)
//! - `ORCHESTRATOR_EXCERPT_LIMIT`: Error body excerpt length (default: 200)
//! - `LOG_LEVEL`, `LOG_FORMAT`: Logging (default: info, plain)

pub mod backend;
pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod orchestrator;
pub mod session;
pub mod supervisor;
pub mod types;

// Re-export main types
pub use backend::{BackendRequest, BackendTransport, ByteStream, HttpBackend};
pub use bus::{BusHooks, ChannelRouter, StateChange, WireEntry, WireLog};
pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
pub use events::{decode_frames, CoalescingBuffer, Decoded, FrameDecoder, ProgressThrottle};
pub use orchestrator::Orchestrator;
pub use session::{Binding, BindingRegistry, InMemorySelectionStore, SelectionStore};
pub use supervisor::{CancellationRegistry, RunRequest, RunSettings, RunStats, RunSupervisor};
pub use types::{
    channels, Envelope, Frame, FrameKind, OrchestratorStatus, Party, RequestEvent, RunId,
    RunPhase, SessionKey, StartRun, StreamEvent, TabId,
};
