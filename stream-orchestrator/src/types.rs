//! Shared type definitions.

pub mod envelope;
pub mod frame;
pub mod ids;
pub mod input;
pub mod state;

// Re-export commonly used types
pub use envelope::{Envelope, Party, RequestEvent, StreamEvent};
pub use frame::{Frame, FrameKind};
pub use ids::{BackendRunId, PageInstanceId, Route, RunId, SessionKey, TabId};
pub use input::{channels, ActivateTab, BindTab, RequestCommand, StartRun};
pub use state::{OrchestratorStatus, RunPhase};
