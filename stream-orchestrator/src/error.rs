//! Error types for the stream orchestrator.

use thiserror::Error;

/// Orchestrator error types
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// No tab or route could be resolved for a command
    #[error("No binding available: {0}")]
    Binding(String),

    /// Network failure before or while reading a backend response
    #[error("Transport error: {0}")]
    Transport(String),

    /// Backend answered with a non-2xx status
    #[error("Backend returned HTTP {status}: {excerpt}")]
    Protocol { status: u16, excerpt: String },

    /// Stream produced no bytes for too long
    #[error("Stream idle for {idle_sec} seconds")]
    Timeout { idle_sec: u64 },

    /// Command payload could not be interpreted
    #[error("Invalid command on channel {channel}: {message}")]
    InvalidCommand { channel: String, message: String },

    /// No async runtime available to drive a run
    #[error("Runtime unavailable: {0}")]
    Runtime(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrchestratorError {
    /// Stable error code delivered to the page and console
    pub fn error_code(&self) -> &'static str {
        match self {
            OrchestratorError::Binding(_) => "BINDING_ERROR",
            OrchestratorError::Transport(_) => "TRANSPORT_ERROR",
            OrchestratorError::Protocol { .. } => "PROTOCOL_ERROR",
            OrchestratorError::Timeout { .. } => "TIMEOUT",
            OrchestratorError::InvalidCommand { .. } => "INVALID_COMMAND",
            OrchestratorError::Runtime(_) => "RUNTIME_UNAVAILABLE",
            OrchestratorError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// HTTP status for protocol errors
    pub fn http_status(&self) -> Option<u16> {
        match self {
            OrchestratorError::Protocol { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Create error details for the terminal `error` notification
    ///
    /// Protocol failures carry the HTTP status and its mapped code under `httpCode`.
    pub fn to_error_details(&self) -> Option<serde_json::Value> {
        match self {
            OrchestratorError::Protocol { status, excerpt } => Some(serde_json::json!({
                "status": status,
                "httpCode": error_codes::from_http_status(*status as i64),
                "excerpt": excerpt,
            })),
            OrchestratorError::Timeout { idle_sec } => Some(serde_json::json!({
                "idleSec": idle_sec
            })),
            OrchestratorError::InvalidCommand { channel, .. } => Some(serde_json::json!({
                "channel": channel
            })),
            _ => None,
        }
    }

    pub fn invalid_command(channel: impl Into<String>, message: impl Into<String>) -> Self {
        OrchestratorError::InvalidCommand {
            channel: channel.into(),
            message: message.into(),
        }
    }

    /// Build a protocol error, truncating the body to `limit` characters.
    pub fn protocol(status: u16, body: &str, limit: usize) -> Self {
        OrchestratorError::Protocol {
            status,
            excerpt: excerpt(body, limit),
        }
    }
}

/// Trim and cut `body` to at most `limit` characters, on a char boundary.
pub fn excerpt(body: &str, limit: usize) -> String {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Error code mappings from backend HTTP statuses
pub mod error_codes {
    pub fn from_http_status(status: i64) -> &'static str {
        match status {
            400 => "INVALID_INPUT",
            401 => "UNAUTHORIZED",
            403 => "PERMISSION_DENIED",
            404 => "ENDPOINT_NOT_FOUND",
            408 => "TIMEOUT",
            409 => "CONFLICT",
            413 => "PAYLOAD_TOO_LARGE",
            422 => "UNPROCESSABLE_ENTITY",
            429 => "RATE_LIMITED",
            500 => "INTERNAL_ERROR",
            501 => "NOT_IMPLEMENTED",
            502 => "BAD_GATEWAY",
            503 => "SERVICE_UNAVAILABLE",
            504 => "GATEWAY_TIMEOUT",
            _ => "PROTOCOL_ERROR",
        }
    }
}
