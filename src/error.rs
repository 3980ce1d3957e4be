//! Error taxonomy for the agent.
//!
//! Request-validation problems in model-issued actions are deliberately absent
//! here: they become `{error: ...}` action results that the model can read.

use std::time::Duration;

/// Failure reported by the browser capability.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrowserError {
    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("{op} failed: {message}")]
    Operation { op: &'static str, message: String },
}

impl BrowserError {
    pub fn op(op: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Operation {
            op,
            message: err.to_string(),
        }
    }
}

/// Failure of a single model call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelError {
    /// Quota or rate limiting; may carry a server-suggested delay.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// The service is shedding load (503).
    #[error("model service unavailable: {0}")]
    Overloaded(String),

    #[error("model request rejected ({status}): {message}")]
    Request { status: u16, message: String },

    #[error("model authentication failed: {0}")]
    Auth(String),

    #[error("model transport error: {0}")]
    Transport(String),

    #[error("could not decode model response: {0}")]
    Decode(String),

    #[error("model client misconfigured: {0}")]
    Config(String),
}

impl ModelError {
    /// Transient quota/backpressure errors. Everything else fails fast.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Overloaded(_))
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Short classification string for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Overloaded(_) => "overloaded",
            Self::Request { .. } => "invalid_request",
            Self::Auth(_) => "auth",
            Self::Transport(_) => "transport",
            Self::Decode(_) => "decode",
            Self::Config(_) => "config",
        }
    }
}

/// Fatal outcome of dispatching an action call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("unsupported action: {0}")]
    UnknownAction(String),
}

/// Failure of the speech-to-text service.
#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    #[error("speech-to-text request failed: {0}")]
    Transport(String),

    #[error("speech-to-text service returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("invalid audio upload: {0}")]
    InvalidUpload(String),
}

/// Errors surfaced by the agent control entry points.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Agent already running")]
    AlreadyRunning,

    #[error("Agent not running")]
    NotRunning,

    #[error("Agent is still shutting down")]
    ShuttingDown,

    #[error("failed to spawn agent worker: {0}")]
    Spawn(#[from] std::io::Error),
}
