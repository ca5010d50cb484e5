use serde_json::{json, Value};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed frame or unknown message type on a session
    #[error("{0}")]
    Protocol(String),

    /// No executor/platform available, or an unknown sync/completion kind
    #[error("{0}")]
    Dispatch(String),

    #[error("Initialization failed at {step}: {message}")]
    Initialization { step: &'static str, message: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn initialization(step: &'static str, err: impl std::fmt::Display) -> Self {
        EngineError::Initialization {
            step,
            message: err.to_string(),
        }
    }

    /// Render as the `error` envelope sent back to a session.
    pub fn to_wire(&self) -> Value {
        json!({
            "type": "error",
            "message": self.to_string(),
        })
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
