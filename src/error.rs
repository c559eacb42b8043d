use thiserror::Error;

use crate::DisplayId;

pub type Result<T> = std::result::Result<T, StreamerError>;

#[derive(Error, Debug)]
pub enum StreamerError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Display {0} lost")]
    DisplayLost(DisplayId),

    #[error("Sink overrun: {0}")]
    SinkOverrun(String),

    #[error("Encoder failed to start: {0}")]
    Start(#[from] StartError),

    #[error("Encoder fault: {0}")]
    EncoderFault(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Session '{0}' not found")]
    SessionNotFound(String),

    #[error("Session '{name}' is {state}; stop it first")]
    SessionBusy { name: String, state: String },

    #[error("Display error: {0}")]
    Display(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config file error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl StreamerError {
    /// Errors a caller can fix by changing the request rather than retrying.
    pub fn is_config(&self) -> bool {
        matches!(self, StreamerError::Config(_))
    }
}

/// Why the external encoder could not be brought up.
#[derive(Error, Debug)]
pub enum StartError {
    #[error("encoder binary not found: {0}")]
    BinaryMissing(String),

    #[error("failed to spawn encoder: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("encoder exited during startup ({status}): {stderr}")]
    ExitedEarly { status: String, stderr: String },

    #[error("encoder input pipe unavailable")]
    PipeUnavailable,
}

impl From<String> for StreamerError {
    fn from(s: String) -> Self {
        StreamerError::Unknown(s)
    }
}

impl From<&str> for StreamerError {
    fn from(s: &str) -> Self {
        StreamerError::Unknown(s.to_string())
    }
}
