use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{StreamConfig, StreamerError};

/// Machine-readable cause attached to Degraded and Failed states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    ConfigError,
    DisplayLost,
    SinkOverrun,
    EncoderFault,
    InternalInvariantViolation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReason {
    pub code: ReasonCode,
    pub message: String,
}

impl FailureReason {
    pub fn new(code: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<&StreamerError> for FailureReason {
    fn from(err: &StreamerError) -> Self {
        let code = match err {
            StreamerError::Config(_) | StreamerError::SessionNotFound(_) | StreamerError::SessionBusy { .. } => {
                ReasonCode::ConfigError
            }
            StreamerError::DisplayLost(_) | StreamerError::Display(_) => ReasonCode::DisplayLost,
            StreamerError::SinkOverrun(_) => ReasonCode::SinkOverrun,
            StreamerError::InvariantViolation(_) => ReasonCode::InternalInvariantViolation,
            _ => ReasonCode::EncoderFault,
        };
        Self::new(code, err.to_string())
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Degraded,
    Stopping,
    Failed(FailureReason),
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Degraded => "degraded",
            SessionState::Stopping => "stopping",
            SessionState::Failed(_) => "failed",
        }
    }

    /// Running or Degraded.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Running | SessionState::Degraded)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SessionState::Failed(_))
    }

    /// Edges of the session state machine.
    pub fn can_transition_to(&self, next: &SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Starting, Running)
                | (Starting, Idle)
                | (Starting, Stopping)
                | (Starting, Failed(_))
                | (Running, Degraded)
                | (Running, Stopping)
                | (Running, Failed(_))
                | (Degraded, Running)
                | (Degraded, Stopping)
                | (Degraded, Failed(_))
                | (Failed(_), Stopping)
                | (Stopping, Idle)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Failed(reason) => write!(f, "failed ({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// One state transition, as published to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEvent {
    pub session: String,
    pub from: SessionState,
    pub to: SessionState,
    pub at: DateTime<Utc>,
    /// Why the session is Degraded/Failed, or why a start fell back to Idle.
    pub reason: Option<FailureReason>,
}

/// Snapshot returned by status queries.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub name: String,
    pub state: SessionState,
    pub reason: Option<FailureReason>,
    pub since: DateTime<Utc>,
    /// Fresh for every start, so logs and events of separate runs of the
    /// same name can be told apart.
    pub run_id: Option<Uuid>,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub config: Option<StreamConfig>,
}

impl SessionStatus {
    pub fn idle(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: SessionState::Idle,
            reason: None,
            since: Utc::now(),
            run_id: None,
            frames_delivered: 0,
            frames_dropped: 0,
            config: None,
        }
    }
}
