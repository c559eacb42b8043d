//! Named stream sessions: validation, the session state machine, and the
//! scheduler/sink pipeline each session owns.

pub mod controller;
pub mod scheduler;
mod session;
pub mod sink;
pub mod state;
pub mod validate;

pub use controller::{ControllerParts, StreamSessionController};
pub use scheduler::{FrameScheduler, FrameSink, SchedulerConfig, SchedulerEvent, SchedulerStats, SubmitOutcome};
pub use sink::{EncoderSink, OutputSink, WindowMirrorSink};
pub use state::{FailureReason, ReasonCode, SessionState, SessionStatus, StatusEvent};
