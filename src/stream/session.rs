//! The per-session driver task.
//!
//! Once a session is Running, one driver owns its scheduler and encoder
//! handle and folds every signal (display events, scheduler events, health
//! ticks, the reconnect deadline, the stop request) into state transitions.
//! A fatal condition is published as Failed before the pipeline is torn down;
//! `stop()` on a Failed session waits for that teardown.

use chrono::Utc;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, Sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::scheduler::{FrameScheduler, SchedulerEvent, SchedulerStats};
use super::state::{FailureReason, ReasonCode, SessionState, SessionStatus, StatusEvent};
use crate::config::SessionPolicy;
use crate::display::{DisplayEvent, DisplayRegistry};
use crate::encoder::{EncoderHealth, EncoderProcessHandle, EncoderSupervisor};
use crate::{DisplayId, StreamConfig};

const SCHEDULER_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Publishes one session's status: the latest snapshot through a watch
/// channel, and every transition on the shared broadcast channel.
#[derive(Clone)]
pub(crate) struct StatusHandle {
    name: String,
    tx: Arc<watch::Sender<SessionStatus>>,
    events: broadcast::Sender<StatusEvent>,
}

impl StatusHandle {
    pub(crate) fn new(name: &str, events: broadcast::Sender<StatusEvent>) -> Self {
        let (tx, _) = watch::channel(SessionStatus::idle(name));
        Self {
            name: name.to_string(),
            tx: Arc::new(tx),
            events,
        }
    }

    pub(crate) fn snapshot(&self) -> SessionStatus {
        self.tx.borrow().clone()
    }

    pub(crate) fn state(&self) -> SessionState {
        self.tx.borrow().state.clone()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<SessionStatus> {
        self.tx.subscribe()
    }

    /// Apply `to` if the state machine allows it from the current state.
    /// Returns false, and changes nothing, otherwise.
    pub(crate) fn transition(&self, to: SessionState, reason: Option<FailureReason>) -> bool {
        let mut event = None;
        self.tx.send_if_modified(|status| {
            if !status.state.can_transition_to(&to) {
                return false;
            }
            let from = std::mem::replace(&mut status.state, to.clone());
            status.reason = reason.clone();
            status.since = Utc::now();
            event = Some(StatusEvent {
                session: self.name.clone(),
                from,
                to: to.clone(),
                at: status.since,
                reason: reason.clone(),
            });
            true
        });

        match event {
            Some(event) => {
                match &event.reason {
                    Some(reason) => info!("Session '{}': {} -> {} ({})", self.name, event.from, event.to, reason),
                    None => info!("Session '{}': {} -> {}", self.name, event.from, event.to),
                }
                let _ = self.events.send(event);
                true
            }
            None => {
                debug!("Session '{}': ignored transition to {} from {}", self.name, to, self.state());
                false
            }
        }
    }

    /// Update the reason shown for the current state without a transition.
    pub(crate) fn set_reason(&self, reason: Option<FailureReason>) {
        self.tx.send_if_modified(|status| {
            if status.reason == reason {
                return false;
            }
            status.reason = reason;
            true
        });
    }

    pub(crate) fn set_counters(&self, stats: &SchedulerStats) {
        self.tx.send_if_modified(|status| {
            if status.frames_delivered == stats.delivered && status.frames_dropped == stats.dropped {
                return false;
            }
            status.frames_delivered = stats.delivered;
            status.frames_dropped = stats.dropped;
            true
        });
    }

    /// Fresh run id and zeroed counters for a new start.
    pub(crate) fn begin_run(&self, config: StreamConfig) -> Uuid {
        let run_id = Uuid::new_v4();
        self.tx.send_modify(|status| {
            status.run_id = Some(run_id);
            status.config = Some(config);
            status.frames_delivered = 0;
            status.frames_dropped = 0;
        });
        run_id
    }
}

/// What the controller keeps for a session while its driver runs.
pub(crate) struct RunningSession {
    pub(crate) stop_tx: Option<oneshot::Sender<()>>,
    pub(crate) driver: JoinHandle<()>,
}

/// Everything the driver owns for the life of one run.
pub(crate) struct SessionDriver {
    pub(crate) status: StatusHandle,
    pub(crate) policy: SessionPolicy,
    pub(crate) scheduler: FrameScheduler,
    pub(crate) scheduler_events: mpsc::Receiver<SchedulerEvent>,
    pub(crate) registry: Arc<DisplayRegistry>,
    pub(crate) display_events: broadcast::Receiver<DisplayEvent>,
    /// Set for mirror sessions.
    pub(crate) display: Option<DisplayId>,
    pub(crate) supervisor: Arc<EncoderSupervisor>,
    pub(crate) encoder: Option<EncoderProcessHandle>,
}

/// Degrade causes, keyed so the same cause is never counted twice.
type Causes = BTreeMap<String, FailureReason>;

const DISPLAY_CAUSE: &str = "display";

async fn expired(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

impl SessionDriver {
    pub(crate) fn spawn(self, stop_rx: oneshot::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(stop_rx))
    }

    /// Code a failing sink maps to for this session's target.
    fn sink_fault_code(&self) -> ReasonCode {
        if self.display.is_some() {
            ReasonCode::DisplayLost
        } else {
            ReasonCode::EncoderFault
        }
    }

    async fn run(mut self, mut stop_rx: oneshot::Receiver<()>) {
        let name = self.status.name.clone();
        let mut causes = Causes::new();
        let mut reconnect_deadline: Option<Pin<Box<Sleep>>> = None;
        let mut display_events_open = self.display.is_some();
        let mut scheduler_events_open = true;

        let mut health = tokio::time::interval(self.policy.health_check_interval());
        health.set_missed_tick_behavior(MissedTickBehavior::Skip);
        health.tick().await;

        let failure = loop {
            tokio::select! {
                _ = &mut stop_rx => break None,

                event = self.display_events.recv(), if display_events_open => {
                    match event {
                        Ok(DisplayEvent::Removed(id)) if Some(id) == self.display => {
                            self.display_lost(&mut causes, &mut reconnect_deadline);
                        }
                        Ok(DisplayEvent::Added(descriptor)) if Some(descriptor.id) == self.display => {
                            self.display_restored(&mut causes, &mut reconnect_deadline);
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(missed)) => {
                            debug!("Session '{}' missed {} display events, rechecking", name, missed);
                            if let Some(id) = self.display {
                                if self.registry.is_connected(id).await {
                                    self.display_restored(&mut causes, &mut reconnect_deadline);
                                } else {
                                    self.display_lost(&mut causes, &mut reconnect_deadline);
                                }
                            }
                        }
                        Err(RecvError::Closed) => display_events_open = false,
                    }
                }

                event = self.scheduler_events.recv(), if scheduler_events_open => {
                    match event {
                        Some(event) => {
                            if let Some(reason) = self.scheduler_event(event, &mut causes, &mut reconnect_deadline) {
                                break Some(reason);
                            }
                        }
                        None => scheduler_events_open = false,
                    }
                }

                _ = health.tick() => {
                    self.status.set_counters(&self.scheduler.stats());
                    if let Some(handle) = self.encoder.as_mut() {
                        if let EncoderHealth::Unhealthy(reason) = self.supervisor.health_check(handle) {
                            break Some(FailureReason::new(ReasonCode::EncoderFault, reason));
                        }
                    }
                }

                _ = expired(&mut reconnect_deadline), if reconnect_deadline.is_some() => {
                    break Some(FailureReason::new(
                        ReasonCode::DisplayLost,
                        format!(
                            "display did not return within {:.1}s",
                            self.policy.reconnect_grace().as_secs_f64()
                        ),
                    ));
                }
            }
        };

        match failure {
            None => {
                debug!("Session '{}' driver stopping", name);
                self.teardown().await;
            }
            Some(reason) => {
                match reason.code {
                    ReasonCode::InternalInvariantViolation => error!("Session '{}' failed: {}", name, reason),
                    _ => warn!("Session '{}' failed: {}", name, reason),
                }
                // Visible before the encoder is reaped. Loses to a concurrent
                // stop(): Stopping never becomes Failed.
                self.status.transition(SessionState::Failed(reason), None);
                self.teardown().await;
            }
        }
    }

    fn display_lost(&self, causes: &mut Causes, deadline: &mut Option<Pin<Box<Sleep>>>) {
        let Some(id) = self.display else { return };
        if deadline.is_none() {
            *deadline = Some(Box::pin(tokio::time::sleep(self.policy.reconnect_grace())));
        }
        self.add_cause(
            causes,
            DISPLAY_CAUSE.to_string(),
            FailureReason::new(ReasonCode::DisplayLost, format!("display {} disconnected", id)),
        );
    }

    fn display_restored(&self, causes: &mut Causes, deadline: &mut Option<Pin<Box<Sleep>>>) {
        *deadline = None;
        self.clear_cause(causes, DISPLAY_CAUSE);
    }

    /// Returns a reason when the event is fatal for the session.
    fn scheduler_event(
        &self,
        event: SchedulerEvent,
        causes: &mut Causes,
        deadline: &mut Option<Pin<Box<Sleep>>>,
    ) -> Option<FailureReason> {
        match event {
            SchedulerEvent::SinkOverrun { sink, drop_ratio } => {
                // A sink with no display sheds every frame; that is not an overrun.
                if !causes.contains_key(DISPLAY_CAUSE) {
                    self.add_cause(
                        causes,
                        format!("overrun:{}", sink),
                        FailureReason::new(
                            ReasonCode::SinkOverrun,
                            format!("{} dropped {:.0}% of frames", sink, drop_ratio * 100.0),
                        ),
                    );
                }
            }
            SchedulerEvent::SinkRecovered { sink } => {
                self.clear_cause(causes, &format!("overrun:{}", sink));
                self.clear_cause(causes, &format!("sink:{}", sink));
            }
            SchedulerEvent::SinkFailed { sink, error } => {
                self.add_cause(
                    causes,
                    format!("sink:{}", sink),
                    FailureReason::new(self.sink_fault_code(), format!("{}: {}", sink, error)),
                );
            }
            SchedulerEvent::SourceLost { .. } => self.display_lost(causes, deadline),
            SchedulerEvent::SourceRestored { sink } => {
                self.clear_cause(causes, &format!("overrun:{}", sink));
                self.display_restored(causes, deadline);
            }
            SchedulerEvent::InvariantViolation { sink, detail } => {
                return Some(FailureReason::new(
                    ReasonCode::InternalInvariantViolation,
                    format!("{}: {}", sink, detail),
                ));
            }
        }
        None
    }

    fn add_cause(&self, causes: &mut Causes, key: String, reason: FailureReason) {
        if causes.contains_key(&key) {
            return;
        }
        causes.insert(key, reason.clone());
        if !self.status.transition(SessionState::Degraded, Some(reason.clone())) {
            self.status.set_reason(Some(reason));
        }
    }

    fn clear_cause(&self, causes: &mut Causes, key: &str) {
        if causes.remove(key).is_none() {
            return;
        }
        match causes.values().next_back() {
            Some(remaining) => self.status.set_reason(Some(remaining.clone())),
            None => {
                self.status.transition(SessionState::Running, None);
            }
        }
    }

    /// Detach the scheduler (which closes the sink), then stop the encoder.
    async fn teardown(&mut self) {
        let stats = self.scheduler.stop(SCHEDULER_STOP_TIMEOUT).await;
        self.status.set_counters(&stats);
        if let Some(handle) = self.encoder.take() {
            self.supervisor.terminate(handle).await;
        }
        info!(
            "Session '{}' released: {} frames delivered, {} dropped",
            self.status.name, stats.delivered, stats.dropped
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_publishes_event() {
        let (events, mut rx) = broadcast::channel(8);
        let status = StatusHandle::new("venue", events);

        assert!(status.transition(SessionState::Starting, None));
        assert!(!status.transition(SessionState::Degraded, None));
        assert!(status.transition(SessionState::Running, None));

        let first = rx.try_recv().unwrap();
        assert_eq!(first.from, SessionState::Idle);
        assert_eq!(first.to, SessionState::Starting);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.to, SessionState::Running);
        assert!(rx.try_recv().is_err());
        assert_eq!(status.state(), SessionState::Running);
    }

    #[test]
    fn test_reason_follows_transition() {
        let (events, _rx) = broadcast::channel(8);
        let status = StatusHandle::new("venue", events);
        status.transition(SessionState::Starting, None);
        status.transition(SessionState::Running, None);

        let lost = FailureReason::new(ReasonCode::DisplayLost, "display 2 disconnected");
        status.transition(SessionState::Degraded, Some(lost.clone()));
        assert_eq!(status.snapshot().reason, Some(lost));

        status.transition(SessionState::Running, None);
        assert_eq!(status.snapshot().reason, None);
    }

    #[test]
    fn test_stopping_never_fails() {
        let (events, _rx) = broadcast::channel(8);
        let status = StatusHandle::new("venue", events);
        status.transition(SessionState::Starting, None);
        status.transition(SessionState::Running, None);
        status.transition(SessionState::Stopping, None);

        let fault = FailureReason::new(ReasonCode::EncoderFault, "exit 3");
        assert!(!status.transition(SessionState::Failed(fault), None));
        assert_eq!(status.state(), SessionState::Stopping);
    }
}
