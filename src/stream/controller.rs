use dashmap::DashMap;
use secrecy::SecretString;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tracing::{info, warn};

use super::scheduler::{FrameScheduler, FrameSink, SchedulerConfig};
use super::session::{RunningSession, SessionDriver, StatusHandle};
use super::sink::{EncoderSink, OutputSink, WindowMirrorSink};
use super::state::{FailureReason, SessionState, SessionStatus, StatusEvent};
use super::validate;
use crate::config::SessionPolicy;
use crate::display::{DisplayRegistry, SurfaceFactory};
use crate::encoder::{EncoderCommand, EncoderSupervisor, EncoderTarget};
use crate::media::FrameSource;
use crate::secrets::CredentialStore;
use crate::{DisplayDescriptor, DisplayId, Result, StreamConfig, StreamTarget, StreamerError};

const STATUS_CHANNEL_CAPACITY: usize = 256;
const SCHEDULER_EVENT_CAPACITY: usize = 64;

/// Collaborators every session draws on.
pub struct ControllerParts {
    pub registry: Arc<DisplayRegistry>,
    pub surfaces: Arc<dyn SurfaceFactory>,
    pub supervisor: Arc<EncoderSupervisor>,
    pub credentials: Arc<dyn CredentialStore>,
    pub source: Arc<dyn FrameSource>,
    pub policy: SessionPolicy,
}

struct SessionEntry {
    status: StatusHandle,
    /// Serializes start/stop for one name; holds the driver while it runs.
    control: Mutex<Option<RunningSession>>,
}

struct Inner {
    parts: ControllerParts,
    sessions: DashMap<String, Arc<SessionEntry>>,
    status_tx: broadcast::Sender<StatusEvent>,
}

/// What `start` resolved during validation.
enum Binding {
    Display(DisplayId),
    Encoder(EncoderCommand),
}

/// One state machine per named stream.
///
/// Cheap to clone; every clone drives the same sessions, so `stop` can be
/// called from any task.
#[derive(Clone)]
pub struct StreamSessionController {
    inner: Arc<Inner>,
}

impl StreamSessionController {
    pub fn new(parts: ControllerParts) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                parts,
                sessions: DashMap::new(),
                status_tx,
            }),
        }
    }

    fn entry(&self, name: &str) -> Arc<SessionEntry> {
        self.inner
            .sessions
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(SessionEntry {
                    status: StatusHandle::new(name, self.inner.status_tx.clone()),
                    control: Mutex::new(None),
                })
            })
            .clone()
    }

    fn existing(&self, name: &str) -> Option<Arc<SessionEntry>> {
        self.inner.sessions.get(name).map(|e| e.value().clone())
    }

    /// Validate `config` and bring the session up. Configuration problems
    /// are returned before the session leaves Idle; a failure while
    /// building the pipeline returns the session to Idle with the reason
    /// recorded.
    pub async fn start(&self, config: StreamConfig) -> Result<()> {
        let entry = self.entry(&config.name);
        let mut control = entry.control.lock().await;

        let state = entry.status.state();
        if state != SessionState::Idle {
            return Err(StreamerError::SessionBusy {
                name: config.name.clone(),
                state: state.to_string(),
            });
        }

        let binding = match self.validate(&config).await {
            Ok(binding) => binding,
            Err(e) => {
                warn!("Rejected config for '{}': {}", config.name, e);
                entry.status.set_reason(Some(FailureReason::from(&e)));
                return Err(e);
            }
        };

        let run_id = entry.status.begin_run(config.clone());
        info!("Starting '{}' (run {}, {} target)", config.name, run_id, config.target.kind());
        entry.status.transition(SessionState::Starting, None);

        match self.launch(&entry, &config, binding).await {
            Ok(running) => {
                *control = Some(running);
                Ok(())
            }
            Err(e) => {
                warn!("Session '{}' failed to start: {}", config.name, e);
                entry.status.transition(SessionState::Idle, Some(FailureReason::from(&e)));
                Err(e)
            }
        }
    }

    async fn validate(&self, config: &StreamConfig) -> Result<Binding> {
        validate::check_config(config)?;
        let parts = &self.inner.parts;

        match &config.target {
            StreamTarget::Mirror { display_id, .. } => {
                if !parts.registry.is_connected(*display_id).await {
                    return Err(StreamerError::Config(format!("display {} is not connected", display_id)));
                }
                Ok(Binding::Display(*display_id))
            }
            StreamTarget::Network { .. } => {
                let target = self.encoder_target(config)?;
                Ok(Binding::Encoder(parts.supervisor.prepare(config, &target)?))
            }
        }
    }

    fn encoder_target(&self, config: &StreamConfig) -> Result<EncoderTarget> {
        let StreamTarget::Network { uri, credentials_ref } = &config.target else {
            return Err(StreamerError::InvariantViolation(format!(
                "'{}' has no network target",
                config.name
            )));
        };
        let key: SecretString = self
            .inner
            .parts
            .credentials
            .resolve(credentials_ref)
            .ok_or_else(|| StreamerError::Config(format!("no stream key found for '{}'", credentials_ref)))?;
        Ok(EncoderTarget::new(uri.clone(), key))
    }

    /// Starting: build the sink (and encoder), attach the scheduler, hand
    /// everything to a driver.
    async fn launch(&self, entry: &SessionEntry, config: &StreamConfig, binding: Binding) -> Result<RunningSession> {
        let parts = &self.inner.parts;
        let (events_tx, events_rx) = mpsc::channel(SCHEDULER_EVENT_CAPACITY);
        // Subscribe before the sink exists so no display change is missed.
        let display_events = parts.registry.subscribe();

        let (sink, display, encoder) = match binding {
            Binding::Display(display_id) => {
                let StreamTarget::Mirror { mode, .. } = config.target else {
                    return Err(StreamerError::InvariantViolation("display binding without mirror target".into()));
                };
                let sink = WindowMirrorSink::open(
                    &config.name,
                    display_id,
                    mode,
                    config.resolution,
                    parts.registry.clone(),
                    parts.surfaces.clone(),
                    events_tx.clone(),
                )
                .await?;
                (OutputSink::Window(sink), Some(display_id), None)
            }
            Binding::Encoder(command) => {
                let (handle, input) = parts.supervisor.launch(config, command).await?;
                let sink = EncoderSink::new(&config.name, config.resolution, input);
                (OutputSink::Encoder(sink), None, Some(handle))
            }
        };

        let sinks: Vec<Box<dyn FrameSink>> = vec![Box::new(sink)];
        let scheduler = FrameScheduler::start(
            SchedulerConfig::new(config.frame_interval(), &parts.policy),
            parts.source.clone(),
            sinks,
            events_tx,
        );

        entry.status.transition(SessionState::Running, None);

        let (stop_tx, stop_rx) = oneshot::channel();
        let driver = SessionDriver {
            status: entry.status.clone(),
            policy: parts.policy.clone(),
            scheduler,
            scheduler_events: events_rx,
            registry: parts.registry.clone(),
            display_events,
            display,
            supervisor: parts.supervisor.clone(),
            encoder,
        }
        .spawn(stop_rx);

        Ok(RunningSession {
            stop_tx: Some(stop_tx),
            driver,
        })
    }

    /// Tear the session down and return it to Idle. Idempotent: stopping an
    /// Idle session is a no-op. Bounded by the policy's stop timeout.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let entry = self
            .existing(name)
            .ok_or_else(|| StreamerError::SessionNotFound(name.to_string()))?;
        let mut control = entry.control.lock().await;

        if entry.status.state() == SessionState::Idle {
            return Ok(());
        }

        entry.status.transition(SessionState::Stopping, None);

        if let Some(mut running) = control.take() {
            if let Some(stop) = running.stop_tx.take() {
                // Already gone if the driver ended on a failure.
                let _ = stop.send(());
            }
            let abort = running.driver.abort_handle();
            match tokio::time::timeout(self.inner.parts.policy.stop_timeout(), running.driver).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Session '{}' driver ended abnormally: {}", name, e),
                Err(_) => {
                    warn!("Session '{}' did not stop within {:?}, aborting", name, self.inner.parts.policy.stop_timeout());
                    abort.abort();
                }
            }
        }

        entry.status.transition(SessionState::Idle, None);
        Ok(())
    }

    /// Stop every session that is not Idle.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.inner.sessions.iter().map(|e| e.key().clone()).collect();
        let stops = names.iter().map(|name| self.stop(name));
        for (name, result) in names.iter().zip(futures::future::join_all(stops).await) {
            if let Err(e) = result {
                warn!("Failed to stop '{}' during shutdown: {}", name, e);
            }
        }
        info!("All sessions stopped");
    }

    pub fn status(&self, name: &str) -> Option<SessionStatus> {
        self.existing(name).map(|entry| entry.status.snapshot())
    }

    pub fn state(&self, name: &str) -> Option<SessionState> {
        self.existing(name).map(|entry| entry.status.state())
    }

    pub fn statuses(&self) -> Vec<SessionStatus> {
        let mut all: Vec<SessionStatus> = self.inner.sessions.iter().map(|e| e.value().status.snapshot()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Every transition of every session, in order per session.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.status_tx.subscribe()
    }

    /// Live snapshot of one session, created on first use.
    pub fn watch(&self, name: &str) -> watch::Receiver<SessionStatus> {
        self.entry(name).status.watch()
    }

    pub async fn list_displays(&self) -> Vec<DisplayDescriptor> {
        self.inner.parts.registry.list_displays().await
    }

    pub fn registry(&self) -> &Arc<DisplayRegistry> {
        &self.inner.parts.registry
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.inner.parts.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::{HeadlessSurfaceFactory, VirtualBackend};
    use crate::encoder::{EncoderCommandBuilder, FfmpegCommand};
    use crate::media::{FrameSlot, PixelFormat};
    use crate::secrets::StaticCredentials;
    use crate::stream::ReasonCode;
    use crate::{DisplayMode, EncoderPreset, Geometry, Resolution, StartError};
    use std::time::Duration;

    struct Shell(&'static str);

    impl EncoderCommandBuilder for Shell {
        fn build(&self, _: &StreamConfig, _: &EncoderTarget) -> std::result::Result<EncoderCommand, StartError> {
            Ok(EncoderCommand::new("sh", vec!["-c".into(), self.0.into()]))
        }
    }

    fn policy() -> SessionPolicy {
        SessionPolicy {
            reconnect_grace_ms: 500,
            overrun_window_ms: 200,
            health_check_interval_ms: 50,
            startup_probe_ms: 50,
            terminate_grace_ms: 200,
            stop_timeout_ms: 3_000,
            ..SessionPolicy::default()
        }
    }

    async fn controller(builder: Arc<dyn EncoderCommandBuilder>) -> (StreamSessionController, VirtualBackend) {
        let backend = VirtualBackend::new();
        backend.plug("eDP-1", "Built-in", Geometry::new(0, 0, 64, 36), true);
        backend.plug("HDMI-1", "Venue", Geometry::new(64, 0, 64, 36), false);
        let registry = Arc::new(DisplayRegistry::new(Arc::new(backend.clone()), Duration::from_secs(30)));
        registry.refresh().await;

        let slot = FrameSlot::new();
        slot.publish(16, 16, PixelFormat::Rgba8, vec![90u8; 16 * 16 * 4]).unwrap();
        let mut credentials = StaticCredentials::new();
        credentials.insert("key1", "abcd-efgh");

        let policy = policy();
        let controller = StreamSessionController::new(ControllerParts {
            registry,
            surfaces: Arc::new(HeadlessSurfaceFactory::new()),
            supervisor: Arc::new(EncoderSupervisor::new(builder, policy.clone())),
            credentials: Arc::new(credentials),
            source: Arc::new(slot),
            policy,
        });
        (controller, backend)
    }

    fn mirror(name: &str, display: u32) -> StreamConfig {
        StreamConfig {
            name: name.into(),
            target: StreamTarget::Mirror {
                display_id: DisplayId(display),
                mode: DisplayMode::Fullscreen,
            },
            resolution: Resolution::new(64, 36),
            frame_rate: 30,
            video_bitrate: 4000,
            audio_bitrate: 128,
            encoder_preset: EncoderPreset::Veryfast,
        }
    }

    fn network(name: &str, key: &str) -> StreamConfig {
        StreamConfig {
            target: StreamTarget::Network {
                uri: "rtmp://example/live2".into(),
                credentials_ref: key.into(),
            },
            ..mirror(name, 2)
        }
    }

    #[tokio::test]
    async fn test_rejects_unknown_display_without_leaving_idle() {
        let (controller, _) = controller(Arc::new(Shell("cat > /dev/null"))).await;
        let mut events = controller.subscribe();

        let err = controller.start(mirror("venue", 7)).await.unwrap_err();
        assert!(err.is_config());
        assert_eq!(controller.state("venue"), Some(SessionState::Idle));
        assert_eq!(controller.status("venue").unwrap().reason.unwrap().code, ReasonCode::ConfigError);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rejects_unresolvable_credentials() {
        let (controller, _) = controller(Arc::new(Shell("cat > /dev/null"))).await;
        let err = controller.start(network("yt-live", "nope")).await.unwrap_err();
        assert!(err.is_config());
        assert_eq!(controller.state("yt-live"), Some(SessionState::Idle));
    }

    #[tokio::test]
    async fn test_missing_encoder_binary_stays_idle() {
        let builder = FfmpegCommand::new(crate::config::EncoderSettings {
            ffmpeg_path: Some("/nonexistent/ffmpeg".into()),
            ..Default::default()
        });
        let (controller, _) = controller(Arc::new(builder)).await;
        let mut events = controller.subscribe();

        let err = controller.start(network("yt-live", "key1")).await.unwrap_err();
        assert!(matches!(err, StreamerError::Start(StartError::BinaryMissing(_))));
        assert_eq!(controller.state("yt-live"), Some(SessionState::Idle));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_twice_is_busy() {
        let (controller, _) = controller(Arc::new(Shell("cat > /dev/null"))).await;
        controller.start(mirror("venue", 2)).await.unwrap();
        let err = controller.start(mirror("venue", 2)).await.unwrap_err();
        assert!(matches!(err, StreamerError::SessionBusy { .. }));
        controller.stop("venue").await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_unknown_session() {
        let (controller, _) = controller(Arc::new(Shell("cat > /dev/null"))).await;
        assert!(matches!(
            controller.stop("ghost").await,
            Err(StreamerError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_early_exit_returns_to_idle_with_reason() {
        let (controller, _) = controller(Arc::new(Shell("echo 'bad url' >&2; exit 1"))).await;
        let err = controller.start(network("yt-live", "key1")).await.unwrap_err();
        assert!(matches!(err, StreamerError::Start(StartError::ExitedEarly { .. })));

        let status = controller.status("yt-live").unwrap();
        assert_eq!(status.state, SessionState::Idle);
        assert_eq!(status.reason.unwrap().code, ReasonCode::EncoderFault);
    }

    #[tokio::test]
    async fn test_statuses_sorted_by_name() {
        let (controller, _) = controller(Arc::new(Shell("cat > /dev/null"))).await;
        controller.start(mirror("b-side", 2)).await.unwrap();
        controller.start(mirror("a-side", 1)).await.unwrap();

        let names: Vec<String> = controller.statuses().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["a-side", "b-side"]);
        controller.shutdown().await;
        assert!(controller.statuses().iter().all(|s| s.state == SessionState::Idle));
    }
}
