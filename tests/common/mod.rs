#![allow(dead_code)]

use q8_streamer::config::SessionPolicy;
use q8_streamer::display::{DisplayRegistry, HeadlessSurfaceFactory, VirtualBackend};
use q8_streamer::encoder::{EncoderCommand, EncoderCommandBuilder, EncoderSupervisor, EncoderTarget};
use q8_streamer::media::{FrameSlot, PixelFormat};
use q8_streamer::secrets::StaticCredentials;
use q8_streamer::stream::{ControllerParts, SessionState, SessionStatus, StreamSessionController};
use q8_streamer::{
    DisplayId, DisplayMode, EncoderPreset, Geometry, Resolution, StartError, StreamConfig, StreamTarget,
};
use std::sync::Arc;
use std::time::Duration;

/// Stands in for ffmpeg: runs `sh -c <script>`.
pub struct Shell(pub &'static str);

impl EncoderCommandBuilder for Shell {
    fn build(&self, _: &StreamConfig, _: &EncoderTarget) -> Result<EncoderCommand, StartError> {
        Ok(EncoderCommand::new("sh", vec!["-c".into(), self.0.into()]))
    }
}

pub const HEALTHY_ENCODER: &str = "cat > /dev/null";

pub fn policy() -> SessionPolicy {
    SessionPolicy {
        reconnect_grace_ms: 2_000,
        overrun_window_ms: 250,
        health_check_interval_ms: 50,
        liveness_window_ms: 10_000,
        startup_probe_ms: 50,
        terminate_grace_ms: 200,
        stop_timeout_ms: 3_000,
        ..SessionPolicy::default()
    }
}

pub struct Harness {
    pub controller: StreamSessionController,
    pub backend: VirtualBackend,
    pub registry: Arc<DisplayRegistry>,
    pub surfaces: HeadlessSurfaceFactory,
    pub slot: FrameSlot,
}

impl Harness {
    pub async fn new(builder: Arc<dyn EncoderCommandBuilder>) -> Self {
        Self::with_policy(builder, policy()).await
    }

    /// Built-in panel as display 1, the venue screen as display 2.
    pub async fn with_policy(builder: Arc<dyn EncoderCommandBuilder>, policy: SessionPolicy) -> Self {
        let backend = VirtualBackend::new();
        backend.plug("eDP-1", "Built-in", Geometry::new(0, 0, 1280, 800), true);
        backend.plug("HDMI-1", "Venue", Geometry::new(1280, 0, 1920, 1080), false);
        let registry = Arc::new(DisplayRegistry::new(Arc::new(backend.clone()), Duration::from_secs(30)));
        registry.refresh().await;

        let slot = FrameSlot::new();
        slot.publish(32, 18, PixelFormat::Rgba8, vec![120u8; 32 * 18 * 4])
            .expect("valid frame");

        let mut credentials = StaticCredentials::new();
        credentials.insert("key1", "abcd-efgh-ijkl");

        let surfaces = HeadlessSurfaceFactory::new();
        let controller = StreamSessionController::new(ControllerParts {
            registry: registry.clone(),
            surfaces: Arc::new(surfaces.clone()),
            supervisor: Arc::new(EncoderSupervisor::new(builder, policy.clone())),
            credentials: Arc::new(credentials),
            source: Arc::new(slot.clone()),
            policy,
        });

        Self {
            controller,
            backend,
            registry,
            surfaces,
            slot,
        }
    }

    pub async fn unplug_venue(&self) {
        self.backend.unplug("HDMI-1");
        self.registry.refresh().await;
    }

    pub async fn replug_venue(&self) {
        self.backend.plug("HDMI-1", "Venue", Geometry::new(1280, 0, 1920, 1080), false);
        self.registry.refresh().await;
    }

    /// Wait until the session's state satisfies `pred`, or panic.
    pub async fn wait_for(
        &self,
        name: &str,
        timeout: Duration,
        pred: impl Fn(&SessionState) -> bool,
    ) -> SessionStatus {
        let mut rx = self.controller.watch(name);
        let result = tokio::time::timeout(timeout, rx.wait_for(|status| pred(&status.state))).await;
        match result {
            Ok(Ok(status)) => status.clone(),
            _ => panic!(
                "session '{}' still {} after {:?}",
                name,
                self.controller.status(name).map(|s| s.state.to_string()).unwrap_or_default(),
                timeout
            ),
        }
    }
}

pub fn mirror_config(name: &str, display: u32, mode: DisplayMode) -> StreamConfig {
    StreamConfig {
        name: name.into(),
        target: StreamTarget::Mirror {
            display_id: DisplayId(display),
            mode,
        },
        resolution: Resolution::new(1920, 1080),
        frame_rate: 60,
        video_bitrate: 8000,
        audio_bitrate: 128,
        encoder_preset: EncoderPreset::Ultrafast,
    }
}

pub fn network_config(name: &str, credentials_ref: &str) -> StreamConfig {
    StreamConfig {
        name: name.into(),
        target: StreamTarget::Network {
            uri: "rtmp://example/live2".into(),
            credentials_ref: credentials_ref.into(),
        },
        resolution: Resolution::new(64, 36),
        frame_rate: 60,
        video_bitrate: 8000,
        audio_bitrate: 128,
        encoder_preset: EncoderPreset::Ultrafast,
    }
}
