use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::scheduler::{notify, FrameSink, SchedulerEvent, SubmitOutcome};
use crate::display::{DisplayRegistry, OutputSurface, SurfaceFactory, WindowPlacement};
use crate::encoder::{EncoderInput, WriteOutcome};
use crate::media::Frame;
use crate::render;
use crate::{DisplayId, DisplayMode, Resolution, Result, StreamerError};

/// Where a session's frames go.
pub enum OutputSink {
    Window(WindowMirrorSink),
    Encoder(EncoderSink),
}

#[async_trait]
impl FrameSink for OutputSink {
    fn name(&self) -> &str {
        match self {
            OutputSink::Window(sink) => sink.name(),
            OutputSink::Encoder(sink) => sink.name(),
        }
    }

    async fn submit(&mut self, frame: Frame) -> Result<SubmitOutcome> {
        match self {
            OutputSink::Window(sink) => sink.submit(frame).await,
            OutputSink::Encoder(sink) => sink.submit(frame).await,
        }
    }

    async fn close(&mut self) {
        match self {
            OutputSink::Window(sink) => sink.close().await,
            OutputSink::Encoder(sink) => sink.close().await,
        }
    }
}

/// Presents frames in a window bound to one display.
pub struct WindowMirrorSink {
    name: String,
    display_id: DisplayId,
    mode: DisplayMode,
    resolution: Resolution,
    registry: Arc<DisplayRegistry>,
    factory: Arc<dyn SurfaceFactory>,
    surface: Option<Box<dyn OutputSurface>>,
    events: mpsc::Sender<SchedulerEvent>,
    source_lost: bool,
    closed: bool,
}

impl WindowMirrorSink {
    pub async fn open(
        session: &str,
        display_id: DisplayId,
        mode: DisplayMode,
        resolution: Resolution,
        registry: Arc<DisplayRegistry>,
        factory: Arc<dyn SurfaceFactory>,
        events: mpsc::Sender<SchedulerEvent>,
    ) -> Result<Self> {
        let mut sink = Self {
            name: format!("{}/window", session),
            display_id,
            mode,
            resolution,
            registry,
            factory,
            surface: None,
            events,
            source_lost: false,
            closed: false,
        };
        sink.surface = Some(sink.open_surface().await?);
        Ok(sink)
    }

    async fn open_surface(&mut self) -> Result<Box<dyn OutputSurface>> {
        let display = self
            .registry
            .get(self.display_id)
            .await
            .filter(|d| d.connected)
            .ok_or(StreamerError::DisplayLost(self.display_id))?;
        let title = format!("q8-streamer: {}", self.name);
        let placement = WindowPlacement::for_mode(&display, self.mode, self.resolution, &title);
        let display_name = display.display_name();
        info!("Opening mirror window on {} ({:?})", display_name, self.mode);
        self.factory.open(placement).await
    }

    fn release_surface(&mut self) {
        if let Some(mut surface) = self.surface.take() {
            surface.close();
        }
    }
}

#[async_trait]
impl FrameSink for WindowMirrorSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&mut self, frame: Frame) -> Result<SubmitOutcome> {
        if self.closed {
            return Err(StreamerError::InvariantViolation(format!("{} used after close", self.name)));
        }

        if !self.registry.is_connected(self.display_id).await {
            if !self.source_lost {
                self.source_lost = true;
                notify(&self.events, SchedulerEvent::SourceLost { sink: self.name.clone() });
            }
            return Ok(SubmitOutcome::NoOutput);
        }

        if self.source_lost {
            // Re-place the window now that the display is back.
            self.release_surface();
            self.surface = Some(self.open_surface().await?);
            self.source_lost = false;
            notify(&self.events, SchedulerEvent::SourceRestored { sink: self.name.clone() });
        }

        let mut surface = match self.surface.take() {
            Some(surface) => surface,
            None => self.open_surface().await?,
        };
        let (width, height) = surface.size();

        let (surface, presented) = tokio::task::spawn_blocking(move || {
            let presented = render::letterbox(&frame, width, height).and_then(|image| surface.present(image));
            (surface, presented)
        })
        .await
        .map_err(|e| StreamerError::Render(format!("present task failed: {}", e)))?;
        self.surface = Some(surface);

        Ok(if presented? {
            SubmitOutcome::Accepted
        } else {
            SubmitOutcome::Dropped
        })
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.release_surface();
            debug!("{} closed", self.name);
        }
    }
}

/// Streams frames as raw RGB24 into the encoder's stdin.
pub struct EncoderSink {
    name: String,
    resolution: Resolution,
    input: EncoderInput,
}

impl EncoderSink {
    pub fn new(session: &str, resolution: Resolution, input: EncoderInput) -> Self {
        Self {
            name: format!("{}/encoder", session),
            resolution,
            input,
        }
    }
}

#[async_trait]
impl FrameSink for EncoderSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&mut self, frame: Frame) -> Result<SubmitOutcome> {
        let Resolution { width, height } = self.resolution;
        let bytes = tokio::task::spawn_blocking(move || render::to_rgb24(&frame, width, height))
            .await
            .map_err(|e| StreamerError::Render(format!("convert task failed: {}", e)))??;

        Ok(match self.input.write_frame(bytes).await? {
            WriteOutcome::Written => SubmitOutcome::Accepted,
            WriteOutcome::Dropped => SubmitOutcome::Dropped,
        })
    }

    async fn close(&mut self) {
        if !self.input.is_closed() {
            self.input.close().await;
            debug!("{} closed", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::{HeadlessSurfaceFactory, VirtualBackend};
    use crate::media::PixelFormat;
    use crate::Geometry;
    use std::time::Duration;

    async fn setup() -> (VirtualBackend, Arc<DisplayRegistry>, HeadlessSurfaceFactory) {
        let backend = VirtualBackend::new();
        backend.plug("eDP-1", "Built-in", Geometry::new(0, 0, 64, 36), true);
        backend.plug("HDMI-1", "Venue", Geometry::new(64, 0, 32, 18), false);
        let registry = Arc::new(DisplayRegistry::new(Arc::new(backend.clone()), Duration::from_secs(30)));
        registry.refresh().await;
        (backend, registry, HeadlessSurfaceFactory::new())
    }

    fn frame(seq: u64) -> Frame {
        Frame::new(seq, 16, 9, PixelFormat::Rgba8, vec![200u8; 16 * 9 * 4]).unwrap()
    }

    #[tokio::test]
    async fn test_window_sink_letterboxes_into_surface() {
        let (_backend, registry, factory) = setup().await;
        let (tx, _rx) = mpsc::channel(8);
        let mut sink = WindowMirrorSink::open(
            "venue",
            DisplayId(2),
            DisplayMode::Fullscreen,
            Resolution::new(32, 18),
            registry,
            Arc::new(factory.clone()),
            tx,
        )
        .await
        .unwrap();

        assert_eq!(sink.submit(frame(1)).await.unwrap(), SubmitOutcome::Accepted);
        assert_eq!(factory.last_image().unwrap().dimensions(), (32, 18));
        assert_eq!(factory.placements()[0].geometry, Geometry::new(64, 0, 32, 18));

        sink.close().await;
        sink.close().await;
        assert_eq!(factory.open_surfaces(), 0);
    }

    #[tokio::test]
    async fn test_window_sink_reports_source_lost_once() {
        let (backend, registry, factory) = setup().await;
        let (tx, mut rx) = mpsc::channel(8);
        let mut sink = WindowMirrorSink::open(
            "venue",
            DisplayId(2),
            DisplayMode::Mirror,
            Resolution::new(32, 18),
            registry.clone(),
            Arc::new(factory.clone()),
            tx,
        )
        .await
        .unwrap();

        backend.unplug("HDMI-1");
        registry.refresh().await;
        for seq in 1..=3 {
            assert_eq!(sink.submit(frame(seq)).await.unwrap(), SubmitOutcome::NoOutput);
        }
        assert!(matches!(rx.try_recv().unwrap(), SchedulerEvent::SourceLost { .. }));
        assert!(rx.try_recv().is_err());

        backend.plug("HDMI-1", "Venue", Geometry::new(64, 0, 32, 18), false);
        registry.refresh().await;
        assert_eq!(sink.submit(frame(4)).await.unwrap(), SubmitOutcome::Accepted);
        assert!(matches!(rx.try_recv().unwrap(), SchedulerEvent::SourceRestored { .. }));
        // The window was re-placed on the returning display.
        assert_eq!(factory.placements().len(), 2);
        assert_eq!(factory.open_surfaces(), 1);
    }

    #[tokio::test]
    async fn test_window_sink_needs_connected_display() {
        let (_backend, registry, factory) = setup().await;
        let (tx, _rx) = mpsc::channel(8);
        let result = WindowMirrorSink::open(
            "venue",
            DisplayId(9),
            DisplayMode::Mirror,
            Resolution::new(32, 18),
            registry,
            Arc::new(factory),
            tx,
        )
        .await;
        assert!(matches!(result, Err(StreamerError::DisplayLost(DisplayId(9)))));
    }
}
