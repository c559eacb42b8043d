use async_trait::async_trait;
use image::RgbaImage;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::{DisplayDescriptor, DisplayMode, Geometry, Resolution, Result, StreamerError};

/// Where and how a mirror window is laid out on its display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowPlacement {
    pub title: String,
    pub geometry: Geometry,
    pub fullscreen: bool,
    pub decorations: bool,
}

impl WindowPlacement {
    pub fn for_mode(display: &DisplayDescriptor, mode: DisplayMode, resolution: Resolution, title: &str) -> Self {
        let area = display.geometry;
        let (geometry, fullscreen, decorations) = match mode {
            DisplayMode::Fullscreen => (area, true, false),
            DisplayMode::Mirror => (area, false, false),
            DisplayMode::Extend => (
                Geometry::new(area.x, area.y, resolution.width, resolution.height),
                false,
                true,
            ),
            DisplayMode::Windowed { width, height } => {
                (area.centered(width.min(area.width), height.min(area.height)), false, true)
            }
        };
        Self {
            title: title.to_string(),
            geometry,
            fullscreen,
            decorations,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.geometry.width, self.geometry.height)
    }
}

/// A display-bound surface a mirror sink presents into.
pub trait OutputSurface: Send {
    fn size(&self) -> (u32, u32);

    /// Hand an image of exactly `size()` to the surface. `Ok(false)` means the
    /// surface was still busy with the previous image and this one was dropped.
    fn present(&mut self, image: RgbaImage) -> Result<bool>;

    /// Release the surface. Safe to call more than once.
    fn close(&mut self);
}

#[async_trait]
pub trait SurfaceFactory: Send + Sync {
    async fn open(&self, placement: WindowPlacement) -> Result<Box<dyn OutputSurface>>;
}

#[derive(Default)]
struct HeadlessState {
    opened: usize,
    closed: usize,
    presented: u64,
    placements: Vec<WindowPlacement>,
    last: Option<RgbaImage>,
    present_delay: Duration,
}

/// Surfaces that only record what they were given. Used by `--headless`
/// runs and tests.
#[derive(Clone, Default)]
pub struct HeadlessSurfaceFactory {
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessSurfaceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every present take `delay`, to simulate a slow output. Applies
    /// to surfaces already open.
    pub fn set_present_delay(&self, delay: Duration) {
        self.lock().present_delay = delay;
    }

    pub fn open_surfaces(&self) -> usize {
        let state = self.lock();
        state.opened - state.closed
    }

    pub fn presented(&self) -> u64 {
        self.lock().presented
    }

    pub fn placements(&self) -> Vec<WindowPlacement> {
        self.lock().placements.clone()
    }

    pub fn last_image(&self) -> Option<RgbaImage> {
        self.lock().last.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HeadlessState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SurfaceFactory for HeadlessSurfaceFactory {
    async fn open(&self, placement: WindowPlacement) -> Result<Box<dyn OutputSurface>> {
        {
            let mut state = self.lock();
            state.opened += 1;
            state.placements.push(placement.clone());
        }
        Ok(Box::new(HeadlessSurface {
            size: placement.size(),
            factory: self.clone(),
            closed: false,
        }))
    }
}

struct HeadlessSurface {
    size: (u32, u32),
    factory: HeadlessSurfaceFactory,
    closed: bool,
}

impl OutputSurface for HeadlessSurface {
    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn present(&mut self, image: RgbaImage) -> Result<bool> {
        if self.closed {
            return Err(StreamerError::Display("surface closed".into()));
        }
        let delay = self.factory.lock().present_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let mut state = self.factory.lock();
        state.presented += 1;
        state.last = Some(image);
        Ok(true)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.factory.lock().closed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DisplayId;

    fn display() -> DisplayDescriptor {
        DisplayDescriptor {
            id: DisplayId(2),
            label: "HDMI-1".into(),
            geometry: Geometry::new(1920, 0, 1920, 1080),
            is_primary: false,
            connected: true,
        }
    }

    #[test]
    fn test_placement_per_mode() {
        let res = Resolution::new(1280, 720);

        let full = WindowPlacement::for_mode(&display(), DisplayMode::Fullscreen, res, "t");
        assert!(full.fullscreen);
        assert_eq!(full.geometry, display().geometry);

        let mirror = WindowPlacement::for_mode(&display(), DisplayMode::Mirror, res, "t");
        assert!(!mirror.fullscreen && !mirror.decorations);
        assert_eq!(mirror.size(), (1920, 1080));

        let extend = WindowPlacement::for_mode(&display(), DisplayMode::Extend, res, "t");
        assert_eq!(extend.geometry, Geometry::new(1920, 0, 1280, 720));

        let windowed = WindowPlacement::for_mode(
            &display(),
            DisplayMode::Windowed { width: 800, height: 600 },
            res,
            "t",
        );
        assert_eq!(windowed.geometry, Geometry::new(2480, 240, 800, 600));
    }

    #[test]
    fn test_windowed_clamped_to_display() {
        let placement = WindowPlacement::for_mode(
            &display(),
            DisplayMode::Windowed { width: 4000, height: 3000 },
            Resolution::new(1280, 720),
            "t",
        );
        assert_eq!(placement.geometry, display().geometry);
    }

    #[tokio::test]
    async fn test_headless_surface_records_and_closes_once() {
        let factory = HeadlessSurfaceFactory::new();
        let placement = WindowPlacement::for_mode(&display(), DisplayMode::Extend, Resolution::new(4, 2), "t");
        let mut surface = factory.open(placement).await.unwrap();
        assert_eq!(surface.size(), (4, 2));
        assert_eq!(factory.open_surfaces(), 1);

        assert!(surface.present(RgbaImage::new(4, 2)).unwrap());
        assert_eq!(factory.presented(), 1);

        surface.close();
        surface.close();
        assert_eq!(factory.open_surfaces(), 0);
        assert!(surface.present(RgbaImage::new(4, 2)).is_err());
    }
}
