use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::media::{FrameSlot, PixelFormat, ProducerHandle};
use crate::{Resolution, Result};

const BARS: [[u8; 3]; 8] = [
    [235, 235, 235],
    [235, 235, 16],
    [16, 235, 235],
    [16, 235, 16],
    [235, 16, 235],
    [235, 16, 16],
    [16, 16, 235],
    [16, 16, 16],
];

const MARKER_WIDTH: u32 = 16;

/// Colour-bar slate with a marker sweeping across the bottom strip, one step
/// per frame. Stands in for the renderer when nothing else feeds the slot.
pub struct TestPattern {
    width: u32,
    height: u32,
    base: Vec<u8>,
    counter: u64,
}

impl TestPattern {
    pub fn new(resolution: Resolution) -> Self {
        let (width, height) = (resolution.width.max(1), resolution.height.max(1));
        let strip_top = height * 3 / 4;
        let mut base = Vec::with_capacity(width as usize * height as usize * 4);
        for y in 0..height {
            for x in 0..width {
                let rgb = if y < strip_top {
                    BARS[(x as usize * BARS.len()) / width as usize]
                } else {
                    [40, 40, 40]
                };
                base.extend_from_slice(&[rgb[0], rgb[1], rgb[2], 255]);
            }
        }
        Self {
            width,
            height,
            base,
            counter: 0,
        }
    }

    /// Horizontal marker position for the next frame.
    pub fn marker_x(&self) -> u32 {
        let travel = self.width.saturating_sub(MARKER_WIDTH).max(1) as u64;
        ((self.counter * 8) % travel) as u32
    }

    /// Render the next frame as RGBA bytes.
    pub fn next_frame(&mut self) -> Vec<u8> {
        let mut pixels = self.base.clone();
        let x0 = self.marker_x();
        let x1 = (x0 + MARKER_WIDTH).min(self.width);
        let strip_top = self.height * 3 / 4;
        for y in strip_top..self.height {
            for x in x0..x1 {
                let i = ((y * self.width + x) * 4) as usize;
                pixels[i..i + 4].copy_from_slice(&[255, 255, 255, 255]);
            }
        }
        self.counter += 1;
        pixels
    }

    /// Publish frames into `slot` at `frame_rate` on a background thread.
    pub fn spawn(resolution: Resolution, frame_rate: u32, slot: FrameSlot) -> Result<ProducerHandle> {
        let mut pattern = TestPattern::new(resolution);
        let period = Duration::from_secs(1) / frame_rate.max(1);
        info!("Test pattern source {} at {} fps", resolution, frame_rate);

        ProducerHandle::spawn("test-pattern", move |stop| {
            while !stop.load(Ordering::Acquire) {
                let started = Instant::now();
                let pixels = pattern.next_frame();
                if let Err(e) = slot.publish(pattern.width, pattern.height, PixelFormat::Rgba8, pixels) {
                    warn!("Test pattern publish failed: {}", e);
                    break;
                }
                if let Some(rest) = period.checked_sub(started.elapsed()) {
                    std::thread::sleep(rest);
                }
            }
            debug!("Test pattern stopped after {} frames", pattern.counter);
        })
    }
}
