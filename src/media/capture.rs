use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use xcap::Monitor;

use super::{FrameSlot, PixelFormat, ProducerHandle};
use crate::{Result, StreamerError};

/// Captures one monitor through `xcap` and publishes the screenshots into a
/// [`FrameSlot`], so a local display can be mirrored onto another one or
/// streamed.
pub struct MonitorCapture;

impl MonitorCapture {
    /// `monitor` matches an xcap monitor name or numeric id; `None` picks the
    /// primary monitor.
    pub fn spawn(monitor: Option<String>, frame_rate: u32, slot: FrameSlot) -> Result<ProducerHandle> {
        let target = find_monitor(monitor.as_deref())?;
        info!(
            "Capturing monitor '{}' ({}x{}) at {} fps",
            target.name(),
            target.width(),
            target.height(),
            frame_rate
        );
        let period = Duration::from_secs(1) / frame_rate.max(1);

        ProducerHandle::spawn("monitor-capture", move |stop| {
            let mut failures = 0u32;
            while !stop.load(Ordering::Acquire) {
                let started = Instant::now();
                match target.capture_image() {
                    Ok(image) => {
                        failures = 0;
                        let (width, height) = (image.width(), image.height());
                        if let Err(e) = slot.publish(width, height, PixelFormat::Rgba8, image.into_raw()) {
                            warn!("Dropping captured frame: {}", e);
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        // Log the first failure and then every few seconds' worth.
                        if failures == 1 || failures % 100 == 0 {
                            warn!("Failed to capture screen ({} in a row): {}", failures, e);
                        }
                    }
                }
                if let Some(rest) = period.checked_sub(started.elapsed()) {
                    std::thread::sleep(rest);
                }
            }
            debug!("Monitor capture stopped");
        })
    }
}

fn find_monitor(wanted: Option<&str>) -> Result<Monitor> {
    let mut monitors =
        Monitor::all().map_err(|e| StreamerError::Display(format!("Failed to get monitors: {}", e)))?;

    match wanted {
        Some(id) => monitors
            .into_iter()
            .find(|m| m.id().to_string() == id || m.name() == id)
            .ok_or_else(|| StreamerError::Display(format!("Monitor '{}' not found", id))),
        None => match monitors.iter().position(|m| m.is_primary()) {
            Some(idx) => Ok(monitors.remove(idx)),
            None => monitors
                .into_iter()
                .next()
                .ok_or_else(|| StreamerError::Display("No monitors found".into())),
        },
    }
}
