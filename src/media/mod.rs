//! Frames and the pull-side handle onto whatever renders them.

pub mod capture;

pub use capture::MonitorCapture;

use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::sync::watch;

use crate::{Result, StreamerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Rgba8,
    Bgra8,
    Rgb8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => 4,
            PixelFormat::Rgb8 => 3,
        }
    }
}

/// An immutable, timestamped pixel buffer.
///
/// Cloning shares the underlying bytes; nothing can mutate them once the
/// frame exists.
#[derive(Clone)]
pub struct Frame {
    sequence: u64,
    captured_at: Instant,
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Bytes,
}

impl Frame {
    pub fn new(sequence: u64, width: u32, height: u32, format: PixelFormat, data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        let expected = width as usize * height as usize * format.bytes_per_pixel();
        if width == 0 || height == 0 || data.len() != expected {
            return Err(StreamerError::Render(format!(
                "frame {}x{} {:?} needs {} bytes, got {}",
                width,
                height,
                format,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            sequence,
            captured_at: Instant::now(),
            width,
            height,
            format,
            data,
        })
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.sequence)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Pull-based handle onto the most recently composited frame.
pub trait FrameSource: Send + Sync {
    /// Must not block. May return the same frame repeatedly when the
    /// producer has not published since the last call.
    fn latest_frame(&self) -> Option<Frame>;
}

/// Single-slot mailbox a renderer publishes into. Publishing replaces the
/// previous frame; readers always see the newest one.
#[derive(Clone)]
pub struct FrameSlot {
    tx: Arc<watch::Sender<Option<Frame>>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Publish pixels as the newest frame, returning its sequence number.
    /// The number is assigned under the slot's lock, so concurrent
    /// publishers never store an older frame over a newer one.
    pub fn publish(&self, width: u32, height: u32, format: PixelFormat, data: impl Into<Bytes>) -> Result<u64> {
        let mut frame = Frame::new(0, width, height, format, data)?;
        let mut sequence = 0;
        self.tx.send_modify(|current| {
            sequence = current.as_ref().map_or(1, |latest| latest.sequence + 1);
            frame.sequence = sequence;
            *current = Some(frame);
        });
        Ok(sequence)
    }

    /// Wakes when a new frame is published.
    pub fn changes(&self) -> watch::Receiver<Option<Frame>> {
        self.tx.subscribe()
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for FrameSlot {
    fn latest_frame(&self) -> Option<Frame> {
        self.tx.borrow().clone()
    }
}

/// A producer thread publishing into a [`FrameSlot`]. Stops on drop.
pub struct ProducerHandle {
    name: &'static str,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ProducerHandle {
    pub(crate) fn spawn<F>(name: &'static str, body: F) -> Result<Self>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(flag))?;
        Ok(Self {
            name,
            stop,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("{} producer thread panicked", self.name);
            }
        }
    }
}

impl Drop for ProducerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_rejects_wrong_length() {
        assert!(Frame::new(1, 2, 2, PixelFormat::Rgba8, vec![0u8; 16]).is_ok());
        assert!(Frame::new(1, 2, 2, PixelFormat::Rgb8, vec![0u8; 16]).is_err());
        assert!(Frame::new(1, 0, 2, PixelFormat::Rgb8, Vec::<u8>::new()).is_err());
    }

    #[test]
    fn test_slot_returns_newest_with_increasing_sequence() {
        let slot = FrameSlot::new();
        assert!(slot.latest_frame().is_none());

        let first = slot.publish(1, 1, PixelFormat::Rgba8, vec![1, 2, 3, 4]).unwrap();
        let second = slot.publish(1, 1, PixelFormat::Rgba8, vec![5, 6, 7, 8]).unwrap();
        assert!(second > first);

        let frame = slot.latest_frame().unwrap();
        assert_eq!(frame.sequence(), second);
        assert_eq!(&frame.data()[..], &[5, 6, 7, 8]);
        // Re-reading without a publish yields the same frame.
        assert_eq!(slot.latest_frame().unwrap().sequence(), second);
    }

    #[test]
    fn test_concurrent_publishers_never_go_backwards() {
        let slot = FrameSlot::new();
        let done = Arc::new(AtomicBool::new(false));

        let reader = {
            let slot = slot.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                let mut last = 0;
                while !done.load(Ordering::Acquire) {
                    if let Some(frame) = slot.latest_frame() {
                        assert!(frame.sequence() >= last, "{} after {}", frame.sequence(), last);
                        last = frame.sequence();
                    }
                }
            })
        };
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let slot = slot.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        slot.publish(1, 1, PixelFormat::Rgba8, vec![0u8; 4]).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        done.store(true, Ordering::Release);
        reader.join().unwrap();

        assert_eq!(slot.latest_frame().unwrap().sequence(), 1000);
    }

    #[test]
    fn test_producer_stops_on_drop() {
        let ran = Arc::new(AtomicBool::new(false));
        let seen = ran.clone();
        let producer = ProducerHandle::spawn("test-producer", move |stop| {
            while !stop.load(Ordering::Acquire) {
                seen.store(true, Ordering::Release);
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        })
        .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        drop(producer);
        assert!(ran.load(Ordering::Acquire));
    }
}
