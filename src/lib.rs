pub mod config;
pub mod display;
pub mod encoder;
pub mod error;
pub mod media;
pub mod render;
pub mod secrets;
pub mod server;
pub mod stream;

pub use error::{Result, StartError, StreamerError};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Process-stable display identifier handed out by the
/// [`DisplayRegistry`](display::DisplayRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DisplayId(pub u32);

impl fmt::Display for DisplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Geometry {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn is_at_origin(&self) -> bool {
        self.x == 0 && self.y == 0
    }

    /// Rectangle of `width` x `height` centered inside this geometry.
    pub fn centered(&self, width: u32, height: u32) -> Geometry {
        let x = self.x + (self.width as i32 - width as i32) / 2;
        let y = self.y + (self.height as i32 - height as i32) / 2;
        Geometry { x, y, width, height }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayDescriptor {
    pub id: DisplayId,
    pub label: String,
    pub geometry: Geometry,
    pub is_primary: bool,
    pub connected: bool,
}

impl DisplayDescriptor {
    /// Friendly label for target-selection lists, e.g.
    /// `Display 2: HDMI-1 - 1920x1080 (Primary)`.
    pub fn display_name(&self) -> String {
        let primary = if self.is_primary { " (Primary)" } else { "" };
        format!(
            "Display {}: {} - {}x{}{}",
            self.id, self.label, self.geometry.width, self.geometry.height, primary
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = StreamerError;

    fn from_str(s: &str) -> Result<Self> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| StreamerError::Config(format!("Invalid resolution format: {}", s)))?;
        let width = w.trim().parse::<u32>()
            .map_err(|_| StreamerError::Config(format!("Invalid resolution format: {}", s)))?;
        let height = h.trim().parse::<u32>()
            .map_err(|_| StreamerError::Config(format!("Invalid resolution format: {}", s)))?;
        Ok(Self { width, height })
    }
}

/// How a mirror window is laid out on its display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DisplayMode {
    /// Undecorated window covering the whole display.
    Mirror,
    /// Window at the display origin sized to the session resolution.
    Extend,
    Fullscreen,
    Windowed { width: u32, height: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamTarget {
    Mirror {
        display_id: DisplayId,
        mode: DisplayMode,
    },
    Network {
        uri: String,
        credentials_ref: String,
    },
}

impl StreamTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            StreamTarget::Mirror { .. } => "mirror",
            StreamTarget::Network { .. } => "network",
        }
    }
}

/// x264 speed presets accepted by the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderPreset {
    #[default]
    Ultrafast,
    Superfast,
    Veryfast,
    Faster,
    Fast,
    Medium,
    Slow,
}

impl EncoderPreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncoderPreset::Ultrafast => "ultrafast",
            EncoderPreset::Superfast => "superfast",
            EncoderPreset::Veryfast => "veryfast",
            EncoderPreset::Faster => "faster",
            EncoderPreset::Fast => "fast",
            EncoderPreset::Medium => "medium",
            EncoderPreset::Slow => "slow",
        }
    }
}

fn default_audio_bitrate() -> u32 {
    128
}

/// Configuration of one named stream. Immutable while the session runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub target: StreamTarget,
    pub resolution: Resolution,
    pub frame_rate: u32,
    /// kbit/s
    pub video_bitrate: u32,
    /// kbit/s
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: u32,
    #[serde(default)]
    pub encoder_preset: EncoderPreset,
}

impl StreamConfig {
    /// Tick period of the frame scheduler for this stream.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.frame_rate.max(1)
    }
}
