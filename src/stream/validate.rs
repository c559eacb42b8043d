use crate::{Resolution, Result, StreamConfig, StreamTarget, StreamerError};

pub const MAX_RESOLUTION: Resolution = Resolution::new(3840, 2160);
pub const MIN_DIMENSION: u32 = 16;
pub const FRAME_RATE_RANGE: std::ops::RangeInclusive<u32> = 1..=60;
/// kbit/s
pub const VIDEO_BITRATE_RANGE: std::ops::RangeInclusive<u32> = 100..=50_000;
/// kbit/s
pub const AUDIO_BITRATE_RANGE: std::ops::RangeInclusive<u32> = 32..=320;
pub const SUPPORTED_SCHEMES: [&str; 3] = ["rtmp://", "rtmps://", "srt://"];

fn invalid(message: String) -> StreamerError {
    StreamerError::Config(message)
}

/// Checks that need nothing but the config itself.
pub fn check_config(config: &StreamConfig) -> Result<()> {
    if config.name.trim().is_empty() {
        return Err(invalid("stream name must not be empty".into()));
    }

    let Resolution { width, height } = config.resolution;
    if width < MIN_DIMENSION
        || height < MIN_DIMENSION
        || width > MAX_RESOLUTION.width
        || height > MAX_RESOLUTION.height
    {
        return Err(invalid(format!(
            "resolution {} outside {}x{}..={}",
            config.resolution, MIN_DIMENSION, MIN_DIMENSION, MAX_RESOLUTION
        )));
    }

    if !FRAME_RATE_RANGE.contains(&config.frame_rate) {
        return Err(invalid(format!("frame rate {} must be between 1 and 60", config.frame_rate)));
    }
    if !VIDEO_BITRATE_RANGE.contains(&config.video_bitrate) {
        return Err(invalid(format!(
            "video bitrate {}k must be between {}k and {}k",
            config.video_bitrate,
            VIDEO_BITRATE_RANGE.start(),
            VIDEO_BITRATE_RANGE.end()
        )));
    }
    if !AUDIO_BITRATE_RANGE.contains(&config.audio_bitrate) {
        return Err(invalid(format!(
            "audio bitrate {}k must be between {}k and {}k",
            config.audio_bitrate,
            AUDIO_BITRATE_RANGE.start(),
            AUDIO_BITRATE_RANGE.end()
        )));
    }

    match &config.target {
        StreamTarget::Mirror { mode, .. } => {
            if let crate::DisplayMode::Windowed { width, height } = mode {
                if *width < MIN_DIMENSION || *height < MIN_DIMENSION {
                    return Err(invalid(format!("window size {}x{} too small", width, height)));
                }
            }
        }
        StreamTarget::Network { uri, credentials_ref } => {
            check_uri(uri)?;
            if credentials_ref.trim().is_empty() {
                return Err(invalid("network target needs a credentials reference".into()));
            }
            // yuv420p needs even dimensions.
            if width % 2 != 0 || height % 2 != 0 {
                return Err(invalid(format!("resolution {} must have even dimensions for encoding", config.resolution)));
            }
        }
    }
    Ok(())
}

/// Scheme is one the encoder can publish to, with a host after it.
pub fn check_uri(uri: &str) -> Result<()> {
    let lower = uri.trim().to_ascii_lowercase();
    let scheme = SUPPORTED_SCHEMES
        .iter()
        .find(|s| lower.starts_with(*s))
        .ok_or_else(|| invalid(format!("unsupported stream URI '{}' (expected rtmp://, rtmps:// or srt://)", uri)))?;

    let rest = &lower[scheme.len()..];
    let host = rest.split(['/', '?', ':']).next().unwrap_or("");
    if host.is_empty() || uri.chars().any(char::is_whitespace) {
        return Err(invalid(format!("malformed stream URI '{}'", uri)));
    }
    Ok(())
}
