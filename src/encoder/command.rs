use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::EncoderSettings;
use crate::{StartError, StreamConfig};

/// Audio sample rate of the generated silent track.
pub const AUDIO_SAMPLE_RATE: u32 = 44_100;

/// Where an encoder sends its output.
pub struct EncoderTarget {
    pub uri: String,
    pub stream_key: SecretString,
}

impl EncoderTarget {
    pub fn new(uri: impl Into<String>, stream_key: SecretString) -> Self {
        Self {
            uri: uri.into(),
            stream_key,
        }
    }

    pub fn protocol(&self) -> OutputProtocol {
        OutputProtocol::from_uri(&self.uri)
    }

    /// Full output URL, stream key included.
    pub fn output_url(&self) -> String {
        let key = self.stream_key.expose_secret();
        match self.protocol() {
            OutputProtocol::Rtmp => format!("{}/{}", self.uri.trim_end_matches('/'), key),
            OutputProtocol::Srt => {
                if self.uri.contains("streamid=") {
                    self.uri.clone()
                } else if self.uri.contains('?') {
                    format!("{}&streamid={}", self.uri, key)
                } else {
                    format!("{}?streamid={}", self.uri, key)
                }
            }
        }
    }
}

impl fmt::Debug for EncoderTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderTarget")
            .field("uri", &self.uri)
            .field("stream_key", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputProtocol {
    /// `rtmp://` and `rtmps://`, muxed as FLV.
    Rtmp,
    /// `srt://`, muxed as MPEG-TS.
    Srt,
}

impl OutputProtocol {
    pub fn from_uri(uri: &str) -> Self {
        if uri.trim().to_ascii_lowercase().starts_with("srt://") {
            OutputProtocol::Srt
        } else {
            OutputProtocol::Rtmp
        }
    }
}

/// A fully resolved process invocation.
#[derive(Clone, PartialEq)]
pub struct EncoderCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Substring of `args` to hide when logging.
    pub secret: Option<String>,
}

impl EncoderCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            secret: None,
        }
    }

    /// Command line with the secret masked, for logs.
    pub fn redacted(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            match &self.secret {
                Some(secret) if !secret.is_empty() && arg.contains(secret.as_str()) => {
                    line.push_str(&arg.replace(secret.as_str(), "****"))
                }
                _ => line.push_str(arg),
            }
        }
        line
    }
}

impl fmt::Debug for EncoderCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncoderCommand({})", self.redacted())
    }
}

/// Turns a stream configuration into an encoder invocation. Swapping the
/// builder swaps the encoder backend without touching session logic.
pub trait EncoderCommandBuilder: Send + Sync {
    fn build(&self, config: &StreamConfig, target: &EncoderTarget) -> Result<EncoderCommand, StartError>;
}

/// ffmpeg reading raw RGB24 from stdin, x264 + AAC out.
pub struct FfmpegCommand {
    settings: EncoderSettings,
}

impl FfmpegCommand {
    pub fn new(settings: EncoderSettings) -> Self {
        Self { settings }
    }

    pub fn args(&self, config: &StreamConfig, target: &EncoderTarget) -> Vec<String> {
        let fps = config.frame_rate.to_string();
        let size = config.resolution.to_string();
        let vbr = format!("{}k", config.video_bitrate);
        let bufsize = format!("{}k", config.video_bitrate * 2);
        let abr = format!("{}k", config.audio_bitrate);
        let rate = AUDIO_SAMPLE_RATE.to_string();
        let silence = format!("anullsrc=channel_layout=stereo:sample_rate={}", AUDIO_SAMPLE_RATE);

        let base: &[&str] = &[
            "-y",
            "-loglevel",
            &self.settings.log_level,
            // raw video on stdin
            "-f",
            "rawvideo",
            "-vcodec",
            "rawvideo",
            "-pix_fmt",
            "rgb24",
            "-s",
            &size,
            "-r",
            &fps,
            "-i",
            "-",
            // silent audio track
            "-f",
            "lavfi",
            "-i",
            &silence,
            "-c:v",
            "libx264",
            "-preset",
            config.encoder_preset.as_str(),
            "-tune",
            "zerolatency",
            "-profile:v",
            "baseline",
            "-level",
            "3.0",
            "-pix_fmt",
            "yuv420p",
            "-b:v",
            &vbr,
            "-maxrate",
            &vbr,
            "-bufsize",
            &bufsize,
            "-g",
            &fps,
            "-keyint_min",
            &fps,
            "-sc_threshold",
            "0",
            "-c:a",
            "aac",
            "-b:a",
            &abr,
            "-ar",
            &rate,
            "-ac",
            "2",
        ];
        let mut args: Vec<String> = base.iter().map(|s| s.to_string()).collect();

        args.extend(self.settings.extra_args.iter().cloned());

        match target.protocol() {
            OutputProtocol::Rtmp => args.extend(
                ["-fflags", "+genpts", "-f", "flv", "-flvflags", "no_duration_filesize"]
                    .iter()
                    .map(|s| s.to_string()),
            ),
            OutputProtocol::Srt => args.extend(
                [
                    "-muxdelay",
                    "0",
                    "-mpegts_flags",
                    "+pat_pmt_at_frames+initial_discontinuity",
                    "-f",
                    "mpegts",
                ]
                .iter()
                .map(|s| s.to_string()),
            ),
        }
        args.push(target.output_url());
        args
    }
}

impl EncoderCommandBuilder for FfmpegCommand {
    fn build(&self, config: &StreamConfig, target: &EncoderTarget) -> Result<EncoderCommand, StartError> {
        let program = locate_ffmpeg(self.settings.ffmpeg_path.as_deref())
            .ok_or_else(|| StartError::BinaryMissing("ffmpeg".to_string()))?;
        let mut command = EncoderCommand::new(program, self.args(config, target));
        command.secret = Some(target.stream_key.expose_secret().to_string());
        Ok(command)
    }
}

fn executable_name() -> &'static str {
    if cfg!(windows) {
        "ffmpeg.exe"
    } else {
        "ffmpeg"
    }
}

/// Find ffmpeg: the configured path, then bundled copies next to the
/// executable, then the per-user data dir, then `PATH`. A configured path
/// that does not exist is not replaced by a search.
pub fn locate_ffmpeg(configured: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = configured {
        return path.is_file().then(|| path.to_path_buf());
    }

    let exe = executable_name();
    let mut candidates = Vec::new();

    if let Some(dir) = std::env::current_exe().ok().and_then(|p| p.parent().map(Path::to_path_buf)) {
        candidates.push(dir.join("third_party").join("ffmpeg").join("bin").join(exe));
        candidates.push(dir.join("ffmpeg").join("bin").join(exe));
    }
    if let Some(dirs) = directories::ProjectDirs::from("is", "8b", "q8-streamer") {
        candidates.push(dirs.data_dir().join("ffmpeg").join("bin").join(exe));
    }
    if let Some(paths) = std::env::var_os("PATH") {
        candidates.extend(std::env::split_paths(&paths).map(|dir| dir.join(exe)));
    }

    let found = candidates.into_iter().find(|p| p.is_file());
    debug!("ffmpeg located at {:?}", found);
    found
}
