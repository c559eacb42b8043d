//! Application configuration loaded from `config.toml`.
//!
//! Every section is optional; missing keys fall back to the defaults below.
//! Secrets (`[credentials]`, `server.api_key`) are read as plain strings and
//! moved into `SecretString` holders by [`AppConfig::take_credentials`] and the
//! server's auth layer at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::Result;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub displays: DisplaySettings,
    pub policy: SessionPolicy,
    pub encoder: EncoderSettings,
    /// `credentials_ref` -> stream key
    pub credentials: HashMap<String, String>,
}

impl AppConfig {
    /// Load from `path`, or from the per-user config directory when no path
    /// is given. A missing default file yields the defaults; a missing
    /// explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                info!("Loading config from {}", path.display());
                let text = std::fs::read_to_string(path)?;
                Self::from_toml_str(&text)
            }
            None => match Self::default_path() {
                Some(path) if path.exists() => {
                    info!("Loading config from {}", path.display());
                    let text = std::fs::read_to_string(&path)?;
                    Self::from_toml_str(&text)
                }
                _ => {
                    debug!("No config file found, using defaults");
                    Ok(Self::default())
                }
            },
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("is", "8b", "q8-streamer")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Move the credential table out of the config so plaintext copies do
    /// not outlive startup.
    pub fn take_credentials(&mut self) -> HashMap<String, String> {
        std::mem::take(&mut self.credentials)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// When set, `/api/*` requires a matching `x-api-key` header.
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8420,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayBackendKind {
    #[default]
    Xcap,
    Virtual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualDisplay {
    pub name: String,
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub primary: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DisplaySettings {
    pub backend: DisplayBackendKind,
    pub poll_interval_ms: u64,
    /// How long a disconnected descriptor stays listed before it is purged.
    pub removal_grace_ms: u64,
    /// Displays exposed by the `virtual` backend.
    pub virtual_displays: Vec<VirtualDisplay>,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            backend: DisplayBackendKind::Xcap,
            poll_interval_ms: 1000,
            removal_grace_ms: 30_000,
            virtual_displays: Vec::new(),
        }
    }
}

impl DisplaySettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn removal_grace(&self) -> Duration {
        Duration::from_millis(self.removal_grace_ms)
    }
}

/// Timing and threshold knobs for session supervision.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionPolicy {
    /// A lost mirror display may come back within this window without a
    /// restart; after it the session fails.
    pub reconnect_grace_ms: u64,
    /// Drop ratio (0..=1) per evaluation window that counts as an overrun.
    pub overrun_threshold: f64,
    pub overrun_window_ms: u64,
    pub health_check_interval_ms: u64,
    /// No successful pipe write for this long while frames are being
    /// submitted marks the encoder unhealthy.
    pub liveness_window_ms: u64,
    pub pipe_write_timeout_ms: u64,
    /// The encoder must survive this long after spawn to count as started.
    pub startup_probe_ms: u64,
    pub terminate_grace_ms: u64,
    pub stop_timeout_ms: u64,
    pub sink_queue_depth: usize,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            reconnect_grace_ms: 10_000,
            overrun_threshold: 0.5,
            overrun_window_ms: 2_000,
            health_check_interval_ms: 1_000,
            liveness_window_ms: 5_000,
            pipe_write_timeout_ms: 50,
            startup_probe_ms: 300,
            terminate_grace_ms: 3_000,
            stop_timeout_ms: 8_000,
            sink_queue_depth: 1,
        }
    }
}

impl SessionPolicy {
    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_millis(self.reconnect_grace_ms)
    }

    pub fn overrun_window(&self) -> Duration {
        Duration::from_millis(self.overrun_window_ms.max(1))
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms.max(1))
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.liveness_window_ms)
    }

    pub fn pipe_write_timeout(&self) -> Duration {
        Duration::from_millis(self.pipe_write_timeout_ms)
    }

    pub fn startup_probe(&self) -> Duration {
        Duration::from_millis(self.startup_probe_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    /// Explicit ffmpeg binary; otherwise bundled locations and `PATH` are searched.
    pub ffmpeg_path: Option<PathBuf>,
    pub log_level: String,
    /// Appended before the output target.
    pub extra_args: Vec<String>,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            log_level: "error".to_string(),
            extra_args: Vec::new(),
        }
    }
}
