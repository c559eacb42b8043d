use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use xcap::Monitor;

use crate::config::{DisplayBackendKind, DisplaySettings};
use crate::Geometry;

/// One display as reported by a platform scan, before id assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDisplay {
    /// Platform identity used to keep ids stable across scans.
    pub key: String,
    pub label: String,
    pub geometry: Geometry,
    pub is_primary: bool,
}

/// Source of display scans. Implementations must not fail: a scan that
/// cannot reach the platform reports no displays.
pub trait DisplayBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn scan(&self) -> Vec<RawDisplay>;
}

pub fn from_settings(settings: &DisplaySettings) -> (Arc<dyn DisplayBackend>, Option<VirtualBackend>) {
    match settings.backend {
        DisplayBackendKind::Xcap => (Arc::new(XcapBackend), None),
        DisplayBackendKind::Virtual => {
            let backend = VirtualBackend::new();
            for display in &settings.virtual_displays {
                backend.plug(
                    &display.name,
                    &display.name,
                    Geometry::new(display.x, display.y, display.width, display.height),
                    display.primary,
                );
            }
            (Arc::new(backend.clone()), Some(backend))
        }
    }
}

/// Real monitors through `xcap`.
pub struct XcapBackend;

impl DisplayBackend for XcapBackend {
    fn name(&self) -> &'static str {
        "xcap"
    }

    fn scan(&self) -> Vec<RawDisplay> {
        let monitors = match Monitor::all() {
            Ok(monitors) => monitors,
            Err(e) => {
                warn!("Failed to get monitors: {}", e);
                return Vec::new();
            }
        };

        monitors
            .into_iter()
            .map(|m| {
                let name = m.name().to_string();
                // Connector names survive replug; raw ids may not.
                let key = if name.is_empty() { m.id().to_string() } else { name.clone() };
                RawDisplay {
                    key,
                    label: if name.is_empty() { format!("Monitor {}", m.id()) } else { name },
                    geometry: Geometry::new(m.x(), m.y(), m.width(), m.height()),
                    is_primary: m.is_primary(),
                }
            })
            .collect()
    }
}

/// In-memory displays that can be plugged and unplugged at runtime.
#[derive(Clone, Default)]
pub struct VirtualBackend {
    displays: Arc<Mutex<Vec<RawDisplay>>>,
}

impl VirtualBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plug(&self, key: &str, label: &str, geometry: Geometry, is_primary: bool) {
        let mut displays = self.lock();
        displays.retain(|d| d.key != key);
        debug!("Virtual display {} plugged at {:?}", key, geometry);
        displays.push(RawDisplay {
            key: key.to_string(),
            label: label.to_string(),
            geometry,
            is_primary,
        });
    }

    pub fn unplug(&self, key: &str) -> bool {
        let mut displays = self.lock();
        let before = displays.len();
        displays.retain(|d| d.key != key);
        debug!("Virtual display {} unplugged", key);
        displays.len() != before
    }

    pub fn set_geometry(&self, key: &str, geometry: Geometry) -> bool {
        let mut displays = self.lock();
        match displays.iter_mut().find(|d| d.key == key) {
            Some(display) => {
                display.geometry = geometry;
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<RawDisplay>> {
        // A poisoned list is still a valid list.
        self.displays.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DisplayBackend for VirtualBackend {
    fn name(&self) -> &'static str {
        "virtual"
    }

    fn scan(&self) -> Vec<RawDisplay> {
        self.lock().clone()
    }
}
