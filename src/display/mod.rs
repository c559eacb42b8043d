//! Display enumeration and hot-plug tracking.
//!
//! [`DisplayRegistry`] is the only writer of [`DisplayDescriptor`] state.
//! Scans come from a [`DisplayBackend`]; on-demand refreshes and the
//! background watcher both go through [`DisplayRegistry::refresh`], so
//! subscribers see one stream of [`DisplayEvent`]s regardless of trigger.

pub mod backend;
pub mod surface;
pub mod window;

pub use backend::{DisplayBackend, RawDisplay, VirtualBackend, XcapBackend};
pub use surface::{HeadlessSurfaceFactory, OutputSurface, SurfaceFactory, WindowPlacement};
pub use window::{MirrorWindowApp, WindowCommand, WindowSurfaceFactory};

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{DisplayDescriptor, DisplayId, Geometry};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum DisplayEvent {
    /// New display, or a known display that reconnected.
    Added(DisplayDescriptor),
    /// Display disconnected. Its descriptor stays listed with
    /// `connected = false` until the removal grace period passes.
    Removed(DisplayId),
    Changed(DisplayId, Geometry),
}

struct Entry {
    descriptor: DisplayDescriptor,
    disconnected_at: Option<Instant>,
}

#[derive(Default)]
struct RegistryState {
    /// platform key -> id, kept for the whole process run
    ids: HashMap<String, DisplayId>,
    next_id: u32,
    entries: BTreeMap<DisplayId, Entry>,
}

impl RegistryState {
    fn id_for(&mut self, key: &str) -> DisplayId {
        if let Some(id) = self.ids.get(key) {
            return *id;
        }
        self.next_id += 1;
        let id = DisplayId(self.next_id);
        self.ids.insert(key.to_string(), id);
        id
    }

    fn apply(&mut self, mut scanned: Vec<RawDisplay>, now: Instant, removal_grace: Duration) -> Vec<DisplayEvent> {
        disambiguate_keys(&mut scanned);
        if !scanned.iter().any(|d| d.is_primary) {
            if let Some(origin) = scanned.iter_mut().find(|d| d.geometry.is_at_origin()) {
                origin.is_primary = true;
            }
        }

        let mut events = Vec::new();
        let mut seen = HashSet::new();

        for raw in scanned {
            let id = self.id_for(&raw.key);
            if !seen.insert(id) {
                warn!("Display backend reported {} twice; ignoring duplicate", raw.key);
                continue;
            }

            match self.entries.get_mut(&id) {
                Some(entry) => {
                    let descriptor = &mut entry.descriptor;
                    descriptor.label = raw.label;
                    descriptor.is_primary = raw.is_primary;
                    if !descriptor.connected {
                        descriptor.connected = true;
                        descriptor.geometry = raw.geometry;
                        entry.disconnected_at = None;
                        info!("Display {} reconnected", id);
                        events.push(DisplayEvent::Added(descriptor.clone()));
                    } else if descriptor.geometry != raw.geometry {
                        descriptor.geometry = raw.geometry;
                        debug!("Display {} geometry changed to {:?}", id, raw.geometry);
                        events.push(DisplayEvent::Changed(id, raw.geometry));
                    }
                }
                None => {
                    let descriptor = DisplayDescriptor {
                        id,
                        label: raw.label,
                        geometry: raw.geometry,
                        is_primary: raw.is_primary,
                        connected: true,
                    };
                    info!("Display added: {}", descriptor.display_name());
                    events.push(DisplayEvent::Added(descriptor.clone()));
                    self.entries.insert(id, Entry { descriptor, disconnected_at: None });
                }
            }
        }

        for (id, entry) in self.entries.iter_mut() {
            if entry.descriptor.connected && !seen.contains(id) {
                entry.descriptor.connected = false;
                entry.disconnected_at = Some(now);
                info!("Display {} disconnected", id);
                events.push(DisplayEvent::Removed(*id));
            }
        }

        self.entries.retain(|id, entry| match entry.disconnected_at {
            Some(at) if now.duration_since(at) >= removal_grace => {
                debug!("Purging display {} after removal grace", id);
                false
            }
            _ => true,
        });

        events
    }
}

/// Identical monitors can share a platform key (xcap reports model names).
/// Later repeats within one scan become `key#2`, `key#3`, ... in scan order.
fn disambiguate_keys(scanned: &mut [RawDisplay]) {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for raw in scanned.iter_mut() {
        let count = counts.entry(raw.key.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            raw.key = format!("{}#{}", raw.key, count);
        }
    }
}

/// Process-wide registry of attached displays.
pub struct DisplayRegistry {
    backend: Arc<dyn DisplayBackend>,
    state: RwLock<RegistryState>,
    scan_lock: Mutex<()>,
    events: broadcast::Sender<DisplayEvent>,
    removal_grace: Duration,
}

impl DisplayRegistry {
    pub fn new(backend: Arc<dyn DisplayBackend>, removal_grace: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            backend,
            state: RwLock::new(RegistryState::default()),
            scan_lock: Mutex::new(()),
            events,
            removal_grace,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Rescan, update descriptors and publish the resulting events.
    pub async fn refresh(&self) -> Vec<DisplayEvent> {
        let _scan = self.scan_lock.lock().await;

        let backend = self.backend.clone();
        let scanned = match tokio::task::spawn_blocking(move || backend.scan()).await {
            Ok(scanned) => scanned,
            Err(e) => {
                warn!("Display scan task failed: {}", e);
                Vec::new()
            }
        };

        let events = {
            let mut state = self.state.write().await;
            state.apply(scanned, Instant::now(), self.removal_grace)
        };

        for event in &events {
            // No subscribers is fine.
            let _ = self.events.send(event.clone());
        }
        events
    }

    /// Rescan and return every known display ordered by id.
    pub async fn enumerate(&self) -> Vec<DisplayDescriptor> {
        self.refresh().await;
        self.list_displays().await
    }

    /// Current snapshot without rescanning.
    pub async fn list_displays(&self) -> Vec<DisplayDescriptor> {
        let state = self.state.read().await;
        state.entries.values().map(|e| e.descriptor.clone()).collect()
    }

    /// Connected displays other than the primary one.
    pub async fn external_displays(&self) -> Vec<DisplayDescriptor> {
        self.list_displays()
            .await
            .into_iter()
            .filter(|d| d.connected && !d.is_primary)
            .collect()
    }

    pub async fn get(&self, id: DisplayId) -> Option<DisplayDescriptor> {
        let state = self.state.read().await;
        state.entries.get(&id).map(|e| e.descriptor.clone())
    }

    pub async fn is_connected(&self, id: DisplayId) -> bool {
        self.get(id).await.map(|d| d.connected).unwrap_or(false)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DisplayEvent> {
        self.events.subscribe()
    }

    /// Poll the backend every `interval` until the handle is aborted.
    pub fn spawn_watcher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            info!("Display watcher started ({} backend, every {:?})", registry.backend_name(), interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                registry.refresh().await;
            }
        })
    }
}
