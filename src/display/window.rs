use async_trait::async_trait;
use egui_wgpu::ScreenDescriptor;
use image::RgbaImage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use winit::{
    application::ApplicationHandler,
    dpi::{PhysicalPosition, PhysicalSize},
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop, EventLoopProxy},
    window::{Fullscreen, Window, WindowId},
};

use super::surface::{OutputSurface, SurfaceFactory, WindowPlacement};
use crate::{Result, StreamerError};

const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// State shared between a [`WindowSurface`] (sink side) and its window
/// (event loop side).
pub struct SurfaceShared {
    /// A presented image has not been uploaded yet.
    busy: AtomicBool,
    /// The window is gone (user closed it or the loop shut down).
    closed: AtomicBool,
    /// `width << 32 | height` in physical pixels.
    size: AtomicU64,
}

impl SurfaceShared {
    fn new(width: u32, height: u32) -> Self {
        Self {
            busy: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            size: AtomicU64::new(pack(width, height)),
        }
    }

    fn size(&self) -> (u32, u32) {
        let packed = self.size.load(Ordering::Acquire);
        ((packed >> 32) as u32, packed as u32)
    }
}

fn pack(width: u32, height: u32) -> u64 {
    ((width as u64) << 32) | height as u64
}

/// Commands sent from the async side into the winit event loop.
pub enum WindowCommand {
    Open {
        surface: u64,
        placement: WindowPlacement,
        shared: Arc<SurfaceShared>,
        reply: oneshot::Sender<Result<()>>,
    },
    Present {
        surface: u64,
        image: RgbaImage,
    },
    Close {
        surface: u64,
    },
    Shutdown,
}

/// WGPU rendering state for one mirror window.
///
/// The `Surface` is `'static` because it is created from the `Arc<Window>`
/// stored next to it in the same [`MirrorWindow`].
struct WgpuState {
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface: wgpu::Surface<'static>,
    surface_config: wgpu::SurfaceConfiguration,
}

struct MirrorWindow {
    surface_id: u64,
    window: Arc<Window>,
    egui_ctx: egui::Context,
    egui_state: egui_winit::State,
    egui_renderer: egui_wgpu::Renderer,
    wgpu_state: WgpuState,
    texture: Option<egui::TextureHandle>,
    pending: Option<RgbaImage>,
    shared: Arc<SurfaceShared>,
}

impl MirrorWindow {
    fn open(
        event_loop: &ActiveEventLoop,
        instance: &wgpu::Instance,
        surface_id: u64,
        placement: &WindowPlacement,
        shared: Arc<SurfaceShared>,
    ) -> Result<Self> {
        let g = placement.geometry;
        let mut attributes = Window::default_attributes()
            .with_title(placement.title.clone())
            .with_position(PhysicalPosition::new(g.x, g.y))
            .with_inner_size(PhysicalSize::new(g.width.max(1), g.height.max(1)))
            .with_decorations(placement.decorations)
            .with_resizable(placement.decorations);

        if placement.fullscreen {
            let monitor = event_loop.available_monitors().find(|m| {
                let p = m.position();
                p.x == g.x && p.y == g.y
            });
            attributes = attributes.with_fullscreen(Some(Fullscreen::Borderless(monitor)));
        }

        let window = Arc::new(
            event_loop
                .create_window(attributes)
                .map_err(|e| StreamerError::Display(format!("Failed to create window: {}", e)))?,
        );

        let egui_ctx = egui::Context::default();
        let egui_state = egui_winit::State::new(
            egui_ctx.clone(),
            egui::ViewportId::ROOT,
            &window,
            Some(window.scale_factor() as f32),
            None,
            Some(2048),
        );

        let surface = instance
            .create_surface(window.clone())
            .map_err(|e| StreamerError::Display(format!("Failed to create surface: {}", e)))?;

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: Some(&surface),
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| StreamerError::Display("No suitable GPU adapter".into()))?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("Mirror Device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: Default::default(),
            },
            None,
        ))
        .map_err(|e| StreamerError::Display(format!("Failed to create device: {}", e)))?;

        let format = surface
            .get_capabilities(&adapter)
            .formats
            .first()
            .copied()
            .ok_or_else(|| StreamerError::Display("Surface reports no formats".into()))?;

        let size = window.inner_size();
        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode: wgpu::CompositeAlphaMode::Auto,
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &surface_config);
        shared.size.store(pack(surface_config.width, surface_config.height), Ordering::Release);

        let egui_renderer = egui_wgpu::Renderer::new(&device, surface_config.format, None, 1, false);

        Ok(Self {
            surface_id,
            window,
            egui_ctx,
            egui_state,
            egui_renderer,
            wgpu_state: WgpuState {
                device,
                queue,
                surface,
                surface_config,
            },
            texture: None,
            pending: None,
            shared,
        })
    }

    fn resize(&mut self, size: PhysicalSize<u32>) {
        if size.width == 0 || size.height == 0 {
            return;
        }
        let state = &mut self.wgpu_state;
        state.surface_config.width = size.width;
        state.surface_config.height = size.height;
        state.surface.configure(&state.device, &state.surface_config);
        self.shared.size.store(pack(size.width, size.height), Ordering::Release);
    }

    fn redraw(&mut self) -> Result<()> {
        if let Some(image) = self.pending.take() {
            let size = [image.width() as usize, image.height() as usize];
            let color = egui::ColorImage::from_rgba_unmultiplied(size, image.as_raw());
            match &mut self.texture {
                Some(handle) => handle.set(color, egui::TextureOptions::LINEAR),
                None => {
                    self.texture = Some(self.egui_ctx.load_texture("mirror-frame", color, egui::TextureOptions::LINEAR))
                }
            }
            self.shared.busy.store(false, Ordering::Release);
        }

        let texture = self.texture.as_ref().map(|t| t.id());
        let raw_input = self.egui_state.take_egui_input(&self.window);
        let output = self.egui_ctx.run(raw_input, |ctx| {
            egui::CentralPanel::default()
                .frame(egui::Frame::none().fill(egui::Color32::BLACK))
                .show(ctx, |ui| {
                    if let Some(id) = texture {
                        let uv = egui::Rect::from_min_max(egui::pos2(0.0, 0.0), egui::pos2(1.0, 1.0));
                        ui.painter().image(id, ui.max_rect(), uv, egui::Color32::WHITE);
                    }
                });
        });
        self.egui_state.handle_platform_output(&self.window, output.platform_output);

        let paint_jobs = self.egui_ctx.tessellate(output.shapes, output.pixels_per_point);
        let state = &mut self.wgpu_state;
        let screen_descriptor = ScreenDescriptor {
            size_in_pixels: [state.surface_config.width, state.surface_config.height],
            pixels_per_point: self.window.scale_factor() as f32,
        };

        let frame = match state.surface.get_current_texture() {
            Ok(frame) => frame,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                state.surface.configure(&state.device, &state.surface_config);
                return Ok(());
            }
            Err(e) => return Err(StreamerError::Display(format!("Surface error: {}", e))),
        };
        let view = frame.texture.create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = state.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Mirror Encoder"),
        });

        for (id, image_delta) in &output.textures_delta.set {
            self.egui_renderer.update_texture(&state.device, &state.queue, *id, image_delta);
        }
        let user_buffers = self.egui_renderer.update_buffers(
            &state.device,
            &state.queue,
            &mut encoder,
            &paint_jobs,
            &screen_descriptor,
        );

        {
            let mut render_pass = encoder
                .begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("Mirror Pass"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: &view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                })
                .forget_lifetime();

            self.egui_renderer.render(&mut render_pass, &paint_jobs, &screen_descriptor);
        }

        for id in &output.textures_delta.free {
            self.egui_renderer.free_texture(id);
        }

        state
            .queue
            .submit(user_buffers.into_iter().chain(std::iter::once(encoder.finish())));
        frame.present();
        Ok(())
    }

    fn release(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.busy.store(false, Ordering::Release);
    }
}

/// winit application owning every mirror window. Runs on the main thread;
/// sinks talk to it through [`WindowSurfaceFactory`].
pub struct MirrorWindowApp {
    instance: wgpu::Instance,
    windows: HashMap<WindowId, MirrorWindow>,
    by_surface: HashMap<u64, WindowId>,
}

impl MirrorWindowApp {
    pub fn new() -> Self {
        Self {
            instance: wgpu::Instance::new(wgpu::InstanceDescriptor {
                backends: wgpu::Backends::all(),
                ..Default::default()
            }),
            windows: HashMap::new(),
            by_surface: HashMap::new(),
        }
    }

    fn close_surface(&mut self, surface: u64) {
        if let Some(window_id) = self.by_surface.remove(&surface) {
            if let Some(window) = self.windows.remove(&window_id) {
                window.release();
                info!("Mirror window {} closed", surface);
            }
        }
    }
}

impl Default for MirrorWindowApp {
    fn default() -> Self {
        Self::new()
    }
}

impl ApplicationHandler<WindowCommand> for MirrorWindowApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        event_loop.set_control_flow(ControlFlow::Wait);
    }

    fn user_event(&mut self, event_loop: &ActiveEventLoop, command: WindowCommand) {
        match command {
            WindowCommand::Open {
                surface,
                placement,
                shared,
                reply,
            } => {
                let result = MirrorWindow::open(event_loop, &self.instance, surface, &placement, shared).map(|window| {
                    let window_id = window.window.id();
                    info!("Mirror window {} opened at {:?}", surface, placement.geometry);
                    self.by_surface.insert(surface, window_id);
                    self.windows.insert(window_id, window);
                });
                // The requester may have timed out already.
                let _ = reply.send(result);
            }
            WindowCommand::Present { surface, image } => {
                let Some(window) = self.by_surface.get(&surface).and_then(|id| self.windows.get_mut(id)) else {
                    return;
                };
                window.pending = Some(image);
                window.window.request_redraw();
            }
            WindowCommand::Close { surface } => self.close_surface(surface),
            WindowCommand::Shutdown => {
                let surfaces: Vec<u64> = self.by_surface.keys().copied().collect();
                for surface in surfaces {
                    self.close_surface(surface);
                }
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        let Some(window) = self.windows.get_mut(&window_id) else {
            return;
        };

        let response = window.egui_state.on_window_event(&window.window, &event);
        if response.repaint {
            window.window.request_redraw();
        }

        match event {
            WindowEvent::CloseRequested => {
                let surface = window.surface_id;
                self.close_surface(surface);
            }
            WindowEvent::Resized(size) => window.resize(size),
            WindowEvent::RedrawRequested => {
                if let Err(e) = window.redraw() {
                    warn!("Mirror window {} redraw failed: {}", window.surface_id, e);
                }
            }
            _ => {}
        }
    }
}

/// Run the mirror window loop on the current (main) thread until a
/// [`WindowCommand::Shutdown`] arrives.
pub fn run_mirror_windows(event_loop: EventLoop<WindowCommand>) -> Result<()> {
    let mut app = MirrorWindowApp::new();
    event_loop
        .run_app(&mut app)
        .map_err(|e| StreamerError::Display(e.to_string()))
}

/// Opens mirror windows on the winit event loop from async code.
#[derive(Clone)]
pub struct WindowSurfaceFactory {
    proxy: Arc<Mutex<EventLoopProxy<WindowCommand>>>,
    next_id: Arc<AtomicU64>,
}

impl WindowSurfaceFactory {
    pub fn new(proxy: EventLoopProxy<WindowCommand>) -> Self {
        Self {
            proxy: Arc::new(Mutex::new(proxy)),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn send(&self, command: WindowCommand) -> Result<()> {
        self.proxy
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .send_event(command)
            .map_err(|_| StreamerError::Display("window event loop has exited".into()))
    }

    pub fn shutdown(&self) {
        let _ = self.send(WindowCommand::Shutdown);
    }
}

#[async_trait]
impl SurfaceFactory for WindowSurfaceFactory {
    async fn open(&self, placement: WindowPlacement) -> Result<Box<dyn OutputSurface>> {
        let surface = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (width, height) = placement.size();
        let shared = Arc::new(SurfaceShared::new(width, height));
        let (reply, response) = oneshot::channel();

        debug!("Requesting mirror window {} for {:?}", surface, placement);
        self.send(WindowCommand::Open {
            surface,
            placement,
            shared: shared.clone(),
            reply,
        })?;

        match tokio::time::timeout(OPEN_TIMEOUT, response).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(StreamerError::Display("window event loop dropped the request".into())),
            Err(_) => {
                let _ = self.send(WindowCommand::Close { surface });
                return Err(StreamerError::Display("timed out opening mirror window".into()));
            }
        }

        Ok(Box::new(WindowSurface {
            surface,
            factory: self.clone(),
            shared,
            released: false,
        }))
    }
}

struct WindowSurface {
    surface: u64,
    factory: WindowSurfaceFactory,
    shared: Arc<SurfaceShared>,
    released: bool,
}

impl OutputSurface for WindowSurface {
    fn size(&self) -> (u32, u32) {
        self.shared.size()
    }

    fn present(&mut self, image: RgbaImage) -> Result<bool> {
        if self.released || self.shared.closed.load(Ordering::Acquire) {
            return Err(StreamerError::Display("mirror window closed".into()));
        }
        if self.shared.busy.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        if let Err(e) = self.factory.send(WindowCommand::Present {
            surface: self.surface,
            image,
        }) {
            self.shared.busy.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(true)
    }

    fn close(&mut self) {
        if !self.released {
            self.released = true;
            let _ = self.factory.send(WindowCommand::Close { surface: self.surface });
        }
    }
}

impl Drop for WindowSurface {
    fn drop(&mut self) {
        self.close();
    }
}
