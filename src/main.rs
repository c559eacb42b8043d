use anyhow::Context;
use clap::Parser;
use q8_streamer::config::AppConfig;
use q8_streamer::display::{
    backend, DisplayRegistry, HeadlessSurfaceFactory, SurfaceFactory, WindowCommand, WindowSurfaceFactory,
};
use q8_streamer::encoder::{EncoderSupervisor, FfmpegCommand};
use q8_streamer::media::{FrameSlot, MonitorCapture, ProducerHandle};
use q8_streamer::render::TestPattern;
use q8_streamer::secrets::StaticCredentials;
use q8_streamer::server::HttpServer;
use q8_streamer::stream::{ControllerParts, StreamSessionController};
use q8_streamer::Resolution;
use secrecy::SecretString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use winit::event_loop::EventLoop;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (defaults to the per-user config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind
    #[arg(long)]
    bind: Option<String>,

    /// No mirror windows; frames presented to mirror targets are discarded
    #[arg(long)]
    headless: bool,

    /// Capture this monitor as the frame source instead of the test pattern
    #[arg(long, value_name = "MONITOR")]
    capture: Option<String>,

    /// Test pattern size
    #[arg(long, default_value = "1920x1080")]
    pattern_size: Resolution,

    /// Frame rate of the built-in frame source
    #[arg(long, default_value = "30")]
    source_fps: u32,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("Starting q8-streamer v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load(args.config.as_deref()).context("loading config")?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building runtime")?;

    if args.headless {
        return runtime.block_on(serve(args, config, Arc::new(HeadlessSurfaceFactory::new())));
    }

    // Windows live on the main thread; the runtime serves from another.
    let event_loop = EventLoop::<WindowCommand>::with_user_event()
        .build()
        .context("creating window event loop")?;
    let factory = WindowSurfaceFactory::new(event_loop.create_proxy());
    let server_factory = factory.clone();

    let server = std::thread::Builder::new()
        .name("q8-streamer-server".into())
        .spawn(move || {
            let result = runtime.block_on(serve(args, config, Arc::new(server_factory)));
            factory.shutdown();
            result
        })
        .context("spawning server thread")?;

    q8_streamer::display::window::run_mirror_windows(event_loop)?;

    server
        .join()
        .map_err(|_| anyhow::anyhow!("server thread panicked"))?
}

async fn serve(args: Args, mut config: AppConfig, surfaces: Arc<dyn SurfaceFactory>) -> anyhow::Result<()> {
    let (display_backend, _) = backend::from_settings(&config.displays);
    let registry = Arc::new(DisplayRegistry::new(display_backend, config.displays.removal_grace()));
    registry.refresh().await;
    for display in registry.list_displays().await {
        let display_name = display.display_name();
        tracing::info!("Found {}", display_name);
    }
    let watcher = registry.spawn_watcher(config.displays.poll_interval());

    let bind = args.bind.unwrap_or_else(|| config.server.bind.clone());
    let port = args.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{}:{}", bind, port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", bind, port))?;
    let api_key = config.server.api_key.take().map(SecretString::from);
    if api_key.is_none() {
        tracing::warn!("No API key configured; the control API is open to anyone who can reach {}", addr);
    }

    let slot = FrameSlot::new();
    let producer: ProducerHandle = match &args.capture {
        Some(monitor) => MonitorCapture::spawn(Some(monitor.clone()), args.source_fps, slot.clone())?,
        None => TestPattern::spawn(args.pattern_size, args.source_fps, slot.clone())?,
    };

    let credentials = StaticCredentials::from_map(config.take_credentials()).with_env_fallback();
    tracing::info!("{} stream key(s) configured", credentials.len());

    let supervisor = EncoderSupervisor::new(
        Arc::new(FfmpegCommand::new(config.encoder.clone())),
        config.policy.clone(),
    );
    let controller = StreamSessionController::new(ControllerParts {
        registry,
        surfaces,
        supervisor: Arc::new(supervisor),
        credentials: Arc::new(credentials),
        source: Arc::new(slot),
        policy: config.policy.clone(),
    });

    let result = HttpServer::new(controller.clone(), api_key)
        .run(addr, shutdown_signal())
        .await;

    controller.shutdown().await;
    // Joins the producer thread.
    let stopped = tokio::task::spawn_blocking(move || {
        let mut producer = producer;
        producer.stop();
    });
    if let Err(e) = stopped.await {
        tracing::warn!("Frame producer did not shut down cleanly: {}", e);
    }
    watcher.abort();
    result?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
