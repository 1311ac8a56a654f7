//! Frame streamer CLI application

// Use jemalloc for better memory management (optional feature)
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use clap::Parser;
use frame_streamer::config::Config;
use frame_streamer::{CaptureStats, Pipeline, ServerStats};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "frame-streamer")]
#[command(about = "Streams raw camera frames to a single TCP client")]
#[command(version)]
struct Cli {
    /// Path to configuration file; defaults are used if it does not exist
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Override the server listen port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt().with_env_filter(filter).with_target(false).init();

    info!("Frame streamer starting");

    let mut config = if Path::new(&cli.config).exists() {
        info!(config_path = %cli.config, "Loading configuration");
        Config::load(&cli.config).with_context(|| format!("loading {}", cli.config))?
    } else {
        info!(config_path = %cli.config, "Configuration file not found, using defaults");
        Config::default()
    };

    if let Some(port) = cli.port {
        config.server.port = port;
    }

    info!(
        driver = ?config.camera.driver,
        device = %config.camera.device,
        resolution = %format!("{}x{}", config.camera.width, config.camera.height),
        format = %config.camera.pixel_format,
        buffers = config.camera.buffer_count,
        "Configuration loaded"
    );

    let pipeline = Pipeline::start(&config)
        .await
        .context("starting pipeline")?;

    info!(addr = %pipeline.local_addr(), "Streaming started, press Ctrl+C to stop");

    let stats_period = Duration::from_secs(config.stats_interval_seconds.max(1));
    let mut ticker = tokio::time::interval(stats_period);
    ticker.tick().await;

    let mut last_capture = CaptureStats::default();
    let mut last_server = ServerStats::default();
    let mut last_at = Instant::now();

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for Ctrl+C")?;
                info!("Shutting down");
                break;
            }
            _ = ticker.tick() => {
                if pipeline.server_finished() {
                    warn!("Frame server stopped unexpectedly");
                    break;
                }
                if config.stats_interval_seconds == 0 {
                    continue;
                }

                let capture = pipeline.capture_stats();
                let server = pipeline.server_stats();
                let elapsed = last_at.elapsed().as_secs_f64();

                info!(
                    status = %pipeline.producer_status(),
                    capture_fps = %format!("{:.1}", capture.calculate_fps(&last_capture, elapsed)),
                    send_fps = %format!("{:.1}", server.calculate_fps(&last_server, elapsed)),
                    kbps = %format!("{:.0}", server.calculate_bitrate_kbps(&last_server, elapsed)),
                    captured = capture.frames_captured,
                    published = capture.frames_published,
                    skipped = capture.frames_skipped,
                    restarts = capture.restarts,
                    clients = server.clients_served,
                    "Stats"
                );

                last_capture = capture;
                last_server = server;
                last_at = Instant::now();
            }
        }
    }

    if let Err(e) = pipeline.shutdown().await {
        warn!(error = %e, "Pipeline ended with an error");
    }

    Ok(())
}
