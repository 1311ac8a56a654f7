//! Receives frames from a frame streamer, counts them and optionally saves
//! every n-th frame as a PPM image

use anyhow::{Context, Result};
use clap::Parser;
use frame_streamer::display::write_ppm;
use frame_streamer::format::to_rgb888;
use frame_streamer::{ClientError, FrameClient, FrameGeometry, PixelFormat};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "frame-client")]
#[command(about = "Receives raw frames from a frame streamer")]
#[command(version)]
struct Cli {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = 5000)]
    port: u16,

    /// Frame width in pixels
    #[arg(long, default_value_t = 240)]
    width: u32,

    /// Frame height in pixels
    #[arg(long, default_value_t = 240)]
    height: u32,

    /// Pixel format of the stream
    #[arg(short, long, default_value = "BGR565")]
    format: PixelFormat,

    /// Stop after this many frames (0 = run until the server disconnects)
    #[arg(short = 'n', long, default_value_t = 0)]
    frames: u64,

    /// Directory for PPM snapshots
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Save every n-th frame when --output is set
    #[arg(long, default_value_t = 30)]
    every: u64,

    /// Give up if no frame arrives within this many milliseconds
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt().with_env_filter(filter).with_target(false).init();

    let geometry = FrameGeometry::new(cli.width, cli.height, cli.format)?;
    if let Some(ref dir) = cli.output {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }

    let addr = format!("{}:{}", cli.host, cli.port);
    let mut client = FrameClient::connect(&addr, geometry).await?;
    let timeout = Duration::from_millis(cli.timeout_ms);
    let every = cli.every.max(1);

    let started = Instant::now();
    let mut rgb = vec![0u8; geometry.width as usize * geometry.height as usize * 3];

    loop {
        if cli.frames > 0 && client.frames_received() >= cli.frames {
            break;
        }

        let frame = match client.recv_frame_timeout(timeout).await {
            Ok(frame) => frame,
            Err(ClientError::Closed) => {
                info!("Server closed the connection");
                break;
            }
            Err(ClientError::ServerError) => {
                warn!("Server has no frames to send");
                break;
            }
            Err(e) => return Err(e.into()),
        };

        let index = client.frames_received() - 1;
        if let Some(ref dir) = cli.output {
            if index % every == 0 {
                to_rgb888(&geometry, &frame, &mut rgb)?;
                let path = dir.join(format!("frame_{:06}.ppm", index));
                let mut file = BufWriter::new(fs::File::create(&path)?);
                write_ppm(&mut file, geometry.width, geometry.height, &rgb)?;
                file.flush()?;
                info!(path = %path.display(), "Saved frame");
            }
        }

        if client.frames_received() % 100 == 0 {
            let elapsed = started.elapsed().as_secs_f64();
            info!(
                frames = client.frames_received(),
                fps = %format!("{:.1}", client.frames_received() as f64 / elapsed),
                "Receiving"
            );
        }
    }

    let elapsed = started.elapsed().as_secs_f64();
    info!(
        frames = client.frames_received(),
        seconds = %format!("{:.1}", elapsed),
        frame_size = geometry.frame_size(),
        "Done"
    );

    Ok(())
}
