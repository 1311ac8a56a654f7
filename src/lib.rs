//! Camera-to-TCP raw frame streaming for small embedded displays
//!
//! This library captures uncompressed frames into a fixed pool of aligned
//! buffers and serves them to one TCP client at a time:
//! - Preallocated buffer pool with checked per-buffer state
//! - Capture loop on a dedicated thread, restarted on fatal errors
//! - Single-slot, pull-based handoff; published buffers are leased, never
//!   requeued while the server reads them
//! - `READY` + raw frame wire format, no length prefix
//!
//! # Example
//!
//! ```no_run
//! use frame_streamer::{Config, Pipeline};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let pipeline = Pipeline::start(&config).await?;
//! println!("serving {} frames on {}", pipeline.geometry(), pipeline.local_addr());
//! pipeline.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod client;
pub mod config;
pub mod display;
pub mod format;
pub mod handoff;
pub mod pipeline;
pub mod pool;
pub mod server;

// Re-exports for convenience
pub use capture::{CameraDriver, CaptureConfig, CaptureEngine, CaptureError, CaptureStats, DriverError};
pub use client::{ClientError, FrameClient};
pub use config::Config;
pub use format::{FrameGeometry, PixelFormat};
pub use handoff::{FrameHandoff, ProducerStatus};
pub use pipeline::{Pipeline, PipelineError};
pub use pool::{BufferPool, BufferState, FrameLease};
pub use server::{ServerConfig, ServerStats, StreamingServer, ERROR_MARKER, READY_MARKER};
