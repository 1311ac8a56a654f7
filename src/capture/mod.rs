//! Camera capture loop
//!
//! [`CaptureEngine`] performs INIT (format negotiation, display setup, pool
//! allocation, stream start) and yields a [`StreamingCapture`], whose loop is
//! dequeue, maybe publish, display, requeue. A published buffer is not
//! requeued; it returns to the driver once the consumer drops its lease.

mod driver;
#[cfg(feature = "gst")]
mod gst;
mod platform;
mod supervisor;
mod test_pattern;
#[cfg(feature = "v4l2")]
mod v4l2;

pub use driver::{CameraDriver, DriverError};
#[cfg(feature = "gst")]
pub use gst::GstDriver;
pub use platform::{default_device, detect_platform, PlatformInfo};
pub use supervisor::{CaptureSupervisor, DisplayFactory, DriverFactory, RestartPolicy, SupervisorHandle};
pub use test_pattern::TestPatternDriver;
#[cfg(feature = "v4l2")]
pub use v4l2::{V4l2Device, V4l2Driver};

use crate::display::{DisplayError, DisplaySink};
use crate::format::FrameGeometry;
use crate::handoff::FrameHandoff;
use crate::pool::{BufferPool, BufferState, PoolError};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("camera initialisation failed: {0}")]
    Init(#[source] DriverError),

    #[error("unable to set format: {0}")]
    Format(#[source] DriverError),

    #[error("display setup failed: {0}")]
    Display(#[from] DisplayError),

    #[error("buffer pool error: {0}")]
    Pool(#[source] PoolError),

    #[error("unable to start video stream: {0}")]
    StreamStart(#[source] DriverError),

    #[error("no frame from camera within {0:?}")]
    DequeueTimeout(Duration),

    #[error("camera driver error: {0}")]
    Driver(#[source] DriverError),
}

impl From<PoolError> for CaptureError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Driver(DriverError::Timeout(timeout)) => CaptureError::DequeueTimeout(timeout),
            PoolError::Driver(e) => CaptureError::Driver(e),
            other => CaptureError::Pool(other),
        }
    }
}

/// Capture configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Requested geometry; the driver may only agree to it exactly
    pub geometry: FrameGeometry,
    pub buffer_count: usize,
    pub buffer_alignment: usize,
    pub dequeue_timeout: Duration,
}

/// Statistics for capture
#[derive(Debug, Clone, Default, Serialize)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub frames_published: u64,
    /// Complete frames dropped because no new frame was requested
    pub frames_skipped: u64,
    /// Frames whose size did not match the negotiated geometry
    pub short_frames: u64,
    pub display_errors: u64,
    pub restarts: u64,
    pub is_running: bool,
}

impl CaptureStats {
    /// Captured frames per second based on delta
    pub fn calculate_fps(&self, previous: &Self, elapsed_secs: f64) -> f64 {
        if elapsed_secs == 0.0 {
            return 0.0;
        }
        self.frames_captured.saturating_sub(previous.frames_captured) as f64 / elapsed_secs
    }
}

/// Lock-free counters shared between the capture thread and observers
#[derive(Debug, Default)]
pub struct CaptureCounters {
    frames_captured: AtomicU64,
    frames_published: AtomicU64,
    frames_skipped: AtomicU64,
    short_frames: AtomicU64,
    display_errors: AtomicU64,
    restarts: AtomicU64,
    is_running: AtomicBool,
}

impl CaptureCounters {
    pub fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_published: self.frames_published.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            short_frames: self.short_frames.load(Ordering::Relaxed),
            display_errors: self.display_errors.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            is_running: self.is_running.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }
}

/// Capture engine before INIT
pub struct CaptureEngine {
    config: CaptureConfig,
    driver: Box<dyn CameraDriver>,
    display: Box<dyn DisplaySink>,
    handoff: Arc<FrameHandoff>,
    counters: Arc<CaptureCounters>,
}

impl CaptureEngine {
    pub fn new(
        config: CaptureConfig,
        driver: Box<dyn CameraDriver>,
        display: Box<dyn DisplaySink>,
        handoff: Arc<FrameHandoff>,
    ) -> Self {
        Self {
            config,
            driver,
            display,
            handoff,
            counters: Arc::new(CaptureCounters::default()),
        }
    }

    /// Shares an existing set of counters, so they survive restarts
    pub fn with_counters(mut self, counters: Arc<CaptureCounters>) -> Self {
        self.counters = counters;
        self
    }

    pub fn counters(&self) -> Arc<CaptureCounters> {
        Arc::clone(&self.counters)
    }

    /// INIT: negotiates the format, sets up the display, allocates and queues
    /// the pool and starts the stream. Every failure here is fatal.
    pub fn start(mut self) -> Result<StreamingCapture, CaptureError> {
        let requested = self.config.geometry;

        info!(
            driver = %self.driver.name(),
            format = %requested.format,
            resolution = %format!("{}x{}", requested.width, requested.height),
            "Initialising camera"
        );

        let geometry = self.driver.set_format(&requested).map_err(CaptureError::Format)?;
        if geometry != requested {
            return Err(CaptureError::Format(DriverError::UnsupportedFormat {
                requested: requested.format,
                reason: format!("driver agreed to {} instead of {}", geometry, requested),
            }));
        }

        if let Some(interval) = self.driver.frame_interval() {
            info!(fps = %format!("{:.1}", interval.fps()), "Default frame rate");
        }
        match self.driver.frame_intervals(&geometry) {
            Ok(intervals) => {
                for interval in intervals {
                    info!(interval = %interval, "Supported frame interval");
                }
            }
            Err(e) => warn!(error = %e, "Unable to enumerate frame intervals"),
        }

        self.display.setup(&geometry)?;

        let frame_size = geometry.frame_size();
        let mut pool = BufferPool::preallocate(
            self.config.buffer_count,
            frame_size,
            self.config.buffer_alignment,
        )?;
        pool.prime(self.driver.as_mut())?;

        self.driver.stream_start().map_err(CaptureError::StreamStart)?;
        self.counters.is_running.store(true, Ordering::Relaxed);

        info!(
            geometry = %geometry,
            frame_size = frame_size,
            buffers = self.config.buffer_count,
            "Camera stream started"
        );

        Ok(StreamingCapture {
            geometry,
            dequeue_timeout: self.config.dequeue_timeout,
            driver: self.driver,
            display: self.display,
            handoff: self.handoff,
            counters: self.counters,
            pool,
        })
    }
}

/// Capture engine after INIT; owns the pool and the running stream
pub struct StreamingCapture {
    geometry: FrameGeometry,
    dequeue_timeout: Duration,
    driver: Box<dyn CameraDriver>,
    display: Box<dyn DisplaySink>,
    handoff: Arc<FrameHandoff>,
    counters: Arc<CaptureCounters>,
    pool: BufferPool,
}

impl StreamingCapture {
    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn stats(&self) -> CaptureStats {
        self.counters.snapshot()
    }

    /// One iteration: dequeue, maybe publish, display, requeue
    pub fn step(&mut self) -> Result<(), CaptureError> {
        let reclaimed = self.pool.reclaim(self.driver.as_mut())?;
        if reclaimed > 0 {
            debug!(reclaimed, "Released buffers requeued");
        }

        let buffer = self.pool.dequeue(self.driver.as_mut(), self.dequeue_timeout)?;
        self.counters.frames_captured.fetch_add(1, Ordering::Relaxed);

        let complete = buffer.bytes_used() == self.geometry.frame_size();
        if !complete {
            self.counters.short_frames.fetch_add(1, Ordering::Relaxed);
            warn!(
                buffer = buffer.index(),
                bytes = buffer.bytes_used(),
                expected = self.geometry.frame_size(),
                "Incomplete frame, not publishing"
            );
        }

        let publish = complete && self.handoff.take_request();

        if let Err(e) = self.display.write(buffer.data(), &self.geometry) {
            self.counters.display_errors.fetch_add(1, Ordering::Relaxed);
            warn!(display = %self.display.name(), error = %e, "Display write failed");
        }

        if publish {
            let lease = self.pool.hand_off(buffer)?;
            debug!(buffer = lease.index(), sequence = lease.sequence(), "Frame handed off");
            self.handoff.publish(lease);
            self.counters.frames_published.fetch_add(1, Ordering::Relaxed);
        } else {
            if complete {
                self.counters.frames_skipped.fetch_add(1, Ordering::Relaxed);
            }
            self.pool.enqueue(self.driver.as_mut(), buffer)?;
        }

        Ok(())
    }

    /// Runs the loop until `stop` is set or a fatal error occurs
    pub fn run_until(mut self, stop: &AtomicBool) -> Result<(), CaptureError> {
        while !stop.load(Ordering::Acquire) {
            if let Err(e) = self.step() {
                error!(
                    error = %e,
                    queued = self.pool.count(BufferState::Queued),
                    handed_off = self.pool.count(BufferState::HandedOff),
                    "Capture loop terminated"
                );
                return Err(e);
            }
        }
        info!("Capture loop stopped");
        Ok(())
    }
}

impl fmt::Debug for StreamingCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingCapture")
            .field("driver", &self.driver.name())
            .field("geometry", &self.geometry)
            .field("dequeue_timeout", &self.dequeue_timeout)
            .field("pool", &self.pool)
            .finish()
    }
}

impl Drop for StreamingCapture {
    fn drop(&mut self) {
        self.counters.is_running.store(false, Ordering::Relaxed);
        if let Err(e) = self.driver.stream_stop() {
            warn!(error = %e, "Failed to stop camera stream");
        }
    }
}
