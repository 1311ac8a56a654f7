//! Camera driver interface consumed by the capture engine

use crate::format::{Fraction, FrameGeometry, FrameInterval, PixelFormat};
use crate::pool::FrameBuffer;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("no filled buffer within {0:?}")]
    Timeout(Duration),

    #[error("device not ready: {0}")]
    NotReady(String),

    #[error("unsupported format {requested}: {reason}")]
    UnsupportedFormat {
        requested: PixelFormat,
        reason: String,
    },

    #[error("stream not started")]
    NotStreaming,

    #[error("device error: {0}")]
    Device(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Streaming camera with a driver-side buffer queue.
///
/// Buffers are owned by the caller's pool. `enqueue` gives one to the driver
/// to fill, `dequeue` gives a filled one back. The format is negotiated once
/// before `stream_start` and not changed afterwards.
pub trait CameraDriver: Send {
    fn name(&self) -> &str;

    /// Negotiates resolution and pixel format; returns what the device agreed to
    fn set_format(&mut self, requested: &FrameGeometry) -> Result<FrameGeometry, DriverError>;

    /// Frame intervals supported for `geometry`
    fn frame_intervals(&self, geometry: &FrameGeometry) -> Result<Vec<FrameInterval>, DriverError>;

    /// Current frame interval, when the device reports one
    fn frame_interval(&self) -> Option<Fraction> {
        None
    }

    fn stream_start(&mut self) -> Result<(), DriverError>;

    fn stream_stop(&mut self) -> Result<(), DriverError>;

    fn enqueue(&mut self, buffer: FrameBuffer) -> Result<(), DriverError>;

    /// Blocks until a queued buffer has been filled. Returns
    /// [`DriverError::Timeout`] when nothing arrives within `timeout`.
    fn dequeue(&mut self, timeout: Duration) -> Result<FrameBuffer, DriverError>;

    /// Buffers currently waiting in the driver queue
    fn queued(&self) -> usize;
}
