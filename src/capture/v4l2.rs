//! V4L2 mmap streaming backend

use super::driver::{CameraDriver, DriverError};
use crate::format::{Fraction, FrameGeometry, FrameInterval, PixelFormat};
use crate::pool::FrameBuffer;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::time::Duration;
use tracing::info;
use v4l::{
    buffer::Type,
    frameinterval::FrameIntervalEnum,
    io::{mmap::Stream as MmapStream, traits::CaptureStream},
    video::Capture,
    Device, Format, FourCC,
};

/// Camera behind a V4L2 device node.
///
/// The kernel fills its own mmap buffers; each dequeued frame is copied into
/// the pool buffer at the head of the queue.
pub struct V4l2Driver {
    path: String,
    device: &'static Device,
    kernel_buffers: u32,
    geometry: Option<FrameGeometry>,
    stream: Option<MmapStream<'static>>,
    queue: VecDeque<FrameBuffer>,
    frames: u64,
}

/// A device node opened at most once for the life of the process.
///
/// The mmap stream borrows the device for as long as it runs, so the device
/// is leaked; every driver built here shares that one handle, and capture
/// restarts reuse it instead of opening the node again.
pub struct V4l2Device {
    path: String,
    device: OpenOnce<Device>,
}

impl V4l2Device {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            device: OpenOnce::new(),
        }
    }

    /// Builds a driver on the shared handle, opening the node on first use
    pub fn driver(&self, kernel_buffers: u32) -> Result<V4l2Driver, DriverError> {
        let device = self.device.get_or_open(|| {
            Device::with_path(&self.path)
                .map_err(|e| DriverError::NotReady(format!("{}: {}", self.path, e)))
        })?;
        Ok(V4l2Driver::with_device(&self.path, device, kernel_buffers))
    }
}

/// Leaks the value from the first successful open and hands it out after
struct OpenOnce<T: 'static> {
    handle: Mutex<Option<&'static T>>,
}

impl<T: 'static> OpenOnce<T> {
    fn new() -> Self {
        Self {
            handle: Mutex::new(None),
        }
    }

    fn get_or_open<E>(&self, open: impl FnOnce() -> Result<T, E>) -> Result<&'static T, E> {
        let mut handle = self.handle.lock();
        if let Some(value) = *handle {
            return Ok(value);
        }
        let value: &'static T = Box::leak(Box::new(open()?));
        *handle = Some(value);
        Ok(value)
    }
}

impl V4l2Driver {
    fn with_device(path: &str, device: &'static Device, kernel_buffers: u32) -> Self {
        Self {
            path: path.to_string(),
            device,
            kernel_buffers: kernel_buffers.max(2),
            geometry: None,
            stream: None,
            queue: VecDeque::new(),
            frames: 0,
        }
    }
}

fn fraction(f: v4l::Fraction) -> Fraction {
    Fraction::new(f.numerator, f.denominator)
}

impl CameraDriver for V4l2Driver {
    fn name(&self) -> &str {
        "v4l2"
    }

    fn set_format(&mut self, requested: &FrameGeometry) -> Result<FrameGeometry, DriverError> {
        let wanted = Format::new(
            requested.width,
            requested.height,
            FourCC::new(&requested.format.fourcc()),
        );
        let actual = self.device.set_format(&wanted)?;

        let format = PixelFormat::from_fourcc(&actual.fourcc.repr).ok_or_else(|| {
            DriverError::UnsupportedFormat {
                requested: requested.format,
                reason: format!("device offered {}", actual.fourcc),
            }
        })?;
        if format != requested.format {
            return Err(DriverError::UnsupportedFormat {
                requested: requested.format,
                reason: format!("device offered {}", format),
            });
        }

        let geometry = FrameGeometry::new(actual.width, actual.height, format)
            .map_err(|e| DriverError::Device(e.to_string()))?;
        info!(device = %self.path, format = %actual, "Camera format set");
        self.geometry = Some(geometry);
        Ok(geometry)
    }

    fn frame_intervals(&self, geometry: &FrameGeometry) -> Result<Vec<FrameInterval>, DriverError> {
        let intervals = self.device.enum_frameintervals(
            FourCC::new(&geometry.format.fourcc()),
            geometry.width,
            geometry.height,
        )?;

        Ok(intervals
            .into_iter()
            .map(|fi| match fi.interval {
                FrameIntervalEnum::Discrete(f) => FrameInterval::Discrete(fraction(f)),
                FrameIntervalEnum::Stepwise(s) => FrameInterval::Stepwise {
                    min: fraction(s.min),
                    max: fraction(s.max),
                    step: fraction(s.step),
                },
            })
            .collect())
    }

    fn stream_start(&mut self) -> Result<(), DriverError> {
        if self.geometry.is_none() {
            return Err(DriverError::NotReady("format not negotiated".to_string()));
        }
        let stream = MmapStream::with_buffers(self.device, Type::VideoCapture, self.kernel_buffers)?;
        self.stream = Some(stream);
        Ok(())
    }

    fn stream_stop(&mut self) -> Result<(), DriverError> {
        // Dropping the stream stops it and unmaps the kernel buffers
        self.stream = None;
        Ok(())
    }

    fn enqueue(&mut self, buffer: FrameBuffer) -> Result<(), DriverError> {
        self.queue.push_back(buffer);
        Ok(())
    }

    fn dequeue(&mut self, timeout: Duration) -> Result<FrameBuffer, DriverError> {
        let stream = self.stream.as_mut().ok_or(DriverError::NotStreaming)?;
        let mut buffer = self.queue.pop_front().ok_or(DriverError::Timeout(timeout))?;

        stream.set_timeout(timeout);
        let (data, meta) = match stream.next() {
            Ok(frame) => frame,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                self.queue.push_front(buffer);
                return Err(DriverError::Timeout(timeout));
            }
            Err(e) => {
                self.queue.push_front(buffer);
                return Err(e.into());
            }
        };

        let len = (meta.bytesused as usize).min(data.len()).min(buffer.capacity());
        buffer.data_mut()[..len].copy_from_slice(&data[..len]);
        buffer.set_bytes_used(len);
        buffer.set_sequence(self.frames);
        self.frames += 1;
        Ok(buffer)
    }

    fn queued(&self) -> usize {
        self.queue.len()
    }
}
