//! Software video generator: scrolling colour bars at a fixed frame rate

use super::driver::{CameraDriver, DriverError};
use crate::format::{rgb888_to_rgb565, Fraction, FrameGeometry, FrameInterval, PixelFormat};
use crate::pool::FrameBuffer;
use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

// White, yellow, cyan, green, magenta, red, blue, black
const BARS: [[u8; 3]; 8] = [
    [255, 255, 255],
    [255, 255, 0],
    [0, 255, 255],
    [0, 255, 0],
    [255, 0, 255],
    [255, 0, 0],
    [0, 0, 255],
    [0, 0, 0],
];

/// Generator standing in for a camera sensor
pub struct TestPatternDriver {
    fps: u32,
    geometry: Option<FrameGeometry>,
    queue: VecDeque<FrameBuffer>,
    streaming: bool,
    frames: u64,
    next_frame_at: Option<Instant>,
}

impl TestPatternDriver {
    pub fn new(fps: u32) -> Self {
        Self {
            fps: fps.max(1),
            geometry: None,
            queue: VecDeque::new(),
            streaming: false,
            frames: 0,
            next_frame_at: None,
        }
    }

    fn frame_period(&self) -> Duration {
        Duration::from_secs(1) / self.fps
    }

    /// Waits for the next frame slot. Returns false if it lies beyond `timeout`.
    fn pace(&mut self, timeout: Duration) -> bool {
        let now = Instant::now();
        let due = self.next_frame_at.unwrap_or(now);
        if due > now {
            let wait = due - now;
            if wait > timeout {
                thread::sleep(timeout);
                return false;
            }
            thread::sleep(wait);
        }

        let period = self.frame_period();
        let next = due + period;
        // Do not try to catch up after a stall
        self.next_frame_at = Some(if next < Instant::now() {
            Instant::now() + period
        } else {
            next
        });
        true
    }

    fn render(&self, geometry: &FrameGeometry, frame: &mut [u8]) {
        let width = geometry.width as usize;
        let bar_width = (width / BARS.len()).max(1);
        let shift = self.frames as usize;
        let pitch = geometry.pitch();
        let bpp = geometry.format.bytes_per_pixel();

        for (y, row) in frame.chunks_exact_mut(pitch).take(geometry.height as usize).enumerate() {
            for x in 0..width {
                let [r, g, b] = BARS[((x + shift) / bar_width) % BARS.len()];
                let px = &mut row[x * bpp..(x + 1) * bpp];
                match geometry.format {
                    PixelFormat::Rgb565 => px.copy_from_slice(&rgb888_to_rgb565(r, g, b).to_le_bytes()),
                    PixelFormat::Bgr565 => px.copy_from_slice(&rgb888_to_rgb565(r, g, b).to_be_bytes()),
                    PixelFormat::Rgb24 => px.copy_from_slice(&[r, g, b]),
                    PixelFormat::Grey => px[0] = luma(r, g, b),
                    PixelFormat::Yuyv => {
                        // Neutral chroma; even pixels carry U, odd pixels V
                        px[0] = luma(r, g, b);
                        px[1] = 128;
                    }
                }
            }
            // Dark scanline marker so consecutive frames are distinguishable
            if y == (self.frames as usize) % geometry.height as usize {
                row.fill(0);
            }
        }
    }
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((77 * r as u32 + 150 * g as u32 + 29 * b as u32) >> 8) as u8
}

impl CameraDriver for TestPatternDriver {
    fn name(&self) -> &str {
        "test-pattern"
    }

    fn set_format(&mut self, requested: &FrameGeometry) -> Result<FrameGeometry, DriverError> {
        if self.streaming {
            return Err(DriverError::Device(
                "format cannot change while streaming".to_string(),
            ));
        }
        self.geometry = Some(*requested);
        Ok(*requested)
    }

    fn frame_intervals(&self, _geometry: &FrameGeometry) -> Result<Vec<FrameInterval>, DriverError> {
        Ok(vec![FrameInterval::Discrete(Fraction::new(1, self.fps))])
    }

    fn frame_interval(&self) -> Option<Fraction> {
        Some(Fraction::new(1, self.fps))
    }

    fn stream_start(&mut self) -> Result<(), DriverError> {
        if self.geometry.is_none() {
            return Err(DriverError::NotReady("format not negotiated".to_string()));
        }
        self.streaming = true;
        self.next_frame_at = None;
        debug!(fps = self.fps, "Test pattern stream started");
        Ok(())
    }

    fn stream_stop(&mut self) -> Result<(), DriverError> {
        self.streaming = false;
        Ok(())
    }

    fn enqueue(&mut self, buffer: FrameBuffer) -> Result<(), DriverError> {
        self.queue.push_back(buffer);
        Ok(())
    }

    fn dequeue(&mut self, timeout: Duration) -> Result<FrameBuffer, DriverError> {
        if !self.streaming {
            return Err(DriverError::NotStreaming);
        }
        let geometry = self.geometry.ok_or(DriverError::NotStreaming)?;

        if self.queue.is_empty() {
            // Nothing to fill: behaves like a starved sensor
            thread::sleep(timeout);
            return Err(DriverError::Timeout(timeout));
        }
        if !self.pace(timeout) {
            return Err(DriverError::Timeout(timeout));
        }

        let mut buffer = self.queue.pop_front().ok_or(DriverError::Timeout(timeout))?;
        let frame_size = geometry.frame_size().min(buffer.capacity());
        self.render(&geometry, &mut buffer.data_mut()[..frame_size]);
        buffer.set_bytes_used(frame_size);
        buffer.set_sequence(self.frames);
        self.frames += 1;
        Ok(buffer)
    }

    fn queued(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;

    fn streaming_driver(geometry: &FrameGeometry, fps: u32) -> (TestPatternDriver, BufferPool) {
        let mut driver = TestPatternDriver::new(fps);
        driver.set_format(geometry).unwrap();
        let mut pool = BufferPool::preallocate(3, geometry.frame_size(), 32).unwrap();
        pool.prime(&mut driver).unwrap();
        driver.stream_start().unwrap();
        (driver, pool)
    }

    #[test]
    fn test_fills_whole_frame() {
        let geometry = FrameGeometry::new(240, 240, PixelFormat::Bgr565).unwrap();
        let (mut driver, pool) = streaming_driver(&geometry, 1000);

        let buffer = pool.dequeue(&mut driver, Duration::from_secs(1)).unwrap();
        assert_eq!(buffer.bytes_used(), 115_200);
        assert_eq!(buffer.sequence(), 0);
        // First pixel of row 1 is the white bar
        assert_eq!(&buffer.data()[480..482], &[0xFF, 0xFF]);
    }

    #[test]
    fn test_frames_differ() {
        let geometry = FrameGeometry::new(64, 8, PixelFormat::Rgb24).unwrap();
        let (mut driver, pool) = streaming_driver(&geometry, 1000);

        let first = pool.dequeue(&mut driver, Duration::from_secs(1)).unwrap();
        let second = pool.dequeue(&mut driver, Duration::from_secs(1)).unwrap();
        assert_eq!(second.sequence(), 1);
        assert_ne!(first.data(), second.data());
    }

    #[test]
    fn test_dequeue_requires_stream() {
        let geometry = FrameGeometry::new(8, 8, PixelFormat::Grey).unwrap();
        let mut driver = TestPatternDriver::new(30);
        driver.set_format(&geometry).unwrap();
        assert!(matches!(
            driver.dequeue(Duration::from_millis(1)),
            Err(DriverError::NotStreaming)
        ));
    }

    #[test]
    fn test_empty_queue_times_out() {
        let geometry = FrameGeometry::new(8, 8, PixelFormat::Grey).unwrap();
        let mut driver = TestPatternDriver::new(30);
        driver.set_format(&geometry).unwrap();
        driver.stream_start().unwrap();
        let started = Instant::now();
        assert!(matches!(
            driver.dequeue(Duration::from_millis(20)),
            Err(DriverError::Timeout(_))
        ));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_start_without_format_fails() {
        let mut driver = TestPatternDriver::new(30);
        assert!(matches!(driver.stream_start(), Err(DriverError::NotReady(_))));
    }
}
