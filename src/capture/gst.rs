//! GStreamer `appsink` camera backend

use super::driver::{CameraDriver, DriverError};
use super::platform::{detect_platform, PlatformInfo};
use crate::format::{Fraction, FrameGeometry, FrameInterval, PixelFormat};
use crate::pool::FrameBuffer;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Raw frames pulled from a GStreamer pipeline ending in an appsink.
///
/// The pipeline converts and scales to the negotiated geometry, so the device
/// always agrees to the requested format. Frames are copied from the GStreamer
/// buffer into the pool buffer at the head of the queue.
pub struct GstDriver {
    device: String,
    fps: u32,
    flip_method: Option<String>,
    geometry: Option<FrameGeometry>,
    pipeline: Option<gst::Pipeline>,
    app_sink: Option<gst_app::AppSink>,
    queue: VecDeque<FrameBuffer>,
    frames: u64,
}

impl GstDriver {
    /// `device` is a V4L2 path, a libcamera name, an avfoundation index, or
    /// `"test"` for `videotestsrc`
    pub fn new(device: &str, fps: u32, flip_method: Option<String>) -> Result<Self, DriverError> {
        gst::init().map_err(|e| DriverError::NotReady(e.to_string()))?;

        Ok(Self {
            device: device.to_string(),
            fps: fps.max(1),
            flip_method,
            geometry: None,
            pipeline: None,
            app_sink: None,
            queue: VecDeque::new(),
            frames: 0,
        })
    }

    fn build_pipeline_string(&self, geometry: &FrameGeometry) -> String {
        let source = if self.device == "test" {
            "videotestsrc is-live=true".to_string()
        } else {
            match detect_platform() {
                PlatformInfo::MacOS => format!("avfvideosrc device-index={}", self.device),
                PlatformInfo::RaspberryPi if !self.device.starts_with("/dev/") => {
                    format!("libcamerasrc camera-name=\"{}\"", self.device)
                }
                PlatformInfo::RaspberryPi | PlatformInfo::Linux => {
                    format!("v4l2src device={}", self.device)
                }
            }
        };

        let mut pipeline = source;
        if let Some(ref flip) = self.flip_method {
            pipeline.push_str(&flip_element(flip));
        }

        pipeline.push_str(&format!(
            " ! videoconvert ! videoscale ! video/x-raw,format={},width={},height={},framerate={}/1 \
             ! appsink name=sink max-buffers=2 drop=true sync=false",
            caps_format(geometry.format),
            geometry.width,
            geometry.height,
            self.fps
        ));

        pipeline
    }
}

/// GStreamer raw video format name for a pixel format
fn caps_format(format: PixelFormat) -> &'static str {
    match format {
        // GStreamer has no big-endian 5:6:5 layout; words are swapped after copy
        PixelFormat::Rgb565 | PixelFormat::Bgr565 => "RGB16",
        PixelFormat::Yuyv => "YUY2",
        PixelFormat::Rgb24 => "RGB",
        PixelFormat::Grey => "GRAY8",
    }
}

fn flip_element(method: &str) -> String {
    match method {
        "vertical-flip" => " ! videoflip video-direction=5".to_string(),
        "horizontal-flip" => " ! videoflip video-direction=4".to_string(),
        "rotate-180" => " ! videoflip video-direction=2".to_string(),
        "rotate-90" => " ! videoflip video-direction=1".to_string(),
        "rotate-270" => " ! videoflip video-direction=3".to_string(),
        _ => {
            warn!(method = %method, "Unknown flip method");
            String::new()
        }
    }
}

impl CameraDriver for GstDriver {
    fn name(&self) -> &str {
        "gstreamer"
    }

    fn set_format(&mut self, requested: &FrameGeometry) -> Result<FrameGeometry, DriverError> {
        let description = self.build_pipeline_string(requested);
        debug!(pipeline = %description, "Creating GStreamer pipeline");

        let pipeline = gst::parse::launch(&description)
            .map_err(|e| DriverError::Device(e.to_string()))?
            .dynamic_cast::<gst::Pipeline>()
            .map_err(|_| DriverError::Device("not a pipeline".to_string()))?;

        let app_sink = pipeline
            .by_name("sink")
            .ok_or_else(|| DriverError::Device("no appsink found".to_string()))?
            .dynamic_cast::<gst_app::AppSink>()
            .map_err(|_| DriverError::Device("not an appsink".to_string()))?;

        self.pipeline = Some(pipeline);
        self.app_sink = Some(app_sink);
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
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or_else(|| DriverError::NotReady("format not negotiated".to_string()))?;
        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| DriverError::Device(format!("{:?}", e)))?;
        info!(device = %self.device, "GStreamer capture started");
        Ok(())
    }

    fn stream_stop(&mut self) -> Result<(), DriverError> {
        if let Some(pipeline) = self.pipeline.as_ref() {
            pipeline
                .set_state(gst::State::Null)
                .map_err(|e| DriverError::Device(format!("{:?}", e)))?;
        }
        Ok(())
    }

    fn enqueue(&mut self, buffer: FrameBuffer) -> Result<(), DriverError> {
        self.queue.push_back(buffer);
        Ok(())
    }

    fn dequeue(&mut self, timeout: Duration) -> Result<FrameBuffer, DriverError> {
        let app_sink = self.app_sink.as_ref().ok_or(DriverError::NotStreaming)?;
        let geometry = self.geometry.ok_or(DriverError::NotStreaming)?;

        // A pulled sample needs somewhere to land; with no queued buffer the
        // pipeline keeps it until one comes back
        let mut buffer = match self.queue.pop_front() {
            Some(buffer) => buffer,
            None => {
                std::thread::sleep(timeout);
                return Err(DriverError::Timeout(timeout));
            }
        };

        let sample = match app_sink.try_pull_sample(gst::ClockTime::from_nseconds(timeout.as_nanos() as u64)) {
            Some(sample) => sample,
            None => {
                self.queue.push_front(buffer);
                if app_sink.is_eos() {
                    return Err(DriverError::Device("end of stream".to_string()));
                }
                return Err(DriverError::Timeout(timeout));
            }
        };

        let map = match sample.buffer().map(|b| b.map_readable()) {
            Some(Ok(map)) => map,
            _ => {
                self.queue.push_front(buffer);
                return Err(DriverError::Device("unable to map sample buffer".to_string()));
            }
        };

        let len = map.len().min(buffer.capacity());
        let dst = &mut buffer.data_mut()[..len];
        dst.copy_from_slice(&map.as_slice()[..len]);
        if geometry.format == PixelFormat::Bgr565 {
            for word in dst.chunks_exact_mut(2) {
                word.swap(0, 1);
            }
        }

        buffer.set_bytes_used(len);
        buffer.set_sequence(self.frames);
        self.frames += 1;
        Ok(buffer)
    }

    fn queued(&self) -> usize {
        self.queue.len()
    }
}

impl Drop for GstDriver {
    fn drop(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
        }
    }
}
