//! End-to-end tests over loopback: test pattern camera → pool → handoff →
//! TCP server → client

use assert_matches::assert_matches;
use frame_streamer::capture::{
    CameraDriver, CaptureConfig, CaptureEngine, CaptureError, DisplayFactory, DriverError,
    DriverFactory,
};
use frame_streamer::config::Config;
use frame_streamer::display::{DisplaySink, NullDisplay};
use frame_streamer::format::{FrameGeometry, FrameInterval, PixelFormat};
use frame_streamer::pool::FrameBuffer;
use frame_streamer::{
    ClientError, FrameClient, FrameHandoff, Pipeline, PipelineError, ProducerStatus, READY_MARKER,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, Instant};

const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

fn loopback_config() -> Config {
    let mut config = Config::default();
    config.server.bind_address = "127.0.0.1".to_string();
    config.server.port = 0;
    config.server.frame_wait_timeout_ms = 2_000;
    config.camera.width = 240;
    config.camera.height = 240;
    config.camera.pixel_format = PixelFormat::Bgr565;
    config.camera.buffer_count = 4;
    config.camera.fps = 60;
    config.supervisor.initial_backoff_ms = 10;
    config.supervisor.max_backoff_ms = 20;
    config
}

fn null_display() -> DisplayFactory {
    Box::new(|| Box::new(NullDisplay) as Box<dyn DisplaySink>)
}

async fn wait_for_status(pipeline: &Pipeline, status: ProducerStatus) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while pipeline.producer_status() != status && Instant::now() < deadline {
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(pipeline.producer_status(), status);
}

/// Accepts the format and buffers but never delivers a frame
struct StalledDriver {
    geometry: Option<FrameGeometry>,
    queue: VecDeque<FrameBuffer>,
}

impl StalledDriver {
    fn new() -> Self {
        Self {
            geometry: None,
            queue: VecDeque::new(),
        }
    }
}

impl CameraDriver for StalledDriver {
    fn name(&self) -> &str {
        "stalled"
    }

    fn set_format(&mut self, requested: &FrameGeometry) -> Result<FrameGeometry, DriverError> {
        self.geometry = Some(*requested);
        Ok(*requested)
    }

    fn frame_intervals(&self, _geometry: &FrameGeometry) -> Result<Vec<FrameInterval>, DriverError> {
        Ok(Vec::new())
    }

    fn stream_start(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn stream_stop(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn enqueue(&mut self, buffer: FrameBuffer) -> Result<(), DriverError> {
        self.queue.push_back(buffer);
        Ok(())
    }

    fn dequeue(&mut self, timeout: Duration) -> Result<FrameBuffer, DriverError> {
        thread::sleep(timeout);
        Err(DriverError::Timeout(timeout))
    }

    fn queued(&self) -> usize {
        self.queue.len()
    }
}

#[tokio::test]
async fn test_streams_ready_then_full_frames() {
    let pipeline = Pipeline::start(&loopback_config()).await.unwrap();
    assert_eq!(pipeline.geometry().frame_size(), 115_200);

    let mut stream = TcpStream::connect(pipeline.local_addr()).await.unwrap();
    let mut cycle = vec![0u8; 5 + 115_200];
    for _ in 0..10 {
        tokio::time::timeout(FRAME_TIMEOUT, stream.read_exact(&mut cycle))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&cycle[..5], &[b'R', b'E', b'A', b'D', b'Y']);
    }
    drop(stream);

    let stats = pipeline.server_stats();
    assert!(stats.frames_sent >= 10);
    assert!(pipeline.capture_stats().frames_published >= 1);

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_client_reconnects_without_capture_restart() {
    let pipeline = Pipeline::start(&loopback_config()).await.unwrap();
    let addr = pipeline.local_addr().to_string();
    let geometry = pipeline.geometry();

    {
        let mut first = FrameClient::connect(&addr, geometry).await.unwrap();
        for _ in 0..3 {
            let frame = first.recv_frame_timeout(FRAME_TIMEOUT).await.unwrap();
            assert_eq!(frame.len(), 115_200);
        }
    }

    let mut second = FrameClient::connect(&addr, geometry).await.unwrap();
    for _ in 0..3 {
        let frame = second.recv_frame_timeout(FRAME_TIMEOUT).await.unwrap();
        assert_eq!(frame.len(), 115_200);
    }

    let stats = pipeline.server_stats();
    assert_eq!(stats.clients_served, 2);
    assert_eq!(stats.disconnects, 1);
    assert_eq!(pipeline.capture_stats().restarts, 0);
    assert_eq!(pipeline.producer_status(), ProducerStatus::Running);

    drop(second);
    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_fresh_frames_only() {
    let mut config = loopback_config();
    config.server.repeat_frames = false;
    config.camera.width = 64;
    config.camera.height = 64;

    let pipeline = Pipeline::start(&config).await.unwrap();
    let addr = pipeline.local_addr().to_string();
    let mut client = FrameClient::connect(&addr, pipeline.geometry()).await.unwrap();

    let mut previous = client.recv_frame_timeout(FRAME_TIMEOUT).await.unwrap();
    for _ in 0..5 {
        let frame = client.recv_frame_timeout(FRAME_TIMEOUT).await.unwrap();
        assert_ne!(frame, previous);
        previous = frame;
    }

    drop(client);
    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_error_marker_after_capture_gives_up() {
    let mut config = loopback_config();
    config.supervisor.max_restarts = 1;

    let factory: DriverFactory = Box::new(|| -> Result<Box<dyn CameraDriver>, DriverError> {
        Err(DriverError::NotReady("no sensor attached".to_string()))
    });
    let pipeline = Pipeline::start_with(&config, factory, null_display()).await.unwrap();
    wait_for_status(&pipeline, ProducerStatus::Failed).await;

    let mut client = FrameClient::connect(&pipeline.local_addr().to_string(), pipeline.geometry())
        .await
        .unwrap();
    assert_matches!(
        client.recv_frame_timeout(FRAME_TIMEOUT).await,
        Err(ClientError::ServerError)
    );
    assert_eq!(pipeline.server_stats().error_markers_sent, 1);
    assert_eq!(pipeline.capture_stats().restarts, 1);

    assert_matches!(
        pipeline.shutdown().await,
        Err(PipelineError::Capture(CaptureError::Init(DriverError::NotReady(_))))
    );
}

#[tokio::test]
async fn test_stalled_camera_surfaces_dequeue_timeout() {
    let mut config = loopback_config();
    config.camera.dequeue_timeout_ms = 50;
    config.supervisor.max_restarts = 0;

    let factory: DriverFactory = Box::new(|| -> Result<Box<dyn CameraDriver>, DriverError> {
        Ok(Box::new(StalledDriver::new()))
    });
    let pipeline = Pipeline::start_with(&config, factory, null_display()).await.unwrap();
    wait_for_status(&pipeline, ProducerStatus::Failed).await;

    let mut stream = TcpStream::connect(pipeline.local_addr()).await.unwrap();
    let mut received = Vec::new();
    stream.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"ERROR");
    assert_ne!(received.as_slice(), READY_MARKER);

    assert_matches!(
        pipeline.shutdown().await,
        Err(PipelineError::Capture(CaptureError::DequeueTimeout(_)))
    );
}

#[test]
fn test_dequeue_timeout_is_a_distinct_error() {
    let config = CaptureConfig {
        geometry: FrameGeometry::new(240, 240, PixelFormat::Bgr565).unwrap(),
        buffer_count: 4,
        buffer_alignment: 64,
        dequeue_timeout: Duration::from_millis(20),
    };
    let engine = CaptureEngine::new(
        config,
        Box::new(StalledDriver::new()),
        Box::new(NullDisplay),
        Arc::new(FrameHandoff::new()),
    );

    let mut capture = engine.start().unwrap();
    assert_matches!(capture.step(), Err(CaptureError::DequeueTimeout(t)) if t == Duration::from_millis(20));
}
