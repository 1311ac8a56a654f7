//! Wires capture, handoff and server into one running system

use crate::capture::{
    CameraDriver, CaptureCounters, CaptureError, CaptureStats, CaptureSupervisor, DisplayFactory,
    DriverError, DriverFactory, SupervisorHandle, TestPatternDriver,
};
use crate::config::{CameraConfig, Config, ConfigError, DisplayConfig, DisplayKind, DriverKind};
use crate::display::{DisplaySink, NullDisplay, SnapshotDisplay};
use crate::format::FrameGeometry;
use crate::handoff::{FrameHandoff, ProducerStatus};
use crate::server::{ServerCounters, ServerError, ServerStats, StreamingServer};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("camera driver {0:?} not compiled in")]
    DriverUnavailable(&'static str),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Running capture thread plus frame server
pub struct Pipeline {
    geometry: FrameGeometry,
    local_addr: SocketAddr,
    handoff: Arc<FrameHandoff>,
    capture: SupervisorHandle,
    capture_counters: Arc<CaptureCounters>,
    server_counters: Arc<ServerCounters>,
    server_task: JoinHandle<Result<(), ServerError>>,
    shutdown_tx: oneshot::Sender<()>,
}

impl Pipeline {
    /// Starts the pipeline with the drivers named in `config`
    pub async fn start(config: &Config) -> Result<Self, PipelineError> {
        let driver_factory = driver_factory(&config.camera)?;
        let display_factory = display_factory(&config.display);
        Self::start_with(config, driver_factory, display_factory).await
    }

    /// Starts the pipeline with caller-supplied driver and display factories
    pub async fn start_with(
        config: &Config,
        driver_factory: DriverFactory,
        display_factory: DisplayFactory,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let capture_config = config.capture_config()?;
        let geometry = capture_config.geometry;
        let handoff = Arc::new(FrameHandoff::new());

        // The network side comes up first; without a listener there is
        // nobody to capture for
        let server = StreamingServer::bind(config.server_config(), Arc::clone(&handoff)).await?;
        let local_addr = server.local_addr()?;
        let server_counters = server.counters();

        let supervisor = CaptureSupervisor::new(
            capture_config,
            config.restart_policy(),
            driver_factory,
            display_factory,
            Arc::clone(&handoff),
        );
        let capture_counters = supervisor.counters();
        let capture = supervisor.spawn().map_err(PipelineError::Spawn)?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let server_task = tokio::spawn(server.run_until(async move {
            // A dropped sender also stops the server
            let _ = shutdown_rx.await;
        }));

        info!(
            addr = %local_addr,
            geometry = %geometry,
            frame_size = geometry.frame_size(),
            "Pipeline started"
        );

        Ok(Self {
            geometry,
            local_addr,
            handoff,
            capture,
            capture_counters,
            server_counters,
            server_task,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn handoff(&self) -> Arc<FrameHandoff> {
        Arc::clone(&self.handoff)
    }

    pub fn producer_status(&self) -> ProducerStatus {
        self.handoff.status()
    }

    pub fn capture_stats(&self) -> CaptureStats {
        self.capture_counters.snapshot()
    }

    pub fn server_stats(&self) -> ServerStats {
        self.server_counters.snapshot()
    }

    /// True once the server task has ended on its own
    pub fn server_finished(&self) -> bool {
        self.server_task.is_finished()
    }

    /// Stops the server, then the capture thread. Returns the capture error
    /// if capture had given up.
    pub async fn shutdown(self) -> Result<(), PipelineError> {
        let _ = self.shutdown_tx.send(());
        self.server_task.await??;

        self.capture.stop();
        let capture = self.capture;
        let result = tokio::task::spawn_blocking(move || capture.join()).await?;
        match result {
            Ok(()) => {
                info!("Pipeline stopped");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Capture had stopped with an error");
                Err(e.into())
            }
        }
    }
}

/// Builds the factory for the configured camera backend
pub fn driver_factory(camera: &CameraConfig) -> Result<DriverFactory, PipelineError> {
    match camera.driver {
        DriverKind::TestPattern => {
            let fps = camera.fps;
            Ok(Box::new(move || -> Result<Box<dyn CameraDriver>, DriverError> {
                Ok(Box::new(TestPatternDriver::new(fps)))
            }))
        }
        DriverKind::Gstreamer => gst_factory(camera),
        DriverKind::V4l2 => v4l2_factory(camera),
    }
}

#[cfg(feature = "gst")]
fn gst_factory(camera: &CameraConfig) -> Result<DriverFactory, PipelineError> {
    use crate::capture::GstDriver;

    let device = camera.device.clone();
    let fps = camera.fps;
    let flip_method = camera.flip_method.clone();
    Ok(Box::new(move || -> Result<Box<dyn CameraDriver>, DriverError> {
        Ok(Box::new(GstDriver::new(&device, fps, flip_method.clone())?))
    }))
}

#[cfg(not(feature = "gst"))]
fn gst_factory(_camera: &CameraConfig) -> Result<DriverFactory, PipelineError> {
    Err(PipelineError::DriverUnavailable("gstreamer"))
}

#[cfg(feature = "v4l2")]
fn v4l2_factory(camera: &CameraConfig) -> Result<DriverFactory, PipelineError> {
    use crate::capture::V4l2Device;

    // One handle for every restart
    let device = V4l2Device::new(&camera.device);
    let kernel_buffers = camera.kernel_buffers;
    Ok(Box::new(move || -> Result<Box<dyn CameraDriver>, DriverError> {
        Ok(Box::new(device.driver(kernel_buffers)?))
    }))
}

#[cfg(not(feature = "v4l2"))]
fn v4l2_factory(_camera: &CameraConfig) -> Result<DriverFactory, PipelineError> {
    Err(PipelineError::DriverUnavailable("v4l2"))
}

/// Builds the factory for the configured display sink
pub fn display_factory(display: &DisplayConfig) -> DisplayFactory {
    match display.kind {
        DisplayKind::None => Box::new(|| Box::new(NullDisplay) as Box<dyn DisplaySink>),
        DisplayKind::Snapshot => {
            let path = display.path.clone();
            let every = display.every_n_frames;
            Box::new(move || Box::new(SnapshotDisplay::new(path.clone(), every)) as Box<dyn DisplaySink>)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_pattern_factory() {
        let factory = driver_factory(&CameraConfig::default()).unwrap();
        let driver = factory().unwrap();
        assert_eq!(driver.name(), "test-pattern");
    }

    #[cfg(not(feature = "v4l2"))]
    #[test]
    fn test_missing_backend() {
        let camera = CameraConfig {
            driver: DriverKind::V4l2,
            ..Default::default()
        };
        assert!(matches!(
            driver_factory(&camera),
            Err(PipelineError::DriverUnavailable("v4l2"))
        ));
    }

    #[test]
    fn test_display_factory() {
        let null = display_factory(&DisplayConfig::default());
        assert_eq!(null().name(), "none");

        let snapshot = display_factory(&DisplayConfig {
            kind: DisplayKind::Snapshot,
            ..Default::default()
        });
        assert_eq!(snapshot().name(), "snapshot");
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let mut config = Config::default();
        config.server.bind_address = "127.0.0.1".to_string();
        config.server.port = 0;
        config.camera.width = 32;
        config.camera.height = 32;
        config.camera.fps = 120;

        let pipeline = Pipeline::start(&config).await.unwrap();
        assert_ne!(pipeline.local_addr().port(), 0);
        assert_eq!(pipeline.geometry().frame_size(), 32 * 32 * 2);

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while pipeline.handoff().generation() == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(pipeline.producer_status(), ProducerStatus::Running);
        assert!(pipeline.capture_stats().frames_captured > 0);

        assert!(pipeline.shutdown().await.is_ok());
    }
}
