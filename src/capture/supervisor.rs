//! Runs the capture engine on its own thread and restarts it after fatal errors

use super::{CaptureConfig, CaptureCounters, CaptureEngine, CaptureError, CameraDriver, DriverError};
use crate::display::DisplaySink;
use crate::handoff::{FrameHandoff, ProducerStatus};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Builds a fresh driver for each capture attempt
pub type DriverFactory = Box<dyn Fn() -> Result<Box<dyn CameraDriver>, DriverError> + Send>;

/// Builds a fresh display sink for each capture attempt
pub type DisplayFactory = Box<dyn Fn() -> Box<dyn DisplaySink> + Send>;

/// How the supervisor reacts to a fatal capture error
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Consecutive failed attempts tolerated before giving up; 0 never restarts
    pub max_restarts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

pub struct CaptureSupervisor {
    config: CaptureConfig,
    policy: RestartPolicy,
    driver_factory: DriverFactory,
    display_factory: DisplayFactory,
    handoff: Arc<FrameHandoff>,
    counters: Arc<CaptureCounters>,
    stop: Arc<AtomicBool>,
}

impl CaptureSupervisor {
    pub fn new(
        config: CaptureConfig,
        policy: RestartPolicy,
        driver_factory: DriverFactory,
        display_factory: DisplayFactory,
        handoff: Arc<FrameHandoff>,
    ) -> Self {
        Self {
            config,
            policy,
            driver_factory,
            display_factory,
            handoff,
            counters: Arc::new(CaptureCounters::default()),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn counters(&self) -> Arc<CaptureCounters> {
        Arc::clone(&self.counters)
    }

    /// Starts the capture thread. The thread is dedicated so frame
    /// acquisition never waits behind network work on the async runtime.
    pub fn spawn(self) -> io::Result<SupervisorHandle> {
        let stop = Arc::clone(&self.stop);
        let counters = Arc::clone(&self.counters);
        let thread = thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || self.run())?;

        Ok(SupervisorHandle {
            stop,
            counters,
            thread: Some(thread),
        })
    }

    fn attempt(&self) -> Result<(), CaptureError> {
        let driver = (self.driver_factory)().map_err(CaptureError::Init)?;
        let display = (self.display_factory)();
        let streaming = CaptureEngine::new(self.config.clone(), driver, display, Arc::clone(&self.handoff))
            .with_counters(Arc::clone(&self.counters))
            .start()?;

        self.handoff.set_status(ProducerStatus::Running);
        streaming.run_until(&self.stop)
    }

    fn run(self) -> Result<(), CaptureError> {
        let mut failures = 0u32;
        let mut backoff = self.policy.initial_backoff;

        loop {
            if self.stop.load(Ordering::Acquire) {
                return Ok(());
            }

            let captured_before = self.counters.snapshot().frames_captured;
            let started = Instant::now();

            let err = match self.attempt() {
                Ok(()) => {
                    info!("Capture supervisor stopped");
                    return Ok(());
                }
                Err(e) => e,
            };

            // A run that produced frames was healthy; only count back-to-back failures
            if self.counters.snapshot().frames_captured > captured_before {
                failures = 0;
                backoff = self.policy.initial_backoff;
            }

            if failures >= self.policy.max_restarts {
                error!(
                    error = %err,
                    failures = failures,
                    "Capture failed permanently"
                );
                self.handoff.set_status(ProducerStatus::Failed);
                return Err(err);
            }

            failures += 1;
            self.counters.record_restart();
            self.handoff.set_status(ProducerStatus::Restarting);
            warn!(
                error = %err,
                attempt = failures,
                uptime_ms = started.elapsed().as_millis() as u64,
                backoff_ms = backoff.as_millis() as u64,
                "Capture failed, restarting"
            );

            if !self.sleep_unless_stopped(backoff) {
                return Ok(());
            }
            backoff = next_backoff(backoff, self.policy.max_backoff);
        }
    }

    /// Returns false if a stop was requested during the pause
    fn sleep_unless_stopped(&self, total: Duration) -> bool {
        let started = Instant::now();
        while started.elapsed() < total {
            if self.stop.load(Ordering::Acquire) {
                return false;
            }
            thread::sleep(Duration::from_millis(20).min(total.saturating_sub(started.elapsed())));
        }
        !self.stop.load(Ordering::Acquire)
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

pub struct SupervisorHandle {
    stop: Arc<AtomicBool>,
    counters: Arc<CaptureCounters>,
    thread: Option<JoinHandle<Result<(), CaptureError>>>,
}

impl SupervisorHandle {
    pub fn counters(&self) -> Arc<CaptureCounters> {
        Arc::clone(&self.counters)
    }

    /// Asks the capture loop to stop after its current iteration
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map(|t| t.is_finished()).unwrap_or(true)
    }

    /// Waits for the capture thread and returns how it ended
    pub fn join(mut self) -> Result<(), CaptureError> {
        match self.thread.take() {
            Some(thread) => thread.join().unwrap_or_else(|_| {
                Err(CaptureError::Driver(DriverError::Device(
                    "capture thread panicked".to_string(),
                )))
            }),
            None => Ok(()),
        }
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
