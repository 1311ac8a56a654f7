//! Single-slot frame mailbox between the capture thread and the server
//!
//! The server raises the request flag when it is ready for a new frame; the
//! capture loop is the only party that clears it, and does so exactly when it
//! publishes. At most one published frame waits in the slot. The flag uses
//! acquire/release ordering and the slot is behind a mutex, so a consumer
//! that observes a publish also observes the frame it carries.

use crate::pool::FrameLease;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::trace;

/// Health of the frame producer as seen by consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ProducerStatus {
    Starting = 0,
    Running = 1,
    Restarting = 2,
    Failed = 3,
}

impl ProducerStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ProducerStatus::Starting,
            1 => ProducerStatus::Running,
            2 => ProducerStatus::Restarting,
            _ => ProducerStatus::Failed,
        }
    }
}

impl fmt::Display for ProducerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProducerStatus::Starting => "starting",
            ProducerStatus::Running => "running",
            ProducerStatus::Restarting => "restarting",
            ProducerStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

pub struct FrameHandoff {
    slot: Mutex<Option<FrameLease>>,
    requested: AtomicBool,
    status: AtomicU8,
    generation: AtomicU64,
    notify: Notify,
}

impl FrameHandoff {
    /// Starts with the request raised so the first captured frame is published
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            requested: AtomicBool::new(true),
            status: AtomicU8::new(ProducerStatus::Starting as u8),
            generation: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Consumer side: ask for the next frame
    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Producer side: clears the request if it was raised. Returns whether
    /// the caller now owes a publish.
    pub fn take_request(&self) -> bool {
        self.requested
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Producer side: places a frame in the slot. A frame the consumer never
    /// took is dropped here, which returns its buffer to the pool.
    pub fn publish(&self, lease: FrameLease) {
        let previous = self.slot.lock().replace(lease);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(generation, replaced = previous.is_some(), "Frame published");
        drop(previous);
        self.notify.notify_one();
    }

    /// Consumer side: takes the published frame, if any
    pub fn take(&self) -> Option<FrameLease> {
        self.slot.lock().take()
    }

    /// Consumer side: swaps `held` for the published frame, if there is one.
    /// The held frame is released before the new one is taken, so a consumer
    /// that has raised a request never keeps two buffers at once.
    pub fn take_into(&self, held: &mut Option<FrameLease>) -> bool {
        if self.pending() == 0 {
            return false;
        }
        *held = None;
        // Only the consumer empties the slot, so it is still full here
        *held = self.take();
        held.is_some()
    }

    /// Published frames not yet taken; never more than one
    pub fn pending(&self) -> usize {
        usize::from(self.slot.lock().is_some())
    }

    /// Number of publishes so far
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn status(&self) -> ProducerStatus {
        ProducerStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: ProducerStatus) {
        self.status.store(status as u8, Ordering::Release);
        // Wake a consumer waiting for a frame so it can react
        self.notify.notify_one();
    }

    /// Consumer side: waits for a published frame. Returns `None` when the
    /// wait expires or the producer has failed for good.
    pub async fn wait_frame(&self, wait: Duration) -> Option<FrameLease> {
        // A wait too long to express as a deadline has none
        let deadline = Instant::now().checked_add(wait);
        loop {
            if let Some(lease) = self.take() {
                return Some(lease);
            }
            if self.status() == ProducerStatus::Failed {
                return None;
            }
            match deadline {
                Some(deadline) => {
                    if timeout_at(deadline, self.notify.notified()).await.is_err() {
                        return self.take();
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }
}

impl Default for FrameHandoff {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FrameHandoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameHandoff")
            .field("requested", &self.is_requested())
            .field("pending", &self.pending())
            .field("generation", &self.generation())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::TestPatternDriver;
    use crate::capture::CameraDriver;
    use crate::format::{FrameGeometry, PixelFormat};
    use crate::pool::{BufferPool, BufferState};
    use std::sync::Arc;

    fn leases(count: usize) -> (BufferPool, TestPatternDriver, Vec<FrameLease>) {
        let geometry = FrameGeometry::new(8, 8, PixelFormat::Grey).unwrap();
        let mut driver = TestPatternDriver::new(1000);
        driver.set_format(&geometry).unwrap();
        let mut pool = BufferPool::preallocate(count, geometry.frame_size(), 8).unwrap();
        pool.prime(&mut driver).unwrap();
        driver.stream_start().unwrap();

        let leases = (0..count)
            .map(|_| {
                let buffer = pool.dequeue(&mut driver, Duration::from_secs(1)).unwrap();
                pool.hand_off(buffer).unwrap()
            })
            .collect();
        (pool, driver, leases)
    }

    #[test]
    fn test_initially_requested() {
        let handoff = FrameHandoff::new();
        assert!(handoff.is_requested());
        assert_eq!(handoff.status(), ProducerStatus::Starting);
        assert!(handoff.take_request());
        assert!(!handoff.take_request());
        handoff.request();
        assert!(handoff.take_request());
    }

    #[test]
    fn test_slot_holds_at_most_one_frame() {
        let (pool, _driver, mut leases) = leases(3);
        let handoff = FrameHandoff::new();

        let first = leases.remove(0);
        let first_index = first.index();
        handoff.publish(first);
        handoff.publish(leases.remove(0));
        assert_eq!(handoff.pending(), 1);
        assert_eq!(handoff.generation(), 2);

        // The overwritten frame went back to the pool
        assert_eq!(pool.states()[first_index], BufferState::Free);
        assert_eq!(pool.count(BufferState::HandedOff), 2);

        assert!(handoff.take().is_some());
        assert_eq!(handoff.pending(), 0);
        assert!(handoff.take().is_none());
    }

    #[test]
    fn test_take_into_releases_held_frame_first() {
        let (pool, _driver, mut leases) = leases(3);
        let handoff = FrameHandoff::new();

        let mut held = Some(leases.remove(0));
        let held_index = held.as_ref().unwrap().index();
        assert!(!handoff.take_into(&mut held));
        assert_eq!(held.as_ref().unwrap().index(), held_index);

        let fresh = leases.remove(0);
        let fresh_index = fresh.index();
        handoff.publish(fresh);
        assert!(handoff.take_into(&mut held));
        assert_eq!(held.as_ref().unwrap().index(), fresh_index);
        assert_eq!(pool.states()[held_index], BufferState::Free);
        assert_eq!(handoff.pending(), 0);
    }

    #[tokio::test]
    async fn test_wait_frame_wakes_on_publish() {
        let (_pool, _driver, mut leases) = leases(3);
        let handoff = Arc::new(FrameHandoff::new());
        let lease = leases.remove(0);
        let sequence = lease.sequence();

        let producer = Arc::clone(&handoff);
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.publish(lease);
        });

        let frame = handoff.wait_frame(Duration::from_secs(5)).await.unwrap();
        assert_eq!(frame.sequence(), sequence);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_frame_without_deadline() {
        let (_pool, _driver, mut leases) = leases(3);
        let handoff = Arc::new(FrameHandoff::new());
        let lease = leases.remove(0);

        let producer = Arc::clone(&handoff);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.publish(lease);
        });

        assert!(handoff.wait_frame(Duration::MAX).await.is_some());
    }

    #[tokio::test]
    async fn test_wait_frame_times_out() {
        let handoff = FrameHandoff::new();
        let started = std::time::Instant::now();
        assert!(handoff.wait_frame(Duration::from_millis(30)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_wait_frame_returns_on_failure() {
        let handoff = Arc::new(FrameHandoff::new());
        let producer = Arc::clone(&handoff);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.set_status(ProducerStatus::Failed);
        });

        let started = std::time::Instant::now();
        assert!(handoff.wait_frame(Duration::from_secs(10)).await.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
