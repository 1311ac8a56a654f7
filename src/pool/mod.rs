//! Preallocated frame buffer pool with explicit per-buffer state
//!
//! Buffers are move-only values that travel between the pool, the camera
//! driver queue, the capture loop and the streaming side. The pool keeps an
//! arena of [`BufferState`] entries, one per buffer, and every move goes
//! through a checked state transition. A buffer given to the streaming side
//! is wrapped in a [`FrameLease`]; it only becomes eligible for requeue once
//! the lease is dropped.

mod aligned;

pub use aligned::AlignedBlock;

use crate::capture::{CameraDriver, DriverError};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("alignment must be a power of two, got {0}")]
    InvalidAlignment(usize),

    #[error("invalid block size: {0}")]
    InvalidSize(usize),

    #[error("invalid buffer count: {0}")]
    InvalidCount(usize),

    #[error("unable to allocate {size} byte frame buffer")]
    Allocation { size: usize },

    #[error("buffer {index}: illegal transition {from} -> {to}")]
    InvalidTransition {
        index: usize,
        from: BufferState,
        to: BufferState,
    },

    #[error("buffer {index} does not belong to this pool")]
    ForeignBuffer { index: usize },

    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
}

/// Where a pool buffer currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BufferState {
    /// Owned by the pool, waiting to be queued with the driver
    Free,
    /// With the camera driver, waiting to be filled
    Queued,
    /// Dequeued and held by the capture loop
    Filled,
    /// Published to the streaming side through a lease
    HandedOff,
}

impl BufferState {
    fn can_become(self, next: BufferState) -> bool {
        use BufferState::*;
        matches!(
            (self, next),
            (Free, Queued) | (Queued, Filled) | (Filled, Queued) | (Filled, HandedOff) | (HandedOff, Free)
        )
    }
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BufferState::Free => "free",
            BufferState::Queued => "queued",
            BufferState::Filled => "filled",
            BufferState::HandedOff => "handed-off",
        };
        f.write_str(name)
    }
}

/// One pool block plus the metadata the driver fills in
pub struct FrameBuffer {
    pool_id: u64,
    index: usize,
    block: AlignedBlock,
    bytes_used: usize,
    sequence: u64,
}

impl FrameBuffer {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn capacity(&self) -> usize {
        self.block.len()
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Records how many bytes the driver wrote, clamped to the block size
    pub fn set_bytes_used(&mut self, bytes_used: usize) {
        self.bytes_used = bytes_used.min(self.block.len());
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    /// The filled part of the block
    pub fn data(&self) -> &[u8] {
        &self.block.as_slice()[..self.bytes_used]
    }

    /// The whole block, for drivers to write into
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.block.as_mut_slice()
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("index", &self.index)
            .field("capacity", &self.capacity())
            .field("bytes_used", &self.bytes_used)
            .field("sequence", &self.sequence)
            .finish()
    }
}

type StateArena = Arc<Mutex<Vec<BufferState>>>;

fn transition(
    states: &Mutex<Vec<BufferState>>,
    index: usize,
    to: BufferState,
) -> Result<BufferState, PoolError> {
    let mut states = states.lock();
    let slot = states
        .get_mut(index)
        .ok_or(PoolError::ForeignBuffer { index })?;
    let from = *slot;
    if !from.can_become(to) {
        return Err(PoolError::InvalidTransition { index, from, to });
    }
    *slot = to;
    trace!(buffer = index, %from, %to, "Buffer transition");
    Ok(from)
}

/// Move-only handle to a published frame.
///
/// While the lease exists its buffer is `HandedOff` and cannot be queued with
/// the driver. Dropping the lease returns the buffer to its pool.
pub struct FrameLease {
    buffer: Option<FrameBuffer>,
    states: StateArena,
    release: mpsc::UnboundedSender<FrameBuffer>,
}

impl FrameLease {
    pub fn index(&self) -> usize {
        self.buffer.as_ref().map(|b| b.index).unwrap_or_default()
    }

    pub fn sequence(&self) -> u64 {
        self.buffer.as_ref().map(|b| b.sequence).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buffer.as_ref().map(|b| b.data()).unwrap_or_default()
    }
}

impl AsRef<[u8]> for FrameLease {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for FrameLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameLease")
            .field("index", &self.index())
            .field("len", &self.len())
            .field("sequence", &self.sequence())
            .finish()
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            let index = buffer.index;
            if let Err(e) = transition(&self.states, index, BufferState::Free) {
                debug!(buffer = index, error = %e, "Lease released out of order");
            }
            // The pool may already be gone after a capture restart; the block
            // is simply freed then.
            let _ = self.release.send(buffer);
        }
    }
}

/// Fixed set of aligned frame buffers recycled between driver and application
pub struct BufferPool {
    id: u64,
    block_size: usize,
    alignment: usize,
    states: StateArena,
    free: Vec<FrameBuffer>,
    release_tx: mpsc::UnboundedSender<FrameBuffer>,
    release_rx: mpsc::UnboundedReceiver<FrameBuffer>,
}

impl BufferPool {
    /// Allocates `count` blocks of `block_size` bytes once. There is no
    /// partial pool: any allocation failure fails the whole call.
    pub fn preallocate(count: usize, block_size: usize, alignment: usize) -> Result<Self, PoolError> {
        if count == 0 {
            return Err(PoolError::InvalidCount(count));
        }

        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let mut free = Vec::with_capacity(count);
        for index in 0..count {
            let block = AlignedBlock::allocate(block_size, alignment)?;
            free.push(FrameBuffer {
                pool_id: id,
                index,
                block,
                bytes_used: 0,
                sequence: 0,
            });
        }

        let (release_tx, release_rx) = mpsc::unbounded_channel();

        info!(
            buffers = count,
            block_size = block_size,
            alignment = alignment,
            "Frame buffer pool allocated"
        );

        Ok(Self {
            id,
            block_size,
            alignment,
            states: Arc::new(Mutex::new(vec![BufferState::Free; count])),
            free,
            release_tx,
            release_rx,
        })
    }

    pub fn len(&self) -> usize {
        self.states.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Snapshot of every buffer's state, indexed by buffer
    pub fn states(&self) -> Vec<BufferState> {
        self.states.lock().clone()
    }

    /// Number of buffers currently in `state`
    pub fn count(&self, state: BufferState) -> usize {
        self.states.lock().iter().filter(|s| **s == state).count()
    }

    /// Queues every buffer the pool still owns with the driver
    pub fn prime(&mut self, driver: &mut dyn CameraDriver) -> Result<(), PoolError> {
        while let Some(buffer) = self.free.pop() {
            self.enqueue(driver, buffer)?;
        }
        Ok(())
    }

    /// Hands a free or just-consumed buffer to the driver for the next capture
    pub fn enqueue(&self, driver: &mut dyn CameraDriver, mut buffer: FrameBuffer) -> Result<(), PoolError> {
        self.check_owner(&buffer)?;
        transition(&self.states, buffer.index, BufferState::Queued)?;
        buffer.bytes_used = 0;
        driver.enqueue(buffer)?;
        Ok(())
    }

    /// Blocks until the driver returns a filled buffer or `timeout` elapses
    pub fn dequeue(&self, driver: &mut dyn CameraDriver, timeout: Duration) -> Result<FrameBuffer, PoolError> {
        let buffer = driver.dequeue(timeout)?;
        self.check_owner(&buffer)?;
        transition(&self.states, buffer.index, BufferState::Filled)?;
        Ok(buffer)
    }

    /// Moves a filled buffer out of driver circulation until the returned
    /// lease is dropped
    pub fn hand_off(&self, buffer: FrameBuffer) -> Result<FrameLease, PoolError> {
        self.check_owner(&buffer)?;
        transition(&self.states, buffer.index, BufferState::HandedOff)?;
        Ok(FrameLease {
            buffer: Some(buffer),
            states: Arc::clone(&self.states),
            release: self.release_tx.clone(),
        })
    }

    /// Requeues every buffer whose lease has been dropped; returns how many
    pub fn reclaim(&mut self, driver: &mut dyn CameraDriver) -> Result<usize, PoolError> {
        let mut reclaimed = 0;
        while let Ok(buffer) = self.release_rx.try_recv() {
            self.enqueue(driver, buffer)?;
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    fn check_owner(&self, buffer: &FrameBuffer) -> Result<(), PoolError> {
        if buffer.pool_id != self.id {
            return Err(PoolError::ForeignBuffer {
                index: buffer.index,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("id", &self.id)
            .field("block_size", &self.block_size)
            .field("alignment", &self.alignment)
            .field("states", &self.states())
            .finish()
    }
}
