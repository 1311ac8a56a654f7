//! Streaming statistics

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for the frame server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerStats {
    /// Clients accepted since start
    pub clients_served: u64,

    /// Frames fully written to clients
    pub frames_sent: u64,

    /// Total bytes written, markers included
    pub bytes_sent: u64,

    /// Sessions that ended with a send error
    pub disconnects: u64,

    /// Sessions closed with the error marker because capture was down
    pub error_markers_sent: u64,
}

impl ServerStats {
    /// Calculates frame rate based on delta
    pub fn calculate_fps(&self, previous: &Self, elapsed_secs: f64) -> f64 {
        if elapsed_secs == 0.0 {
            return 0.0;
        }

        let frames_delta = self.frames_sent.saturating_sub(previous.frames_sent);
        frames_delta as f64 / elapsed_secs
    }

    /// Calculates bitrate in kbps based on delta
    pub fn calculate_bitrate_kbps(&self, previous: &Self, elapsed_secs: f64) -> f64 {
        if elapsed_secs == 0.0 {
            return 0.0;
        }

        let bytes_delta = self.bytes_sent.saturating_sub(previous.bytes_sent);
        (bytes_delta as f64 * 8.0) / elapsed_secs / 1000.0
    }
}

/// Lock-free counters updated by the server task
#[derive(Debug, Default)]
pub struct ServerCounters {
    pub(crate) clients_served: AtomicU64,
    pub(crate) frames_sent: AtomicU64,
    pub(crate) bytes_sent: AtomicU64,
    pub(crate) disconnects: AtomicU64,
    pub(crate) error_markers_sent: AtomicU64,
}

impl ServerCounters {
    pub fn snapshot(&self) -> ServerStats {
        ServerStats {
            clients_served: self.clients_served.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            error_markers_sent: self.error_markers_sent.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}
