//! Transfer progress callbacks

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Receives chunk and byte events from a running transfer.
///
/// Implementations must be cheap: callbacks run inline on the transfer task.
pub trait ProgressReporter: Send + Sync {
    fn on_chunk_start(&self, _index: u64, _remote_path: &str) {}

    fn on_bytes_transferred(&self, _bytes: u64) {}

    fn on_chunk_complete(&self, _index: u64, _bytes: u64) {}
}

/// Discards all events
pub struct NoProgress;

impl ProgressReporter for NoProgress {}

/// Logs chunk boundaries and keeps a running byte total
#[derive(Default)]
pub struct LogProgress {
    bytes: AtomicU64,
}

impl LogProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl ProgressReporter for LogProgress {
    fn on_chunk_start(&self, index: u64, remote_path: &str) {
        info!("Chunk {} started: {}", index, remote_path);
    }

    fn on_bytes_transferred(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn on_chunk_complete(&self, index: u64, bytes: u64) {
        info!("Chunk {} complete ({} bytes, {} total)", index, bytes, self.total_bytes());
    }
}
