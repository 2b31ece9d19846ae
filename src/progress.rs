//! Progress reporting and cancellation for long-running operations.
//!
//! Operations report through a plain callback, `(bytes_processed, total_bytes_estimate)`,
//! invoked synchronously after every chunk or entry. Cancellation is a shared flag that
//! the pipelines poll between chunks and between entries.

use crate::error::{Result, SpacerError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Progress callback function type: `(bytes_processed, total_bytes_estimate)`.
pub type ProgressCallback = dyn Fn(u64, u64) + Send + Sync;

/// A cloneable cancellation flag. All clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns `Err(Cancelled)` once the flag has been raised.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SpacerError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Caller-supplied hooks shared by all operations.
#[derive(Clone, Default)]
pub struct Hooks {
    pub progress: Option<Arc<ProgressCallback>>,
    pub cancel: CancelFlag,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("progress", &self.progress.is_some())
            .field("cancel", &self.cancel)
            .finish()
    }
}

/// Running byte and file counters for one operation.
///
/// Counters are atomic so worker threads can record entries while the writer records
/// chunks; the callback always sees the combined byte count.
pub struct ProgressTracker {
    callback: Option<Arc<ProgressCallback>>,
    cancel: CancelFlag,
    total_bytes: AtomicU64,
    processed_bytes: AtomicU64,
    processed_files: AtomicU64,
    start_time: Instant,
}

impl ProgressTracker {
    pub fn new(hooks: &Hooks) -> Self {
        Self {
            callback: hooks.progress.clone(),
            cancel: hooks.cancel.clone(),
            total_bytes: AtomicU64::new(0),
            processed_bytes: AtomicU64::new(0),
            processed_files: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// A tracker with no callback and a private flag that is never raised.
    pub fn silent() -> Self {
        Self::new(&Hooks::default())
    }

    pub fn set_total(&self, bytes: u64) {
        self.total_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Adds `bytes` and notifies the callback.
    pub fn advance(&self, bytes: u64) {
        let processed = self.processed_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if let Some(ref callback) = self.callback {
            callback(processed, self.total_bytes.load(Ordering::Relaxed));
        }
    }

    pub fn record_file(&self) {
        self.processed_files.fetch_add(1, Ordering::Relaxed);
    }

    pub fn check_cancelled(&self) -> Result<()> {
        self.cancel.check()
    }

    pub fn processed_bytes(&self) -> u64 {
        self.processed_bytes.load(Ordering::Relaxed)
    }

    pub fn processed_files(&self) -> u64 {
        self.processed_files.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// A rendered snapshot of progress, derived from the raw callback arguments.
#[derive(Debug, Clone)]
pub struct ProgressState {
    pub total_bytes: u64,
    pub processed_bytes: u64,
    pub elapsed_time: Duration,
    pub speed_mbps: f32,
    pub progress_percent: f32,
}

impl ProgressState {
    pub fn from_counts(processed_bytes: u64, total_bytes: u64, elapsed_time: Duration) -> Self {
        let speed_mbps = if elapsed_time.as_secs_f32() > 0.0 {
            processed_bytes as f32 / (1024.0 * 1024.0) / elapsed_time.as_secs_f32()
        } else {
            0.0
        };
        let progress_percent = if total_bytes > 0 {
            (processed_bytes as f32 / total_bytes as f32 * 100.0).min(100.0)
        } else {
            0.0
        };
        Self {
            total_bytes,
            processed_bytes,
            elapsed_time,
            speed_mbps,
            progress_percent,
        }
    }

    /// Calculate estimated time remaining based on current speed
    pub fn estimated_time_remaining(&self) -> Duration {
        if self.speed_mbps <= 0.0 {
            return Duration::from_secs(0);
        }

        let remaining_bytes = self.total_bytes.saturating_sub(self.processed_bytes);
        let remaining_mb = remaining_bytes as f32 / (1024.0 * 1024.0);
        let remaining_seconds = remaining_mb / self.speed_mbps;

        Duration::from_secs_f32(remaining_seconds.max(0.0))
    }
}
