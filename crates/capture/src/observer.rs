//! Host-facing callback surface.
//!
//! The engine reports lifecycle and progress through a [`RecordObserver`]
//! and never calls it directly: every notification goes through an injected
//! [`Dispatcher`] so the host can marshal onto whatever thread it likes.
//! Nothing in this crate knows what a UI thread is.

use std::path::Path;
use std::sync::Arc;

use crate::engine::ErrorKind;

/// Capture lifecycle callbacks. All methods default to no-ops so hosts
/// implement only what they display.
pub trait RecordObserver: Send + Sync {
    fn on_start_record(&self, _path: &Path) {}
    fn on_pause_record(&self) {}
    fn on_resume_record(&self) {}
    fn on_stop_record(&self, _final_path: &Path) {}
    /// Periodic progress: elapsed recorded audio and the peak amplitude
    /// since the previous report.
    fn on_progress(&self, _duration_ms: u64, _amplitude: i32) {}
    fn on_error(&self, _kind: ErrorKind) {}
}

/// Runs observer notifications somewhere of the host's choosing.
pub type Dispatcher = Arc<dyn Fn(Box<dyn FnOnce() + Send>) + Send + Sync>;

/// Dispatcher that runs notifications on the calling thread.
pub fn inline_dispatcher() -> Dispatcher {
    Arc::new(|task| task())
}

/// Observer that ignores everything.
pub struct NullObserver;

impl RecordObserver for NullObserver {}
