//! Per-job cooperative cancellation cell.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A shared boolean cell checked cooperatively by the worker while an engine
/// operation runs.
///
/// The cell starts as `true` ("continue"). The dispatcher side is the single
/// writer (`cancel` stores `false`); the worker's progress callback is the
/// single reader. That single-writer/single-reader discipline is what makes a
/// lone atomic sufficient across the thread boundary.
///
/// Cancellation is cooperative, not preemptive: flipping the cell does not
/// interrupt engine code already running between check points, and the
/// terminal response may still arrive some time after `cancel` is called.
#[derive(Debug, Clone)]
pub struct CancelCell {
    inner: Arc<AtomicBool>,
}

impl CancelCell {
    pub fn new() -> Self {
        CancelCell { inner: Arc::new(AtomicBool::new(true)) }
    }

    /// Request early termination. Idempotent.
    pub fn cancel(&self) {
        self.inner.store(false, Ordering::Release);
    }

    /// Current value of the flag; `true` means keep going.
    pub fn should_continue(&self) -> bool {
        self.inner.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        !self.should_continue()
    }
}

impl Default for CancelCell {
    fn default() -> Self {
        Self::new()
    }
}
