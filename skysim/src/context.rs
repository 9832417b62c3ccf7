//! Shared pipeline context.

use std::fmt::Display;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Warning sink threaded through the pipeline.
///
/// Stages report recoverable problems here instead of mutating ambient
/// global state, so independent pipelines (and tests) never observe each
/// other's counters. Messages go through [`log::warn!`]; only the count is
/// kept.
#[derive(Debug, Default)]
pub struct Diagnostics {
    warnings: AtomicUsize,
}

impl Diagnostics {
    /// Creates a context with a zeroed warning counter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs `msg` as a warning and bumps the counter.
    pub fn warn(&self, msg: impl Display) {
        self.warnings.fetch_add(1, Ordering::Relaxed);
        log::warn!("{msg}");
    }

    /// Number of warnings reported so far.
    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.warnings.load(Ordering::Relaxed)
    }
}
