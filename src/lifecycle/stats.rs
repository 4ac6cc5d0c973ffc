//! Statistics for lifecycle operations.

use std::time::Duration;

/// Statistics from a lifecycle management run.
#[derive(Debug, Clone, Default)]
pub struct LifecycleStats {
    /// Number of blocks scanned.
    pub scanned_count: usize,

    /// Blocks written by the save pass.
    pub saved_count: usize,

    pub unloaded_count: usize,

    /// Blocks given a new pending tier.
    pub marked_count: usize,

    /// Blocks copied into their pending tier.
    pub moved_count: usize,

    /// Blocks newly flagged for deletion.
    pub flagged_count: usize,

    pub deleted_count: usize,

    /// Number of errors encountered.
    pub error_count: usize,

    /// Errors encountered during the run.
    pub errors: Vec<String>,

    /// Time taken for the run.
    pub duration: Duration,
}

impl LifecycleStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error from one pass; the run continues with the next.
    pub fn record_error(&mut self, pass: &str, error: impl std::fmt::Display) {
        self.error_count += 1;
        self.errors.push(format!("{pass}: {error}"));
    }

    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }

    pub fn summary(&self) -> String {
        format!(
            "Scanned: {}, Saved: {}, Unloaded: {}, Marked: {}, Moved: {}, Flagged: {}, Deleted: {}, Errors: {}, Duration: {:?}",
            self.scanned_count,
            self.saved_count,
            self.unloaded_count,
            self.marked_count,
            self.moved_count,
            self.flagged_count,
            self.deleted_count,
            self.error_count,
            self.duration
        )
    }
}
