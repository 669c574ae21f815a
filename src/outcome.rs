//! Success/failure tallies for best-effort operations.

use serde::Serialize;
use std::fmt;

/// Per-item counts for a batch that keeps going past individual failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchOutcome {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn success(&mut self) {
        self.succeeded += 1;
    }

    pub fn failure(&mut self) {
        self.failed += 1;
    }

    pub fn record(&mut self, ok: bool) {
        if ok {
            self.success();
        } else {
            self.failure();
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }

    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }

    pub fn merge(&mut self, other: BatchOutcome) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
    }

    /// User-facing one-line summary, e.g. `"Tagged 3 of 4 items (1 failed)"`.
    pub fn summary(&self, action: &str) -> String {
        if self.failed == 0 {
            format!("{} {} of {} items", action, self.succeeded, self.total())
        } else {
            format!(
                "{} {} of {} items ({} failed)",
                action,
                self.succeeded,
                self.total(),
                self.failed
            )
        }
    }
}

impl fmt::Display for BatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} succeeded, {} failed", self.succeeded, self.failed)
    }
}
