//! Error reporter that records reports for later assertions.

use parking_lot::Mutex;

use crate::dispatch::{ErrorReport, ErrorReporter};

/// Keeps every report it receives, in arrival order.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<ErrorReport>>,
}

impl RecordingReporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All reports received so far.
    #[must_use]
    pub fn reports(&self) -> Vec<ErrorReport> {
        self.reports.lock().clone()
    }

    /// Reports attributed to `owner`.
    #[must_use]
    pub fn reports_for(&self, owner: &str) -> Vec<ErrorReport> {
        self.reports
            .lock()
            .iter()
            .filter(|report| report.owner == owner)
            .cloned()
            .collect()
    }

    /// Reports for one operation, e.g. `"timeout"` or `"enqueue"`.
    #[must_use]
    pub fn reports_for_operation(&self, operation: &str) -> Vec<ErrorReport> {
        self.reports
            .lock()
            .iter()
            .filter(|report| report.operation == operation)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.reports.lock().clear();
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, report: ErrorReport) {
        self.reports.lock().push(report);
    }
}
