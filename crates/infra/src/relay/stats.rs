use serde::Serialize;

use bazaar_core::Transition;

/// Outcome counts of a single relay tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub claimed: usize,
    pub published: usize,
    /// Failed attempts that left the row eligible for a later tick.
    pub retried: usize,
    pub exhausted: usize,
    pub permanently_failed: usize,
    /// Rows released untouched because an earlier row of the same aggregate did not publish.
    pub held_back: usize,
    /// Outcomes discarded because another instance took the row over.
    pub lease_lost: usize,
    /// Outcomes discarded because the row was already `PUBLISHED`.
    pub already_published: usize,
    /// Outcomes the store failed to record.
    pub store_errors: usize,
}

impl TickReport {
    pub(crate) fn count(&mut self, transition: Transition) {
        match transition {
            Transition::Published => self.published += 1,
            Transition::RetryScheduled { .. } => self.retried += 1,
            Transition::Exhausted { .. } => self.exhausted += 1,
            Transition::PermanentlyFailed => self.permanently_failed += 1,
            Transition::Unchanged => self.already_published += 1,
        }
    }

    pub(crate) fn merge(&mut self, other: &TickReport) {
        self.claimed += other.claimed;
        self.published += other.published;
        self.retried += other.retried;
        self.exhausted += other.exhausted;
        self.permanently_failed += other.permanently_failed;
        self.held_back += other.held_back;
        self.lease_lost += other.lease_lost;
        self.already_published += other.already_published;
        self.store_errors += other.store_errors;
    }
}

/// Cumulative relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub ticks: u64,
    /// Ticks that failed before dispatching (claim error).
    pub failed_ticks: u64,
    pub claimed: u64,
    pub published: u64,
    pub retried: u64,
    pub exhausted: u64,
    pub permanently_failed: u64,
    pub held_back: u64,
    pub lease_lost: u64,
    pub already_published: u64,
    pub store_errors: u64,
}

impl RelayStats {
    pub(crate) fn record(&mut self, report: &TickReport) {
        self.ticks += 1;
        self.claimed += report.claimed as u64;
        self.published += report.published as u64;
        self.retried += report.retried as u64;
        self.exhausted += report.exhausted as u64;
        self.permanently_failed += report.permanently_failed as u64;
        self.held_back += report.held_back as u64;
        self.lease_lost += report.lease_lost as u64;
        self.already_published += report.already_published as u64;
        self.store_errors += report.store_errors as u64;
    }

    pub(crate) fn record_failed_tick(&mut self) {
        self.ticks += 1;
        self.failed_ticks += 1;
    }
}
