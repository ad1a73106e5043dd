use serde::{Deserialize, Serialize};

use crate::domain::{CourierError, ErrorKind, SessionReport};

/// Aggregated session outcomes, per worker and for a whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryCounts {
    pub sessions_committed: u64,
    pub sessions_failed: u64,
    pub delivered: u64,
    pub not_found: u64,
    pub lost_races: u64,
    pub restarts: u64,
    pub transient_failures: u64,
    pub permanent_failures: u64,
    pub infrastructure_failures: u64,
}

impl DeliveryCounts {
    pub fn record_report(&mut self, report: &SessionReport) {
        self.sessions_committed += 1;
        self.delivered += report.delivered() as u64;
        self.not_found += report.not_found() as u64;
        self.lost_races += u64::from(report.lost_races);
        self.restarts += u64::from(report.restarts);
    }

    pub fn record_failure(&mut self, err: &CourierError) {
        self.sessions_failed += 1;
        match err.kind() {
            ErrorKind::Transient => self.transient_failures += 1,
            ErrorKind::Permanent => self.permanent_failures += 1,
            ErrorKind::Infrastructure => self.infrastructure_failures += 1,
        }
    }

    pub fn merge(&mut self, other: &DeliveryCounts) {
        self.sessions_committed += other.sessions_committed;
        self.sessions_failed += other.sessions_failed;
        self.delivered += other.delivered;
        self.not_found += other.not_found;
        self.lost_races += other.lost_races;
        self.restarts += other.restarts;
        self.transient_failures += other.transient_failures;
        self.permanent_failures += other.permanent_failures;
        self.infrastructure_failures += other.infrastructure_failures;
    }

    pub fn sessions(&self) -> u64 {
        self.sessions_committed + self.sessions_failed
    }
}
