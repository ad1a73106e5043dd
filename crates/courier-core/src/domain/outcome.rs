//! Outcome model: what happened to each district in a session.
//!
//! Empty partitions and lost races are normal outcomes, not errors. Only
//! session-level faults travel as `CourierError`.

use serde::{Deserialize, Serialize};

use super::ids::{DistrictId, OrderId, WarehouseId};

/// Per-district result of one drain attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "order_id", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DistrictOutcome {
    /// First district delivered in the session (kept apart for observability).
    Locked(OrderId),

    /// Any later district delivered in the same session.
    Delivered(OrderId),

    /// The partition was empty when read; nothing was deleted or inserted.
    NotFound,

    /// A concurrent session removed the row between our read and our delete.
    LostRace,
}

impl DistrictOutcome {
    pub fn delivered_order(self) -> Option<OrderId> {
        match self {
            DistrictOutcome::Locked(order) | DistrictOutcome::Delivered(order) => Some(order),
            DistrictOutcome::NotFound | DistrictOutcome::LostRace => None,
        }
    }
}

/// Which draining algorithm produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    LockingScan,
    OptimisticRetry,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::LockingScan => "locking-scan",
            StrategyKind::OptimisticRetry => "optimistic-retry",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "locking-scan" => Ok(StrategyKind::LockingScan),
            "optimistic-retry" => Ok(StrategyKind::OptimisticRetry),
            other => Err(format!(
                "unknown strategy '{other}' (expected locking-scan or optimistic-retry)"
            )),
        }
    }
}

/// Result of one committed session.
///
/// `districts` describes the committed pass only; outcomes of passes that
/// were rolled back are summarised by `restarts` / `lost_races`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReport {
    pub warehouse_id: WarehouseId,
    pub strategy: StrategyKind,
    pub districts: Vec<(DistrictId, DistrictOutcome)>,
    pub restarts: u32,
    pub lost_races: u32,
}

impl SessionReport {
    pub fn delivered(&self) -> usize {
        self.districts
            .iter()
            .filter(|(_, outcome)| outcome.delivered_order().is_some())
            .count()
    }

    pub fn not_found(&self) -> usize {
        self.districts
            .iter()
            .filter(|(_, outcome)| matches!(outcome, DistrictOutcome::NotFound))
            .count()
    }

    pub fn outcome_for(&self, district: DistrictId) -> Option<DistrictOutcome> {
        self.districts
            .iter()
            .find(|(d, _)| *d == district)
            .map(|(_, outcome)| *outcome)
    }
}
