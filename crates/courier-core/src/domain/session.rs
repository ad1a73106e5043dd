//! Session state machine for one warehouse delivery.

use serde::Serialize;

use super::errors::CourierError;
use super::ids::{DistrictId, OrderId, WarehouseId};
use super::outcome::{DistrictOutcome, SessionReport, StrategyKind};

/// Session state.
///
/// State transitions:
/// - Running(d) --Advance--> Running(d + 1)         (d < last district)
/// - Running(last) --Complete--> Committed
/// - Running(d) --LostRace--> Restarting
/// - Restarting --Restart--> Running(1)
/// - Running(d) | Restarting --Fault--> Failed
///
/// Committed and Failed are terminal. Anything else is an invariant violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Running(DistrictId),
    Restarting,
    Committed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionEvent {
    Advance,
    LostRace,
    Restart,
    Complete,
    Fault,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Committed | SessionState::Failed)
    }

    /// Transition table. `last` is the highest district of the warehouse.
    pub fn on(self, event: SessionEvent, last: DistrictId) -> Result<SessionState, CourierError> {
        use SessionEvent::*;
        use SessionState::*;

        let next = match (self, event) {
            (Running(d), Advance) if d < last => d.next().map(Running),
            (Running(d), Complete) if d == last => Some(Committed),
            (Running(_), LostRace) => Some(Restarting),
            (Restarting, Restart) => Some(Running(DistrictId::FIRST)),
            (Running(_) | Restarting, Fault) => Some(Failed),
            _ => None,
        };

        next.ok_or_else(|| {
            CourierError::InvariantViolation(format!(
                "illegal session transition {self:?} --{event:?}-->"
            ))
        })
    }
}

/// Bookkeeping for one session: state plus the outcomes of the current pass.
///
/// Strategies drive it district by district; it refuses out-of-order calls.
#[derive(Debug)]
pub struct Session {
    warehouse_id: WarehouseId,
    strategy: StrategyKind,
    last: DistrictId,
    state: SessionState,
    pass: Vec<(DistrictId, DistrictOutcome)>,
    restarts: u32,
    lost_races: u32,
}

impl Session {
    pub fn begin(
        warehouse_id: WarehouseId,
        strategy: StrategyKind,
        partition_count: i32,
    ) -> Result<Self, CourierError> {
        if partition_count < 1 {
            return Err(CourierError::InvariantViolation(format!(
                "partition_count must be >= 1 (got {partition_count})"
            )));
        }
        Ok(Self {
            warehouse_id,
            strategy,
            last: DistrictId::new(partition_count),
            state: SessionState::Running(DistrictId::FIRST),
            pass: Vec::with_capacity(partition_count as usize),
            restarts: 0,
            lost_races: 0,
        })
    }

    pub fn warehouse_id(&self) -> WarehouseId {
        self.warehouse_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// The district to work on next, or None once the pass has visited all of them.
    pub fn current_district(&self) -> Option<DistrictId> {
        match self.state {
            SessionState::Running(d) if self.pass.len() < d.get() as usize => Some(d),
            _ => None,
        }
    }

    /// Has the current pass delivered anything yet?
    pub fn has_delivered(&self) -> bool {
        self.pass
            .iter()
            .any(|(_, outcome)| outcome.delivered_order().is_some())
    }

    /// Record that `district` was empty.
    pub fn not_found(&mut self, district: DistrictId) -> Result<(), CourierError> {
        self.record(district, DistrictOutcome::NotFound)
    }

    /// Record a delivery. The first delivery of a pass is reported as `Locked`.
    pub fn delivered(
        &mut self,
        district: DistrictId,
        order_id: OrderId,
    ) -> Result<DistrictOutcome, CourierError> {
        let outcome = if !self.has_delivered() {
            DistrictOutcome::Locked(order_id)
        } else {
            DistrictOutcome::Delivered(order_id)
        };
        self.record(district, outcome)?;
        Ok(outcome)
    }

    /// Record a lost race; the pass is abandoned and must be restarted.
    pub fn lost_race(&mut self, district: DistrictId) -> Result<(), CourierError> {
        self.expect_district(district)?;
        self.state = self.state.on(SessionEvent::LostRace, self.last)?;
        self.lost_races += 1;
        Ok(())
    }

    /// Start a fresh pass from district 1 after a lost race.
    pub fn restart(&mut self) -> Result<(), CourierError> {
        self.state = self.state.on(SessionEvent::Restart, self.last)?;
        self.pass.clear();
        self.restarts += 1;
        Ok(())
    }

    /// Err unless every district of the current pass has an outcome.
    pub fn ensure_complete(&self) -> Result<(), CourierError> {
        if self.pass.len() != self.last.get() as usize {
            return Err(CourierError::InvariantViolation(format!(
                "session for warehouse {} completed after {} of {} districts",
                self.warehouse_id,
                self.pass.len(),
                self.last
            )));
        }
        Ok(())
    }

    /// Finish the session once every district of the pass has an outcome.
    pub fn complete(&mut self) -> Result<SessionReport, CourierError> {
        self.ensure_complete()?;
        self.state = self.state.on(SessionEvent::Complete, self.last)?;
        Ok(SessionReport {
            warehouse_id: self.warehouse_id,
            strategy: self.strategy,
            districts: self.pass.clone(),
            restarts: self.restarts,
            lost_races: self.lost_races,
        })
    }

    pub fn fail(&mut self) {
        if let Ok(next) = self.state.on(SessionEvent::Fault, self.last) {
            self.state = next;
        }
    }

    fn expect_district(&self, district: DistrictId) -> Result<(), CourierError> {
        match self.current_district() {
            Some(current) if current == district => Ok(()),
            current => Err(CourierError::InvariantViolation(format!(
                "outcome for district {district} recorded while at {current:?}"
            ))),
        }
    }

    fn record(
        &mut self,
        district: DistrictId,
        outcome: DistrictOutcome,
    ) -> Result<(), CourierError> {
        self.expect_district(district)?;
        self.pass.push((district, outcome));
        if district < self.last {
            self.state = self.state.on(SessionEvent::Advance, self.last)?;
        }
        Ok(())
    }
}
