//! LockingScan - ロック付き読み出しで district を順に配送
//!
//! `min_pending_id_for_update` が返した行はこのトランザクションが排他的に持つので、
//! 続く削除は必ず 1 行に効きます。0 行なら不変条件違反です。
//! 競合するセッションはロック待ちで直列化され、リトライは発生しません。

use async_trait::async_trait;
use tracing::{debug, info};

use super::{DeliveryContext, DeliveryStrategy, abort, commit};
use crate::domain::{
    CourierError, DistrictOutcome, Partition, Session, SessionReport, StrategyKind, WarehouseId,
};
use crate::ports::StoreTx;

pub struct LockingScan {
    ctx: DeliveryContext,
}

impl LockingScan {
    pub fn new(ctx: DeliveryContext) -> Self {
        Self { ctx }
    }

    async fn drain(&self, tx: &mut dyn StoreTx, session: &mut Session) -> Result<(), CourierError> {
        let warehouse = session.warehouse_id();
        while let Some(district) = session.current_district() {
            let partition = Partition::new(warehouse, district);

            let Some(order_id) = tx.min_pending_id_for_update(partition).await? else {
                info!(%warehouse, %district, "SKIPPED");
                session.not_found(district)?;
                continue;
            };

            let removed = tx.delete_item(partition, order_id).await?;
            if removed != 1 {
                return Err(CourierError::InvariantViolation(format!(
                    "locked row {} deleted {removed} rows",
                    partition.item(order_id)
                )));
            }
            self.ctx.reinsert(tx, partition, order_id).await?;

            if let DistrictOutcome::Locked(_) = session.delivered(district, order_id)? {
                debug!(%warehouse, %district, %order_id, "LOCKED");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryStrategy for LockingScan {
    fn kind(&self) -> StrategyKind {
        StrategyKind::LockingScan
    }

    async fn run_session(&self, warehouse: WarehouseId) -> Result<SessionReport, CourierError> {
        let mut session = Session::begin(warehouse, self.kind(), self.ctx.partition_count)?;
        let mut tx = self.ctx.store.begin().await?;

        let drained = self.drain(tx.as_mut(), &mut session).await;
        if let Err(err) = drained {
            return Err(abort(tx, &mut session, err).await);
        }

        let report = commit(tx, &mut session).await?;
        debug!(%warehouse, delivered = report.delivered(), "RELEASED");
        Ok(report)
    }
}
