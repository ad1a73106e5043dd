//! OptimisticRetry - ロックなしで読み、削除の結果で競合を検出
//!
//! # フロー
//! 1. district 1 から順に `min_pending_id`（ロックなし）
//! 2. 削除が 0 行 = 他のセッションが先に消した（lost race）
//! 3. lost race ならロールバックして district 1 からやり直す（新しいトランザクション）
//! 4. 途中で負けずに最後まで通ったパスだけをコミット
//!
//! `max_restarts` と `backoff` は既定で無効（無制限・即時リトライ）。

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{DeliveryContext, DeliveryStrategy, abort, commit, fail};
use crate::app::retry::RetryPolicy;
use crate::domain::{
    CourierError, DistrictOutcome, Partition, Session, SessionReport, StrategyKind, WarehouseId,
};
use crate::ports::StoreTx;

/// How a pass over the districts ended.
enum PassEnd {
    Complete,
    LostRace,
}

pub struct OptimisticRetry {
    ctx: DeliveryContext,
    max_restarts: Option<u32>,
    backoff: Option<RetryPolicy>,
}

impl OptimisticRetry {
    pub fn new(ctx: DeliveryContext) -> Self {
        Self {
            ctx,
            max_restarts: None,
            backoff: None,
        }
    }

    /// Give up with `ContentionExhausted` once this many restarts have failed.
    pub fn with_max_restarts(mut self, max_restarts: Option<u32>) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn with_backoff(mut self, backoff: Option<RetryPolicy>) -> Self {
        self.backoff = backoff;
        self
    }

    async fn pass(
        &self,
        tx: &mut dyn StoreTx,
        session: &mut Session,
    ) -> Result<PassEnd, CourierError> {
        let warehouse = session.warehouse_id();
        while let Some(district) = session.current_district() {
            let partition = Partition::new(warehouse, district);

            let Some(order_id) = tx.min_pending_id(partition).await? else {
                info!(%warehouse, %district, "NOT FOUND");
                session.not_found(district)?;
                continue;
            };
            if !session.has_delivered() {
                debug!(%warehouse, %district, %order_id, "FETCHED");
            }

            match tx.delete_item(partition, order_id).await? {
                0 => {
                    info!(%warehouse, %district, "SKIPPED");
                    session.lost_race(district)?;
                    return Ok(PassEnd::LostRace);
                }
                1 => {}
                removed => {
                    return Err(CourierError::InvariantViolation(format!(
                        "delete of {} removed {removed} rows",
                        partition.item(order_id)
                    )));
                }
            }

            if let DistrictOutcome::Locked(_) = session.delivered(district, order_id)? {
                debug!(%warehouse, %district, %order_id, "LOCKED");
            }
            self.ctx.reinsert(tx, partition, order_id).await?;
        }
        Ok(PassEnd::Complete)
    }
}

#[async_trait]
impl DeliveryStrategy for OptimisticRetry {
    fn kind(&self) -> StrategyKind {
        StrategyKind::OptimisticRetry
    }

    async fn run_session(&self, warehouse: WarehouseId) -> Result<SessionReport, CourierError> {
        let mut session = Session::begin(warehouse, self.kind(), self.ctx.partition_count)?;

        loop {
            let mut tx = self.ctx.store.begin().await?;
            let ended = self.pass(tx.as_mut(), &mut session).await;

            match ended {
                Ok(PassEnd::Complete) => {
                    let report = commit(tx, &mut session).await?;
                    debug!(%warehouse, restarts = report.restarts, "RELEASED");
                    return Ok(report);
                }
                Ok(PassEnd::LostRace) => {
                    tx.rollback().await.map_err(|err| fail(&mut session, err))?;

                    let restarts = session.restarts();
                    if let Some(max) = self.max_restarts
                        && restarts >= max
                    {
                        session.fail();
                        warn!(%warehouse, restarts, "Giving up after repeated lost races");
                        return Err(CourierError::ContentionExhausted {
                            warehouse,
                            restarts,
                        });
                    }
                    if let Some(policy) = &self.backoff {
                        tokio::time::sleep(policy.next_delay(restarts + 1)).await;
                    }
                    session.restart()?;
                }
                Err(err) => return Err(abort(tx, &mut session, err).await),
            }
        }
    }
}
