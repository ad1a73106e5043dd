//! Delivery strategies - 1 セッション = 1 倉庫から各 district を 1 件ずつ配送
//!
//! # 共通の手順（district ごと）
//! 1. 最古の order_id を読む
//! 2. その行を削除
//! 3. `order_id + placeholder_offset` を同じパーティションに再挿入
//!
//! 違いは「読む時にロックを取るか」「削除 0 行をどう扱うか」だけです。

#[cfg(test)]
mod faulty_store;
mod locking_scan;
mod optimistic_retry;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::config::DeliveryConfig;
use crate::domain::{
    CourierError, OrderId, Partition, Session, SessionReport, StrategyKind, WarehouseId,
};
use crate::ports::{QueueStore, StoreTx};

pub use self::locking_scan::LockingScan;
pub use self::optimistic_retry::OptimisticRetry;

/// DeliveryStrategy は 1 セッション分の配送アルゴリズム
///
/// # 契約
/// - Ok: セッションはコミット済み
/// - Err: トランザクションはロールバック済み（部分的な効果は残らない）
#[async_trait]
pub trait DeliveryStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    async fn run_session(&self, warehouse: WarehouseId) -> Result<SessionReport, CourierError>;
}

/// What every strategy needs: the store and the shape of a warehouse.
#[derive(Clone)]
pub struct DeliveryContext {
    pub store: Arc<dyn QueueStore>,
    pub partition_count: i32,
    pub placeholder_offset: i32,
}

impl DeliveryContext {
    pub fn new(store: Arc<dyn QueueStore>, partition_count: i32, placeholder_offset: i32) -> Self {
        Self {
            store,
            partition_count,
            placeholder_offset,
        }
    }

    /// Reinsert the placeholder for a delivered order.
    async fn reinsert(
        &self,
        tx: &mut dyn StoreTx,
        partition: Partition,
        delivered: OrderId,
    ) -> Result<OrderId, CourierError> {
        let placeholder = delivered.offset(self.placeholder_offset).ok_or_else(|| {
            CourierError::InvariantViolation(format!(
                "placeholder for {} overflows (offset {})",
                partition.item(delivered),
                self.placeholder_offset
            ))
        })?;
        tx.insert_item(partition.item(placeholder)).await?;
        Ok(placeholder)
    }
}

/// Log the fault and mark the session failed.
fn fail(session: &mut Session, err: CourierError) -> CourierError {
    warn!(
        warehouse = %session.warehouse_id(),
        kind = ?err.kind(),
        error = %err,
        "Session failed"
    );
    session.fail();
    err
}

/// Roll back, mark the session failed and hand the original error back.
async fn abort(tx: Box<dyn StoreTx>, session: &mut Session, err: CourierError) -> CourierError {
    let err = fail(session, err);
    if let Err(rollback_err) = tx.rollback().await {
        warn!(error = %rollback_err, "Rollback failed");
    }
    err
}

/// Commit a finished pass and close the session.
async fn commit(
    tx: Box<dyn StoreTx>,
    session: &mut Session,
) -> Result<SessionReport, CourierError> {
    if let Err(err) = session.ensure_complete() {
        return Err(abort(tx, session, err).await);
    }
    // a failed commit has already ended the transaction
    tx.commit().await.map_err(|err| fail(session, err))?;
    session.complete()
}

pub fn build_strategy(
    kind: StrategyKind,
    store: Arc<dyn QueueStore>,
    config: &DeliveryConfig,
) -> Arc<dyn DeliveryStrategy> {
    let ctx = DeliveryContext::new(store, config.partition_count, config.placeholder_offset);
    match kind {
        StrategyKind::LockingScan => Arc::new(LockingScan::new(ctx)),
        StrategyKind::OptimisticRetry => Arc::new(
            OptimisticRetry::new(ctx)
                .with_max_restarts(config.max_restarts)
                .with_backoff(config.restart_backoff()),
        ),
    }
}
