//! QueueStore port - new_orders を保持するトランザクショナルなストア
//!
//! QueueStore は以下を提供します：
//! - パーティション `(warehouse, district)` ごとの最小 order_id の読み出し
//! - ロック付き読み出し（`SELECT ... FOR UPDATE` 相当）
//! - 主キー指定の削除・挿入、Seeder 用のバルク挿入
//!
//! # 実装
//! - `InMemoryQueueStore`（テスト・開発用、行ロック表つき）
//! - `PgQueueStore`（PostgreSQL、feature = "postgres"）

use async_trait::async_trait;

use crate::domain::{CourierError, OrderId, Partition, PendingItem};

/// QueueStore は pending item の正本（source of truth）
///
/// # 設計原則
/// - すべての操作は呼び出し側が開いたトランザクションの中で行う
/// - 分離レベルは READ COMMITTED
/// - 相互排他を与えるのは `min_pending_id_for_update` のロックだけ
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Open a new unit of work.
    async fn begin(&self) -> Result<Box<dyn StoreTx>, CourierError>;
}

/// An open READ COMMITTED transaction against the queue.
///
/// Reads see committed state plus this transaction's own writes. Dropping an
/// unfinished transaction rolls it back.
#[async_trait]
pub trait StoreTx: Send {
    /// Smallest order id in the partition, without locking.
    async fn min_pending_id(&mut self, partition: Partition)
    -> Result<Option<OrderId>, CourierError>;

    /// Smallest order id in the partition, holding an exclusive lock on the
    /// partition (and the returned row) until this transaction ends.
    ///
    /// A competing caller blocks until the holder commits or rolls back, then
    /// re-evaluates against the current committed state.
    async fn min_pending_id_for_update(
        &mut self,
        partition: Partition,
    ) -> Result<Option<OrderId>, CourierError>;

    /// Delete by exact key; returns the number of rows removed (0 or 1).
    ///
    /// 0 means another transaction already removed the row (a lost race) or
    /// it never existed.
    async fn delete_item(
        &mut self,
        partition: Partition,
        order_id: OrderId,
    ) -> Result<u64, CourierError>;

    /// Insert one row; `CourierError::DuplicateKey` if the key exists.
    async fn insert_item(&mut self, item: PendingItem) -> Result<(), CourierError>;

    /// Batched insert used by the seeder.
    ///
    /// On `DuplicateKey` nothing from this call becomes visible once the
    /// transaction is rolled back.
    async fn bulk_insert(&mut self, items: &[PendingItem]) -> Result<u64, CourierError>;

    async fn commit(self: Box<Self>) -> Result<(), CourierError>;

    async fn rollback(self: Box<Self>) -> Result<(), CourierError>;
}
