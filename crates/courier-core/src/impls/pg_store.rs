//! PgQueueStore - PostgreSQL 上の new_orders テーブル
//!
//! ロック付き読み出しは `pg_advisory_xact_lock(w, d)` でパーティションを押さえてから
//! `ORDER BY ... LIMIT 1 FOR UPDATE` します。
//! 空のパーティションでは `FOR UPDATE` が何もロックしないので、advisory lock が
//! パーティションのインテントロックを担います（トランザクション終了で解放）。
//! 待たされた側は、先行トランザクションが消した行を飛ばして次の行をロックします。

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Transaction};
use tracing::{debug, error, info, instrument};

use crate::domain::{CourierError, OrderId, Partition, PendingItem};
use crate::ports::{QueueStore, StoreTx};

/// Rows per INSERT statement in `bulk_insert` (3 binds per row).
const BULK_CHUNK_ROWS: usize = 1000;

const UNIQUE_VIOLATION: &str = "23505";
const LOCK_NOT_AVAILABLE: &str = "55P03";
const DEADLOCK_DETECTED: &str = "40P01";

const MIN_PENDING_ID: &str = r#"
    SELECT MIN(no_o_id)
    FROM new_orders
    WHERE no_w_id = $1 AND no_d_id = $2
"#;

/// Two-key form: (warehouse, district). Released when the transaction ends.
const LOCK_PARTITION: &str = "SELECT pg_advisory_xact_lock($1, $2)";

const MIN_PENDING_ID_FOR_UPDATE: &str = r#"
    SELECT no_o_id
    FROM new_orders
    WHERE no_w_id = $1 AND no_d_id = $2
    ORDER BY no_o_id
    LIMIT 1
    FOR UPDATE
"#;

const DELETE_ITEM: &str = r#"
    DELETE FROM new_orders
    WHERE no_w_id = $1 AND no_d_id = $2 AND no_o_id = $3
"#;

const INSERT_ITEM: &str = r#"
    INSERT INTO new_orders (no_o_id, no_d_id, no_w_id)
    VALUES ($1, $2, $3)
"#;

/// PostgreSQL-backed queue store.
#[derive(Clone)]
pub struct PgQueueStore {
    pool: PgPool,
    lock_wait_timeout: Duration,
}

impl PgQueueStore {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        lock_wait_timeout: Duration,
    ) -> Result<Self, CourierError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| {
                error!("Failed to connect to queue store: {}", e);
                classify(e, None)
            })?;
        Ok(Self::from_pool(pool, lock_wait_timeout))
    }

    pub fn from_pool(pool: PgPool, lock_wait_timeout: Duration) -> Self {
        Self {
            pool,
            lock_wait_timeout,
        }
    }

    /// Drop and recreate `new_orders`.
    #[instrument(skip(self))]
    pub async fn reset_schema(&self) -> Result<(), CourierError> {
        sqlx::query("DROP TABLE IF EXISTS new_orders")
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, None))?;
        sqlx::query(
            r#"
            CREATE TABLE new_orders (
                no_o_id INT,
                no_d_id INT,
                no_w_id INT,
                PRIMARY KEY (no_w_id, no_d_id, no_o_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| classify(e, None))?;

        info!("Recreated new_orders");
        Ok(())
    }
}

#[async_trait]
impl QueueStore for PgQueueStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, CourierError> {
        let mut tx = self.pool.begin().await.map_err(|e| classify(e, None))?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            .execute(&mut *tx)
            .await
            .map_err(|e| classify(e, None))?;

        // SET does not take bind parameters; the value is an integer we own
        let set_timeout = format!(
            "SET LOCAL lock_timeout = {}",
            self.lock_wait_timeout.as_millis()
        );
        sqlx::query(&set_timeout)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify(e, None))?;

        Ok(Box::new(PgTx { tx }))
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn min_pending_id(
        &mut self,
        partition: Partition,
    ) -> Result<Option<OrderId>, CourierError> {
        let min: Option<i32> = sqlx::query_scalar(MIN_PENDING_ID)
            .bind(partition.warehouse_id.get())
            .bind(partition.district_id.get())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| classify(e, None))?;
        Ok(min.map(OrderId::new))
    }

    async fn min_pending_id_for_update(
        &mut self,
        partition: Partition,
    ) -> Result<Option<OrderId>, CourierError> {
        // subject to lock_timeout like any other lock wait
        sqlx::query(LOCK_PARTITION)
            .bind(partition.warehouse_id.get())
            .bind(partition.district_id.get())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| classify(e, None))?;

        let min: Option<i32> = sqlx::query_scalar(MIN_PENDING_ID_FOR_UPDATE)
            .bind(partition.warehouse_id.get())
            .bind(partition.district_id.get())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| classify(e, None))?;
        Ok(min.map(OrderId::new))
    }

    async fn delete_item(
        &mut self,
        partition: Partition,
        order_id: OrderId,
    ) -> Result<u64, CourierError> {
        let result = sqlx::query(DELETE_ITEM)
            .bind(partition.warehouse_id.get())
            .bind(partition.district_id.get())
            .bind(order_id.get())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| classify(e, None))?;
        Ok(result.rows_affected())
    }

    async fn insert_item(&mut self, item: PendingItem) -> Result<(), CourierError> {
        sqlx::query(INSERT_ITEM)
            .bind(item.order_id.get())
            .bind(item.district_id.get())
            .bind(item.warehouse_id.get())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| classify(e, Some(&item)))?;
        Ok(())
    }

    async fn bulk_insert(&mut self, items: &[PendingItem]) -> Result<u64, CourierError> {
        let mut inserted = 0;
        for chunk in items.chunks(BULK_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO new_orders (no_o_id, no_d_id, no_w_id) ");
            builder.push_values(chunk, |mut row, item| {
                row.push_bind(item.order_id.get())
                    .push_bind(item.district_id.get())
                    .push_bind(item.warehouse_id.get());
            });
            let result = builder
                .build()
                .execute(&mut *self.tx)
                .await
                .map_err(|e| classify(e, chunk.first()))?;
            inserted += result.rows_affected();
        }
        debug!(rows = inserted, "Bulk inserted pending items");
        Ok(inserted)
    }

    async fn commit(self: Box<Self>) -> Result<(), CourierError> {
        let PgTx { tx } = *self;
        tx.commit().await.map_err(|e| classify(e, None))
    }

    async fn rollback(self: Box<Self>) -> Result<(), CourierError> {
        let PgTx { tx } = *self;
        tx.rollback().await.map_err(|e| classify(e, None))
    }
}

/// Map a driver error onto the session error taxonomy.
fn classify(err: sqlx::Error, item: Option<&PendingItem>) -> CourierError {
    if let sqlx::Error::Database(db) = &err {
        match db.code().as_deref() {
            Some(UNIQUE_VIOLATION) => {
                let key = item.map_or_else(|| db.message().to_string(), |i| i.to_string());
                return CourierError::DuplicateKey(key);
            }
            Some(LOCK_NOT_AVAILABLE) | Some(DEADLOCK_DETECTED) => {
                return CourierError::LockTimeout(db.message().to_string());
            }
            _ => {}
        }
    }
    CourierError::StoreUnavailable(err.to_string())
}

#[cfg(test)]
mod tests {
    //! Needs a live PostgreSQL; run with
    //! `DATABASE_URL=postgres://... cargo test -- --ignored`.

    use super::*;
    use crate::domain::{DistrictId, WarehouseId};

    async fn store() -> PgQueueStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let store = PgQueueStore::connect(&url, 4, Duration::from_secs(2))
            .await
            .unwrap();
        store.reset_schema().await.unwrap();
        store
    }

    fn p() -> Partition {
        Partition::new(WarehouseId::new(1), DistrictId::new(1))
    }

    #[tokio::test]
    #[ignore]
    async fn pg_round_trip_and_duplicate_key() {
        let store = store().await;

        let mut tx = store.begin().await.unwrap();
        let items: Vec<PendingItem> = (2101..=2103).map(|o| p().item(OrderId::new(o))).collect();
        assert_eq!(tx.bulk_insert(&items).await.unwrap(), 3);
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.min_pending_id(p()).await.unwrap(), Some(OrderId::new(2101)));
        assert_eq!(
            tx.min_pending_id_for_update(p()).await.unwrap(),
            Some(OrderId::new(2101))
        );
        assert_eq!(tx.delete_item(p(), OrderId::new(2101)).await.unwrap(), 1);
        tx.insert_item(p().item(OrderId::new(3001))).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let err = tx.insert_item(p().item(OrderId::new(2102))).await.unwrap_err();
        assert!(matches!(err, CourierError::DuplicateKey(_)));
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn pg_locking_read_times_out_under_contention() {
        let store = store().await;

        let mut holder = store.begin().await.unwrap();
        holder.insert_item(p().item(OrderId::new(2101))).await.unwrap();
        holder.commit().await.unwrap();

        let mut holder = store.begin().await.unwrap();
        holder.min_pending_id_for_update(p()).await.unwrap();

        let mut waiter = store.begin().await.unwrap();
        let err = waiter.min_pending_id_for_update(p()).await.unwrap_err();
        assert!(matches!(err, CourierError::LockTimeout(_)));
    }

    #[tokio::test]
    #[ignore]
    async fn pg_locking_read_holds_an_empty_partition() {
        let store = store().await;

        let mut holder = store.begin().await.unwrap();
        assert_eq!(holder.min_pending_id_for_update(p()).await.unwrap(), None);

        let mut waiter = store.begin().await.unwrap();
        let err = waiter.min_pending_id_for_update(p()).await.unwrap_err();
        assert!(matches!(err, CourierError::LockTimeout(_)));
        waiter.rollback().await.unwrap();

        holder.rollback().await.unwrap();
        let mut next = store.begin().await.unwrap();
        assert_eq!(next.min_pending_id_for_update(p()).await.unwrap(), None);
    }
}
