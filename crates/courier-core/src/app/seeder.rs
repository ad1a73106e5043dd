//! Seeder - 初期データの投入（イニシャライザだけが実行）
//!
//! パーティションごとに 1 トランザクション。途中で `DuplicateKey` になった
//! パーティションはロールバックされ、既存の行には触れません。

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::DeliveryConfig;
use crate::domain::{CourierError, DistrictId, OrderId, Partition, PendingItem, WarehouseId};
use crate::ports::{QueueStore, SeederRole};

/// What to seed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedPlan {
    pub warehouse_count: i32,
    pub partition_count: i32,
    pub order_id_low: i32,
    pub order_id_high: i32,
    pub batch_size: usize,
}

impl SeedPlan {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            warehouse_count: config.warehouse_count,
            partition_count: config.partition_count,
            order_id_low: config.order_id_low,
            order_id_high: config.order_id_high,
            batch_size: config.seed_batch_size,
        }
    }

    fn partitions(&self) -> impl Iterator<Item = Partition> + '_ {
        (1..=self.warehouse_count).flat_map(move |w| {
            (1..=self.partition_count)
                .map(move |d| Partition::new(WarehouseId::new(w), DistrictId::new(d)))
        })
    }

    fn items(&self, partition: Partition) -> Vec<PendingItem> {
        (self.order_id_low..=self.order_id_high)
            .map(|o| partition.item(OrderId::new(o)))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    pub partitions: u32,
    pub rows: u64,
}

pub struct Seeder {
    store: Arc<dyn QueueStore>,
    plan: SeedPlan,
}

impl Seeder {
    pub fn new(store: Arc<dyn QueueStore>, plan: SeedPlan) -> Self {
        Self { store, plan }
    }

    /// Populate every partition. Followers return an empty report.
    #[instrument(skip(self), fields(warehouses = self.plan.warehouse_count))]
    pub async fn seed(&self, role: SeederRole) -> Result<SeedReport, CourierError> {
        if role == SeederRole::Follower {
            debug!("Not the initializer, skipping seed");
            return Ok(SeedReport::default());
        }
        let batch_size = self.plan.batch_size.max(1);

        let mut report = SeedReport::default();
        for partition in self.plan.partitions() {
            if partition.district_id == DistrictId::FIRST {
                info!(warehouse = %partition.warehouse_id, "Seeding warehouse");
            }

            let items = self.plan.items(partition);
            let mut tx = self.store.begin().await?;
            for batch in items.chunks(batch_size) {
                match tx.bulk_insert(batch).await {
                    Ok(rows) => report.rows += rows,
                    Err(err) => {
                        warn!(%partition, error = %err, "Seeding failed, rolling back partition");
                        if let Err(rollback_err) = tx.rollback().await {
                            warn!(error = %rollback_err, "Rollback failed");
                        }
                        return Err(err);
                    }
                }
            }
            tx.commit().await?;
            report.partitions += 1;
        }

        info!(partitions = report.partitions, rows = report.rows, "Seeding complete");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryQueueStore;

    fn plan() -> SeedPlan {
        SeedPlan {
            warehouse_count: 2,
            partition_count: 3,
            order_id_low: 2101,
            order_id_high: 2110,
            batch_size: 4,
        }
    }

    fn p(w: i32, d: i32) -> Partition {
        Partition::new(WarehouseId::new(w), DistrictId::new(d))
    }

    #[tokio::test]
    async fn initializer_fills_every_partition() {
        let store = InMemoryQueueStore::new();
        let seeder = Seeder::new(Arc::new(store.clone()), plan());

        let report = seeder.seed(SeederRole::Initializer).await.unwrap();

        assert_eq!(
            report,
            SeedReport {
                partitions: 6,
                rows: 60
            }
        );
        assert_eq!(store.len(), 60);
        let ids = store.pending_ids(p(2, 3));
        assert_eq!(ids.first(), Some(&OrderId::new(2101)));
        assert_eq!(ids.last(), Some(&OrderId::new(2110)));
    }

    #[tokio::test]
    async fn follower_is_a_no_op() {
        let store = InMemoryQueueStore::new();
        let seeder = Seeder::new(Arc::new(store.clone()), plan());

        let report = seeder.seed(SeederRole::Follower).await.unwrap();

        assert_eq!(report, SeedReport::default());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn collision_rolls_back_only_the_failing_partition() {
        let store = InMemoryQueueStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_item(p(1, 2).item(OrderId::new(2110))).await.unwrap();
        tx.commit().await.unwrap();

        let seeder = Seeder::new(Arc::new(store.clone()), plan());
        let err = seeder.seed(SeederRole::Initializer).await.unwrap_err();

        assert!(matches!(err, CourierError::DuplicateKey(_)));
        // (1,1) was committed before the collision, (1,2) keeps only its old row
        assert_eq!(store.pending_ids(p(1, 1)).len(), 10);
        assert_eq!(store.pending_ids(p(1, 2)), vec![OrderId::new(2110)]);
        assert!(store.pending_ids(p(1, 3)).is_empty());
    }
}
