//! End-to-end delivery behaviour against the in-memory store.

use std::collections::HashSet;
use std::sync::Arc;

use rstest::rstest;

use courier_core::app::{DeliveryStrategy, Harness, SeedPlan, Seeder, build_strategy};
use courier_core::config::DeliveryConfig;
use courier_core::domain::{
    CourierError, DistrictId, OrderId, Partition, SessionReport, StrategyKind, WarehouseId,
};
use courier_core::impls::InMemoryQueueStore;
use courier_core::ports::{QueueStore, SeededRandom, SeederRole};

fn p(w: i32, d: i32) -> Partition {
    Partition::new(WarehouseId::new(w), DistrictId::new(d))
}

fn ids(values: &[i32]) -> Vec<OrderId> {
    values.iter().copied().map(OrderId::new).collect()
}

async fn seed_partition(store: &InMemoryQueueStore, partition: Partition, values: &[i32]) {
    let mut tx = store.begin().await.unwrap();
    let items: Vec<_> = values
        .iter()
        .map(|&o| partition.item(OrderId::new(o)))
        .collect();
    tx.bulk_insert(&items).await.unwrap();
    tx.commit().await.unwrap();
}

fn config(strategy: StrategyKind, partition_count: i32) -> DeliveryConfig {
    DeliveryConfig {
        strategy,
        partition_count,
        ..DeliveryConfig::default()
    }
}

async fn spawn_session(
    strategy: &Arc<dyn DeliveryStrategy>,
    warehouse: i32,
) -> Result<SessionReport, CourierError> {
    let strategy = Arc::clone(strategy);
    tokio::spawn(async move { strategy.run_session(WarehouseId::new(warehouse)).await })
        .await
        .unwrap()
}

fn delivered_ids(reports: &[SessionReport]) -> Vec<OrderId> {
    reports
        .iter()
        .flat_map(|r| r.districts.iter().filter_map(|(_, o)| o.delivered_order()))
        .collect()
}

#[rstest]
#[case::locking_scan(StrategyKind::LockingScan)]
#[case::optimistic_retry(StrategyKind::OptimisticRetry)]
#[tokio::test]
async fn one_session_swaps_oldest_for_placeholder(#[case] kind: StrategyKind) {
    let store = InMemoryQueueStore::new();
    seed_partition(&store, p(1, 1), &[2101, 2102, 2103]).await;

    let strategy = build_strategy(kind, Arc::new(store.clone()), &config(kind, 1));
    let report = strategy.run_session(WarehouseId::new(1)).await.unwrap();

    assert_eq!(report.delivered(), 1);
    assert_eq!(store.pending_ids(p(1, 1)), ids(&[2102, 2103, 3001]));
}

#[rstest]
#[case::locking_scan(StrategyKind::LockingScan)]
#[case::optimistic_retry(StrategyKind::OptimisticRetry)]
#[tokio::test]
async fn empty_partitions_are_left_untouched(#[case] kind: StrategyKind) {
    let store = InMemoryQueueStore::new();
    seed_partition(&store, p(3, 2), &[2101]).await;

    let strategy = build_strategy(kind, Arc::new(store.clone()), &config(kind, 3));
    let report = strategy.run_session(WarehouseId::new(3)).await.unwrap();

    assert_eq!(report.not_found(), 2);
    assert_eq!(report.delivered(), 1);
    assert!(store.pending_ids(p(3, 1)).is_empty());
    assert!(store.pending_ids(p(3, 3)).is_empty());
    assert_eq!(store.pending_ids(p(3, 2)), ids(&[3001]));
}

#[rstest]
#[case::locking_scan(StrategyKind::LockingScan)]
#[case::optimistic_retry(StrategyKind::OptimisticRetry)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sessions_never_deliver_an_item_twice(#[case] kind: StrategyKind) {
    const SESSIONS: usize = 8;

    let store = InMemoryQueueStore::new();
    seed_partition(&store, p(1, 1), &[2101]).await;
    let strategy = build_strategy(kind, Arc::new(store.clone()), &config(kind, 1));

    let handles: Vec<_> = (0..SESSIONS)
        .map(|_| {
            let strategy = Arc::clone(&strategy);
            tokio::spawn(async move { strategy.run_session(WarehouseId::new(1)).await })
        })
        .collect();
    let mut reports = Vec::new();
    for handle in handles {
        reports.push(handle.await.unwrap().unwrap());
    }

    let delivered = delivered_ids(&reports);
    let unique: HashSet<_> = delivered.iter().copied().collect();
    assert_eq!(delivered.len(), SESSIONS);
    assert_eq!(unique.len(), SESSIONS, "an order was delivered twice: {delivered:?}");
    assert_eq!(
        delivered.iter().filter(|o| **o == OrderId::new(2101)).count(),
        1
    );
    // each delivery replaced one row with one placeholder
    assert_eq!(store.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn locking_scan_serialises_sessions_on_one_warehouse() {
    let store = InMemoryQueueStore::new();
    for d in 1..=3 {
        seed_partition(&store, p(1, d), &[2101, 2102, 2103]).await;
    }
    let strategy = build_strategy(
        StrategyKind::LockingScan,
        Arc::new(store.clone()),
        &config(StrategyKind::LockingScan, 3),
    );

    let (a, b) = tokio::join!(spawn_session(&strategy, 1), spawn_session(&strategy, 1));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.restarts + b.restarts, 0);
    for d in 1..=3 {
        let district = DistrictId::new(d);
        let mut got: Vec<_> = [a.outcome_for(district), b.outcome_for(district)]
            .into_iter()
            .flatten()
            .filter_map(|o| o.delivered_order())
            .collect();
        got.sort();
        assert_eq!(got, ids(&[2101, 2102]));
        assert_eq!(store.pending_ids(p(1, d)), ids(&[2103, 3001, 3002]));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_optimistic_sessions_share_the_sole_item() {
    let store = InMemoryQueueStore::new();
    seed_partition(&store, p(1, 1), &[2101]).await;
    let strategy = build_strategy(
        StrategyKind::OptimisticRetry,
        Arc::new(store.clone()),
        &config(StrategyKind::OptimisticRetry, 1),
    );

    let (a, b) = tokio::join!(spawn_session(&strategy, 1), spawn_session(&strategy, 1));
    let reports = [a.unwrap(), b.unwrap()];

    let mut delivered = delivered_ids(&reports);
    delivered.sort();
    // whoever lost the race restarted and took the winner's placeholder
    assert_eq!(delivered, ids(&[2101, 3001]));
    assert!(reports.iter().map(|r| r.restarts).sum::<u32>() <= 1);
    assert_eq!(store.pending_ids(p(1, 1)), ids(&[3901]));
}

#[tokio::test]
async fn single_optimistic_worker_never_restarts() {
    let store = InMemoryQueueStore::new();
    let config = DeliveryConfig {
        warehouse_count: 2,
        partition_count: 4,
        order_id_high: 2150,
        worker_count: 1,
        strategy: StrategyKind::OptimisticRetry,
        iterations: Some(20),
        ..DeliveryConfig::default()
    };

    let report = Harness::new(Arc::new(store), config)
        .unwrap()
        .with_random(Arc::new(SeededRandom::new(11)))
        .run(0, false, std::future::pending())
        .await
        .unwrap();

    assert_eq!(report.counts.sessions_committed, 20);
    assert_eq!(report.counts.restarts, 0);
    assert_eq!(report.counts.lost_races, 0);
    assert_eq!(report.counts.delivered, 20 * 4);
}

#[tokio::test]
async fn reseeding_fails_and_leaves_rows_unmodified() {
    let store = InMemoryQueueStore::new();
    let plan = SeedPlan {
        warehouse_count: 2,
        partition_count: 2,
        order_id_low: 2101,
        order_id_high: 2200,
        batch_size: 30,
    };
    let seeder = Seeder::new(Arc::new(store.clone()), plan);

    let first = seeder.seed(SeederRole::Initializer).await.unwrap();
    assert_eq!(first.rows, 400);
    let before: Vec<_> = (1..=2)
        .flat_map(|w| (1..=2).map(move |d| p(w, d)))
        .map(|partition| store.pending_ids(partition))
        .collect();

    let err = seeder.seed(SeederRole::Initializer).await.unwrap_err();
    assert!(matches!(err, CourierError::DuplicateKey(_)));

    let after: Vec<_> = (1..=2)
        .flat_map(|w| (1..=2).map(move |d| p(w, d)))
        .map(|partition| store.pending_ids(partition))
        .collect();
    assert_eq!(before, after);
    assert_eq!(store.len(), 400);
}

#[rstest]
#[case::locking_scan(StrategyKind::LockingScan)]
#[case::optimistic_retry(StrategyKind::OptimisticRetry)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn contended_harness_run_conserves_the_queue(#[case] kind: StrategyKind) {
    let store = InMemoryQueueStore::new();
    let config = DeliveryConfig {
        warehouse_count: 2,
        partition_count: 5,
        order_id_high: 2200,
        worker_count: 4,
        strategy: kind,
        iterations: Some(15),
        ..DeliveryConfig::default()
    };

    let report = Harness::new(Arc::new(store.clone()), config)
        .unwrap()
        .with_random(Arc::new(SeededRandom::new(5)))
        .run(0, false, std::future::pending())
        .await
        .unwrap();

    let counts = report.counts;
    assert_eq!(counts.sessions_failed, 0);
    assert_eq!(counts.sessions_committed, 4 * 15);
    assert_eq!(counts.delivered + counts.not_found, counts.sessions_committed * 5);
    assert_eq!(counts.not_found, 0);
    if kind == StrategyKind::LockingScan {
        assert_eq!(counts.restarts, 0);
    }
    assert_eq!(store.len(), 2 * 5 * 100);
}
