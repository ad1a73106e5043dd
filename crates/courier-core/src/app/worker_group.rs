use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::app::counts::DeliveryCounts;
use crate::app::strategy::DeliveryStrategy;
use crate::config::SessionBudget;
use crate::domain::{CourierError, WarehouseId};
use crate::ports::RandomSource;

/// Worker group handle.
/// - `request_shutdown` で全ワーカーが止まる（実行中のセッションはロールバック）
/// - `join()` で全ワーカーの終了を待ち、集計を受け取る（panic したワーカーがいれば Err）
pub struct WorkerGroup {
    shutdown_tx: Arc<watch::Sender<bool>>,
    joins: Vec<JoinHandle<DeliveryCounts>>,
}

/// Cloneable trigger for `WorkerGroup::request_shutdown`.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn request(&self) {
        // receivers may already be gone
        let _ = self.tx.send(true);
    }
}

/// Per-worker loop settings.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub warehouse_count: i32,
    pub budget: SessionBudget,
}

impl WorkerGroup {
    /// Spawn `n` workers, identities `0..n`.
    pub fn spawn(
        n: usize,
        strategy: Arc<dyn DeliveryStrategy>,
        random: Arc<dyn RandomSource>,
        settings: WorkerSettings,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for agent in 0..n {
            let strategy = Arc::clone(&strategy);
            let random = Arc::clone(&random);
            let rx = shutdown_rx.clone();
            let span = info_span!("worker", agent, strategy = %strategy.kind());

            let join = tokio::spawn(
                worker_loop(strategy, random, settings, rx).instrument(span),
            );
            joins.push(join);
        }

        Self {
            shutdown_tx: Arc::new(shutdown_tx),
            joins,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Request shutdown for all workers.
    /// In-flight sessions are abandoned; their transactions roll back on drop.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for every worker to spend its budget, then sum their counts.
    ///
    /// Every worker is awaited even if one fails; the first failure is returned.
    pub async fn join(self) -> Result<DeliveryCounts, CourierError> {
        let mut total = DeliveryCounts::default();
        let mut failure = None;
        for (agent, join) in self.joins.into_iter().enumerate() {
            match join.await {
                Ok(counts) => total.merge(&counts),
                Err(err) => {
                    warn!(agent, error = %err, "Worker task did not finish cleanly");
                    let err = CourierError::WorkerFailed(format!("agent {agent}: {err}"));
                    failure.get_or_insert(err);
                }
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(total),
        }
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) -> Result<DeliveryCounts, CourierError> {
        self.request_shutdown();
        self.join().await
    }
}

async fn worker_loop(
    strategy: Arc<dyn DeliveryStrategy>,
    random: Arc<dyn RandomSource>,
    settings: WorkerSettings,
    mut shutdown_rx: watch::Receiver<bool>,
) -> DeliveryCounts {
    let started = Instant::now();
    let mut counts = DeliveryCounts::default();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        let spent = match settings.budget {
            SessionBudget::Iterations(n) => counts.sessions() >= n,
            SessionBudget::Duration(limit) => started.elapsed() >= limit,
        };
        if spent {
            break;
        }

        let warehouse = WarehouseId::new(random.random_int(1, settings.warehouse_count));
        let session = strategy
            .run_session(warehouse)
            .instrument(info_span!("session", %warehouse));

        let result = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                debug!(%warehouse, "Shutdown requested, abandoning session");
                break;
            }
            result = session => result,
        };

        match result {
            Ok(report) => {
                debug!(
                    %warehouse,
                    delivered = report.delivered(),
                    not_found = report.not_found(),
                    restarts = report.restarts,
                    "Session committed"
                );
                counts.record_report(&report);
            }
            Err(err) => {
                // the strategy has already rolled back; keep going with a fresh session
                warn!(%warehouse, kind = ?err.kind(), error = %err, "Session failed");
                counts.record_failure(&err);
            }
        }

        // an uncontended in-memory session never suspends
        tokio::task::yield_now().await;
    }

    info!(
        sessions = counts.sessions(),
        delivered = counts.delivered,
        lost_races = counts.lost_races,
        failed = counts.sessions_failed,
        "Worker finished"
    );
    counts
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::domain::{DistrictId, DistrictOutcome, OrderId, SessionReport, StrategyKind};
    use crate::ports::SeededRandom;

    /// Records the warehouses it was asked for; fails every third session.
    #[derive(Default)]
    struct ScriptedStrategy {
        seen: Mutex<Vec<WarehouseId>>,
    }

    #[async_trait]
    impl DeliveryStrategy for ScriptedStrategy {
        fn kind(&self) -> StrategyKind {
            StrategyKind::LockingScan
        }

        async fn run_session(&self, warehouse: WarehouseId) -> Result<SessionReport, CourierError> {
            let n = {
                let mut seen = self.seen.lock();
                seen.push(warehouse);
                seen.len()
            };
            if n % 3 == 0 {
                return Err(CourierError::LockTimeout(format!("w={warehouse}")));
            }
            Ok(SessionReport {
                warehouse_id: warehouse,
                strategy: StrategyKind::LockingScan,
                districts: vec![(DistrictId::FIRST, DistrictOutcome::Locked(OrderId::new(2101)))],
                restarts: 0,
                lost_races: 0,
            })
        }
    }

    /// Never finishes a session.
    struct StuckStrategy;

    #[async_trait]
    impl DeliveryStrategy for StuckStrategy {
        fn kind(&self) -> StrategyKind {
            StrategyKind::OptimisticRetry
        }

        async fn run_session(
            &self,
            _warehouse: WarehouseId,
        ) -> Result<SessionReport, CourierError> {
            std::future::pending::<Result<SessionReport, CourierError>>().await
        }
    }

    struct PanickingStrategy;

    #[async_trait]
    impl DeliveryStrategy for PanickingStrategy {
        fn kind(&self) -> StrategyKind {
            StrategyKind::LockingScan
        }

        async fn run_session(&self, warehouse: WarehouseId) -> Result<SessionReport, CourierError> {
            panic!("session on {warehouse} blew up")
        }
    }

    fn settings(budget: SessionBudget) -> WorkerSettings {
        WorkerSettings {
            warehouse_count: 4,
            budget,
        }
    }

    #[tokio::test]
    async fn iteration_budget_is_per_worker() {
        let strategy = Arc::new(ScriptedStrategy::default());
        let group = WorkerGroup::spawn(
            2,
            Arc::clone(&strategy) as Arc<dyn DeliveryStrategy>,
            Arc::new(SeededRandom::new(1)),
            settings(SessionBudget::Iterations(6)),
        );

        let counts = group.join().await.unwrap();

        assert_eq!(counts.sessions(), 12);
        assert_eq!(counts.sessions_committed, 8);
        assert_eq!(counts.transient_failures, 4);
        assert_eq!(counts.delivered, 8);

        let seen = strategy.seen.lock();
        assert!(seen.iter().all(|w| (1..=4).contains(&w.get())));
    }

    #[tokio::test]
    async fn shutdown_abandons_in_flight_sessions() {
        let group = WorkerGroup::spawn(
            3,
            Arc::new(StuckStrategy),
            Arc::new(SeededRandom::new(1)),
            settings(SessionBudget::Iterations(1)),
        );

        let counts = tokio::time::timeout(Duration::from_secs(5), group.shutdown_and_join())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counts, DeliveryCounts::default());
    }

    #[tokio::test(start_paused = true)]
    async fn duration_budget_stops_workers() {
        let group = WorkerGroup::spawn(
            1,
            Arc::new(ScriptedStrategy::default()),
            Arc::new(SeededRandom::new(1)),
            settings(SessionBudget::Duration(Duration::ZERO)),
        );

        let counts = group.join().await.unwrap();
        assert_eq!(counts.sessions(), 0);
    }

    #[tokio::test]
    async fn shutdown_handle_stops_the_group() {
        let group = WorkerGroup::spawn(
            2,
            Arc::new(StuckStrategy),
            Arc::new(SeededRandom::new(1)),
            settings(SessionBudget::Duration(Duration::from_secs(3600))),
        );
        group.shutdown_handle().request();

        let counts = tokio::time::timeout(Duration::from_secs(5), group.join())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counts.sessions(), 0);
    }

    #[tokio::test]
    async fn panicked_worker_fails_the_join() {
        let group = WorkerGroup::spawn(
            2,
            Arc::new(PanickingStrategy),
            Arc::new(SeededRandom::new(1)),
            settings(SessionBudget::Iterations(1)),
        );

        let err = group.join().await.unwrap_err();
        assert!(matches!(err, CourierError::WorkerFailed(_)));
        assert!(!err.is_retryable());
    }
}
