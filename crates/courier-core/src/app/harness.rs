//! Harness - seed → spawn workers → aggregate
//!
//! # フロー
//! 1. identity 0 のときだけ Seeder を実行（`SeederRole::for_identity`）
//! 2. 設定された strategy で P 個のワーカーを起動
//! 3. 予算を使い切るか shutdown が来たら集計を返す

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::app::counts::DeliveryCounts;
use crate::app::seeder::{SeedPlan, SeedReport, Seeder};
use crate::app::strategy::build_strategy;
use crate::app::worker_group::{WorkerGroup, WorkerSettings};
use crate::config::{ConfigError, DeliveryConfig};
use crate::domain::{CourierError, StrategyKind};
use crate::ports::{QueueStore, RandomSource, SeederRole, ThreadRandom};

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub strategy: StrategyKind,
    pub workers: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub seeded: SeedReport,
    pub counts: DeliveryCounts,
}

pub struct Harness {
    store: Arc<dyn QueueStore>,
    config: DeliveryConfig,
    random: Arc<dyn RandomSource>,
}

impl Harness {
    /// Rejects a config that `DeliveryConfig::validate` refuses.
    pub fn new(store: Arc<dyn QueueStore>, config: DeliveryConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            random: Arc::new(ThreadRandom),
        })
    }

    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Seed the store if `identity` is the designated initializer.
    pub async fn seed(&self, identity: u32) -> Result<SeedReport, CourierError> {
        Seeder::new(Arc::clone(&self.store), SeedPlan::from_config(&self.config))
            .seed(SeederRole::for_identity(identity))
            .await
    }

    pub fn spawn_workers(&self) -> WorkerGroup {
        let strategy = build_strategy(self.config.strategy, Arc::clone(&self.store), &self.config);
        WorkerGroup::spawn(
            self.config.worker_count,
            strategy,
            Arc::clone(&self.random),
            WorkerSettings {
                warehouse_count: self.config.warehouse_count,
                budget: self.config.budget(),
            },
        )
    }

    /// Seed (as `identity`, unless `skip_seed`), then run workers until the
    /// budget is spent or `shutdown` resolves.
    pub async fn run<F>(
        &self,
        identity: u32,
        skip_seed: bool,
        shutdown: F,
    ) -> Result<RunReport, CourierError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let started_at = Utc::now();
        let seeded = if skip_seed {
            SeedReport::default()
        } else {
            self.seed(identity).await?
        };

        info!(
            strategy = %self.config.strategy,
            workers = self.config.worker_count,
            warehouses = self.config.warehouse_count,
            budget = ?self.config.budget(),
            "Starting delivery workers"
        );
        let group = self.spawn_workers();
        let handle = group.shutdown_handle();
        let watcher = tokio::spawn(async move {
            shutdown.await;
            handle.request();
        });

        let counts = group.join().await;
        watcher.abort();
        let counts = counts?;

        let finished_at = Utc::now();
        info!(
            sessions = counts.sessions(),
            delivered = counts.delivered,
            not_found = counts.not_found,
            lost_races = counts.lost_races,
            failed = counts.sessions_failed,
            "Run finished"
        );
        Ok(RunReport {
            strategy: self.config.strategy,
            workers: self.config.worker_count,
            started_at,
            finished_at,
            seeded,
            counts,
        })
    }
}
