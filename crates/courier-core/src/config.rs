//! Configuration: defaults → optional file → `COURIER__*` environment.
//!
//! Every key has a default (`#[serde(default)]`), so a file or the
//! environment only needs to name what it changes.
//!
//! ```toml
//! warehouse_count = 10
//! strategy = "locking-scan"
//! iterations = 100
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::app::retry::RetryPolicy;
use crate::domain::StrategyKind;

pub const ENV_PREFIX: &str = "COURIER";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which store adapter to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreKind {
    Memory,
    Postgres,
}

impl std::str::FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(StoreKind::Memory),
            "postgres" => Ok(StoreKind::Postgres),
            other => Err(format!("unknown store '{other}' (expected memory or postgres)")),
        }
    }
}

/// How long each worker keeps running sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionBudget {
    /// Sessions per worker.
    Iterations(u64),
    /// Wall-clock time; a session in flight when it expires is finished.
    Duration(Duration),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// W: warehouses 1..=W.
    pub warehouse_count: i32,

    /// Districts per warehouse.
    pub partition_count: i32,

    /// Seeded order ids per partition: `order_id_low..=order_id_high`.
    pub order_id_low: i32,
    pub order_id_high: i32,

    /// Added to a delivered order id to form the reinserted placeholder.
    pub placeholder_offset: i32,

    pub seed_batch_size: usize,

    /// P: concurrent workers.
    pub worker_count: usize,

    pub strategy: StrategyKind,

    /// Sessions per worker; takes precedence over `duration_secs`.
    pub iterations: Option<u64>,
    pub duration_secs: Option<u64>,

    /// Optimistic-Retry only. None keeps retrying forever.
    pub max_restarts: Option<u32>,

    /// Optimistic-Retry only. None restarts immediately.
    pub restart_backoff_ms: Option<u64>,
    pub backoff_multiplier: f64,

    pub lock_wait_timeout_ms: u64,

    pub store: StoreKind,
    pub database_url: Option<String>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            warehouse_count: 10,
            partition_count: 10,
            order_id_low: 2101,
            order_id_high: 3000,
            placeholder_offset: 900,
            seed_batch_size: 1000,
            worker_count: 2,
            strategy: StrategyKind::OptimisticRetry,
            iterations: None,
            duration_secs: None,
            max_restarts: None,
            restart_backoff_ms: None,
            backoff_multiplier: 2.0,
            lock_wait_timeout_ms: 50_000,
            store: StoreKind::Memory,
            database_url: None,
        }
    }
}

impl DeliveryConfig {
    pub const DEFAULT_DURATION: Duration = Duration::from_secs(60);

    /// Load from an optional file plus `COURIER__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, None)
    }

    /// As `load`, reading the environment from `env` instead of the process
    /// when it is given.
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .source(env),
        );

        let config: DeliveryConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.warehouse_count < 1 {
            return invalid(format!(
                "warehouse_count must be >= 1 (got {})",
                self.warehouse_count
            ));
        }
        if self.partition_count < 1 {
            return invalid(format!(
                "partition_count must be >= 1 (got {})",
                self.partition_count
            ));
        }
        if self.order_id_low > self.order_id_high {
            return invalid(format!(
                "order_id_low ({}) must not exceed order_id_high ({})",
                self.order_id_low, self.order_id_high
            ));
        }
        match self.order_id_low.checked_add(self.placeholder_offset) {
            Some(first_placeholder) if first_placeholder > self.order_id_high => {}
            _ => {
                return invalid(format!(
                    "placeholder_offset {} reinserts ids inside the seeded range {}..={}",
                    self.placeholder_offset, self.order_id_low, self.order_id_high
                ));
            }
        }
        if self.seed_batch_size == 0 {
            return invalid("seed_batch_size must be >= 1".to_string());
        }
        if self.worker_count == 0 {
            return invalid("worker_count must be >= 1".to_string());
        }
        if self.iterations == Some(0) {
            return invalid("iterations must be >= 1".to_string());
        }
        if !(self.backoff_multiplier >= 1.0) {
            return invalid(format!(
                "backoff_multiplier must be >= 1.0 (got {})",
                self.backoff_multiplier
            ));
        }
        if self.store == StoreKind::Postgres && self.database_url.is_none() {
            return invalid("store = postgres requires database_url".to_string());
        }
        Ok(())
    }

    pub fn budget(&self) -> SessionBudget {
        match (self.iterations, self.duration_secs) {
            (Some(n), _) => SessionBudget::Iterations(n),
            (None, Some(secs)) => SessionBudget::Duration(Duration::from_secs(secs)),
            (None, None) => SessionBudget::Duration(Self::DEFAULT_DURATION),
        }
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }

    pub fn restart_backoff(&self) -> Option<RetryPolicy> {
        self.restart_backoff_ms.map(|ms| RetryPolicy {
            base_delay: Duration::from_millis(ms),
            multiplier: self.backoff_multiplier,
        })
    }
}
