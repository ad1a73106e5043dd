//! # courier
//!
//! Seeds a queue store, drains it with competing delivery workers and prints
//! the aggregated counts. `inspect` replays a lock script instead.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::info;

use courier_core::app::{Harness, LockInspector, LockScript};
use courier_core::config::{DeliveryConfig, StoreKind};
use courier_core::domain::StrategyKind;
use courier_core::impls::{InMemoryQueueStore, PgQueueStore};
use courier_core::logging::{LogFormat, init_logging};
use courier_core::ports::QueueStore;

#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(about = "Concurrent order-delivery queue workload")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file (TOML); COURIER__* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Queue store backend (memory | postgres)
    #[arg(long, global = true)]
    store: Option<StoreKind>,

    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Verbose output level (-v shows per-district debug lines)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Seed (as identity 0) and run the delivery workers
    Run(RunArgs),

    /// Only seed the store
    Seed,

    /// Replay a lock script against the store
    Inspect {
        #[arg(value_name = "SCRIPT")]
        script: PathBuf,

        /// Pause between script lines
        #[arg(long, default_value_t = 1000)]
        step_delay_ms: u64,

        /// Seed before running the script
        #[arg(long)]
        seed: bool,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// locking-scan | optimistic-retry
    #[arg(long)]
    strategy: Option<StrategyKind>,

    #[arg(short, long)]
    workers: Option<usize>,

    #[arg(long)]
    warehouses: Option<i32>,

    /// Sessions per worker
    #[arg(long, conflicts_with = "duration")]
    iterations: Option<u64>,

    /// Wall-clock budget in seconds
    #[arg(long)]
    duration: Option<u64>,

    #[arg(long)]
    max_restarts: Option<u32>,

    /// Scheduler identity of this process; only 0 seeds
    #[arg(long, default_value_t = 0)]
    identity: u32,

    #[arg(long)]
    skip_seed: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut DeliveryConfig) {
        if let Some(strategy) = self.strategy {
            config.strategy = strategy;
        }
        if let Some(workers) = self.workers {
            config.worker_count = workers;
        }
        if let Some(warehouses) = self.warehouses {
            config.warehouse_count = warehouses;
        }
        if let Some(iterations) = self.iterations {
            config.iterations = Some(iterations);
        }
        if let Some(duration) = self.duration {
            config.iterations = None;
            config.duration_secs = Some(duration);
        }
        if let Some(max_restarts) = self.max_restarts {
            config.max_restarts = Some(max_restarts);
        }
    }
}

fn log_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "info,courier_core=debug",
        _ => "debug,courier_core=trace",
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let format = if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    init_logging(log_directive(cli.verbose), format);

    let mut config = DeliveryConfig::load(cli.config.as_deref())?;
    if let Some(store) = cli.store {
        config.store = store;
    }
    if let Some(url) = &cli.database_url {
        config.database_url = Some(url.clone());
    }
    if let Command::Run(args) = &cli.command {
        args.apply(&mut config);
    }
    config.validate()?;

    match &cli.command {
        Command::Run(args) => {
            let seeding = args.identity == 0 && !args.skip_seed;
            let store = open_store(&config, seeding).await?;
            let harness = Harness::new(store, config)?;
            let shutdown = async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Ctrl-C received, stopping workers");
                }
            };

            let report = harness.run(args.identity, args.skip_seed, shutdown).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Seed => {
            let store = open_store(&config, true).await?;
            let report = Harness::new(store, config)?.seed(0).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Inspect {
            script,
            step_delay_ms,
            seed,
        } => {
            let source = std::fs::read_to_string(script)
                .with_context(|| format!("reading lock script {}", script.display()))?;
            let script = LockScript::parse(&source)?;

            let store = open_store(&config, *seed).await?;
            if *seed {
                Harness::new(Arc::clone(&store), config)?.seed(0).await?;
            }

            let transcript = LockInspector::new(store, Duration::from_millis(*step_delay_ms))
                .run(&script)
                .await;
            for line in transcript {
                println!("{line}");
            }
        }
    }
    Ok(())
}

/// Open the configured store; `fresh` recreates the PostgreSQL table.
async fn open_store(config: &DeliveryConfig, fresh: bool) -> anyhow::Result<Arc<dyn QueueStore>> {
    match config.store {
        StoreKind::Memory => Ok(Arc::new(InMemoryQueueStore::with_lock_wait_timeout(
            config.lock_wait_timeout(),
        ))),
        StoreKind::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("store = postgres requires database_url")?;
            // one connection per worker plus the seeder / driver
            let max_connections = u32::try_from(config.worker_count)
                .unwrap_or(u32::MAX)
                .saturating_add(2);
            let store =
                PgQueueStore::connect(url, max_connections, config.lock_wait_timeout()).await?;
            if fresh {
                store.reset_schema().await?;
            }
            Ok(Arc::new(store))
        }
    }
}
