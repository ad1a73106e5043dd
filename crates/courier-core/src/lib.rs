//! courier-core
//!
//! Concurrent order-delivery queue engine: a partitioned FIFO of pending
//! items drained by competing workers under row-level mutual exclusion.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, item, outcome, session, errors）
//! - **ports**: 抽象化レイヤー（QueueStore / StoreTx, RandomSource, SeederRole）
//! - **impls**: 実装（InMemoryQueueStore, PgQueueStore）
//! - **app**: アプリケーションロジック（seeder, strategies, worker_group, harness, lock_script）
//! - **config**: 設定の読み込みと検証
//! - **logging**: tracing subscriber の初期化

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod logging;
pub mod ports;
