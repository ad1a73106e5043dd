//! App - アプリケーション層
//!
//! ports を組み合わせて配送のロジックを実装します。
//!
//! # 主要コンポーネント
//! - **Seeder**: 初期データの投入（イニシャライザのみ）
//! - **DeliveryStrategy**: LockingScan / OptimisticRetry
//! - **WorkerGroup**: P 個のワーカーがランダムな倉庫でセッションを回す
//! - **Harness**: seed → workers → 集計
//! - **LockInspector**: スクリプトでロックの挙動を観察

pub mod counts;
pub mod harness;
pub mod lock_script;
pub mod retry;
pub mod seeder;
pub mod strategy;
pub mod worker_group;

// 主要な型を再エクスポート
pub use self::counts::DeliveryCounts;
pub use self::harness::{Harness, RunReport};
pub use self::lock_script::{LockInspector, LockScript, ScriptError};
pub use self::retry::RetryPolicy;
pub use self::seeder::{SeedPlan, SeedReport, Seeder};
pub use self::strategy::{
    DeliveryContext, DeliveryStrategy, LockingScan, OptimisticRetry, build_strategy,
};
pub use self::worker_group::{ShutdownHandle, WorkerGroup, WorkerSettings};
