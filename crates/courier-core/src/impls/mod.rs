//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryQueueStore**: 開発・テスト用のストア（行ロック表つき）
//! - **PgQueueStore**: PostgreSQL 上の new_orders（feature = "postgres"）

pub mod inmem_store;
#[cfg(feature = "postgres")]
pub mod pg_store;

pub use self::inmem_store::InMemoryQueueStore;
#[cfg(feature = "postgres")]
pub use self::pg_store::PgQueueStore;
