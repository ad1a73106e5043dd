//! Errors - エラー型と分類
//!
//! パーティションが空、競合に負けた（lost race）はエラーではなく
//! `DistrictOutcome` として扱います。ここに来るのはセッション単位の失敗だけです。

use serde::Serialize;
use thiserror::Error;

use super::ids::WarehouseId;

/// ErrorKind はセッション失敗の分類
///
/// - Transient: 新しいセッションでやり直せば通る可能性がある
/// - Permanent: キューの状態かロジックが壊れている（リトライ無意味）
/// - Infrastructure: ストアへの接続・トランスポートの障害
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum CourierError {
    /// Insert collided with an existing key (overlapping id ranges, reseeding).
    #[error("duplicate key ({0})")]
    DuplicateKey(String),

    /// The store could not grant a lock within its lock-wait bound.
    #[error("lock wait timeout: {0}")]
    LockTimeout(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A lock or state-machine guarantee was broken.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("contention exhausted on warehouse {warehouse} after {restarts} restarts")]
    ContentionExhausted {
        warehouse: WarehouseId,
        restarts: u32,
    },

    /// A worker task panicked or was cancelled before reporting its counts.
    #[error("worker failed: {0}")]
    WorkerFailed(String),
}

impl CourierError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CourierError::LockTimeout(_) | CourierError::ContentionExhausted { .. } => {
                ErrorKind::Transient
            }
            CourierError::DuplicateKey(_) | CourierError::InvariantViolation(_) => {
                ErrorKind::Permanent
            }
            CourierError::StoreUnavailable(_) | CourierError::WorkerFailed(_) => {
                ErrorKind::Infrastructure
            }
        }
    }

    /// Can the harness simply start a fresh session?
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}
