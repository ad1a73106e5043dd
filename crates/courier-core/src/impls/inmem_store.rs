//! InMemoryQueueStore - 開発・テスト用のトランザクショナルなストア
//!
//! # 学習ポイント
//! - parking_lot::Mutex（await を跨がない短いクリティカルセクション）
//! - tokio::sync::Notify によるロック待ち（notify_waiters で全員を起こして再判定）
//! - Drop での暗黙 rollback

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use crate::domain::{CourierError, OrderId, Partition, PendingItem};
use crate::ports::{QueueStore, StoreTx};

type TxId = u64;

/// What a transaction can hold exclusively.
///
/// `Partition` is the intent lock taken by the locking read; `Row` is taken
/// by every write and by the locking read for the row it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LockKey {
    Partition(Partition),
    Row(Partition, OrderId),
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockKey::Partition(p) => write!(f, "partition({p})"),
            LockKey::Row(p, o) => write!(f, "row({p}, o={o})"),
        }
    }
}

#[derive(Default)]
struct StoreState {
    /// Committed rows, ordered per partition.
    committed: BTreeMap<Partition, BTreeSet<OrderId>>,

    /// Exclusive locks and their owners.
    locks: HashMap<LockKey, TxId>,

    next_tx_id: TxId,
}

impl StoreState {
    fn contains(&self, partition: Partition, order_id: OrderId) -> bool {
        self.committed
            .get(&partition)
            .is_some_and(|ids| ids.contains(&order_id))
    }
}

struct Shared {
    state: Mutex<StoreState>,
    released: Notify,
    lock_wait_timeout: Duration,
}

/// In-memory queue store.
///
/// # 実装詳細
/// - committed: `BTreeMap<Partition, BTreeSet<OrderId>>`
/// - 未コミットの書き込みはトランザクション側に持ち、commit 時に反映
/// - ロック表は `HashMap<LockKey, TxId>`、待ちは `lock_wait_timeout` まで
#[derive(Clone)]
pub struct InMemoryQueueStore {
    shared: Arc<Shared>,
}

impl InMemoryQueueStore {
    pub const DEFAULT_LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(50);

    pub fn new() -> Self {
        Self::with_lock_wait_timeout(Self::DEFAULT_LOCK_WAIT_TIMEOUT)
    }

    pub fn with_lock_wait_timeout(lock_wait_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(StoreState {
                    next_tx_id: 1,
                    ..StoreState::default()
                }),
                released: Notify::new(),
                lock_wait_timeout,
            }),
        }
    }

    /// Committed order ids of one partition, ascending.
    pub fn pending_ids(&self, partition: Partition) -> Vec<OrderId> {
        let state = self.shared.state.lock();
        state
            .committed
            .get(&partition)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of committed rows across all partitions.
    pub fn len(&self) -> usize {
        let state = self.shared.state.lock();
        state.committed.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every committed row (the in-memory equivalent of recreating the table).
    ///
    /// Locks held by open transactions are left alone.
    pub fn reset(&self) {
        self.shared.state.lock().committed.clear();
    }
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, CourierError> {
        let id = {
            let mut state = self.shared.state.lock();
            let id = state.next_tx_id;
            state.next_tx_id += 1;
            id
        };
        trace!(tx = id, "begin");
        Ok(Box::new(InMemoryTx {
            id,
            shared: Arc::clone(&self.shared),
            inserted: BTreeMap::new(),
            deleted: HashSet::new(),
            held: Vec::new(),
            finished: false,
        }))
    }
}

/// Transaction handle for InMemoryQueueStore.
struct InMemoryTx {
    id: TxId,
    shared: Arc<Shared>,

    /// Own uncommitted inserts (visible only to this transaction).
    inserted: BTreeMap<Partition, BTreeSet<OrderId>>,

    /// Own uncommitted deletes of committed rows.
    deleted: HashSet<(Partition, OrderId)>,

    held: Vec<LockKey>,
    finished: bool,
}

impl InMemoryTx {
    /// Committed state overlaid with this transaction's writes.
    fn visible_min(&self, state: &StoreState, partition: Partition) -> Option<OrderId> {
        let committed = state.committed.get(&partition).and_then(|ids| {
            ids.iter()
                .copied()
                .find(|o| !self.deleted.contains(&(partition, *o)))
        });
        let own = self
            .inserted
            .get(&partition)
            .and_then(|ids| ids.first().copied());
        committed.into_iter().chain(own).min()
    }

    fn is_visible(&self, state: &StoreState, partition: Partition, order_id: OrderId) -> bool {
        let own = self
            .inserted
            .get(&partition)
            .is_some_and(|ids| ids.contains(&order_id));
        own || (state.contains(partition, order_id)
            && !self.deleted.contains(&(partition, order_id)))
    }

    /// Take `key` exclusively, waiting for its holder to finish.
    async fn acquire(&mut self, key: LockKey) -> Result<(), CourierError> {
        let shared = Arc::clone(&self.shared);
        let deadline = Instant::now() + shared.lock_wait_timeout;

        loop {
            let released = {
                let mut state = shared.state.lock();
                let owner = state.locks.get(&key).copied();
                match owner {
                    Some(owner) if owner == self.id => return Ok(()),
                    Some(owner) => {
                        trace!(tx = self.id, owner, %key, "lock wait");
                        // registered before the state lock is released, so a
                        // release in between is not missed
                        shared.released.notified()
                    }
                    None => {
                        state.locks.insert(key, self.id);
                        self.held.push(key);
                        return Ok(());
                    }
                }
            };

            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Err(CourierError::LockTimeout(format!(
                    "{key} not granted within {}ms",
                    shared.lock_wait_timeout.as_millis()
                )));
            }
        }
    }

    fn ensure_open(&self) -> Result<(), CourierError> {
        if self.finished {
            return Err(CourierError::InvariantViolation(format!(
                "transaction {} already finished",
                self.id
            )));
        }
        Ok(())
    }

    /// Apply (or discard) writes and release every lock. Idempotent.
    fn finish(&mut self, apply: bool) {
        if self.finished {
            return;
        }
        self.finished = true;

        {
            let mut state = self.shared.state.lock();
            if apply {
                for (partition, order_id) in self.deleted.drain() {
                    if let Some(ids) = state.committed.get_mut(&partition) {
                        ids.remove(&order_id);
                    }
                }
                for (partition, ids) in std::mem::take(&mut self.inserted) {
                    state.committed.entry(partition).or_default().extend(ids);
                }
            }
            for key in self.held.drain(..) {
                if state.locks.get(&key) == Some(&self.id) {
                    state.locks.remove(&key);
                }
            }
        }

        trace!(tx = self.id, apply, "released");
        self.shared.released.notify_waiters();
    }
}

impl Drop for InMemoryTx {
    fn drop(&mut self) {
        self.finish(false);
    }
}

#[async_trait]
impl StoreTx for InMemoryTx {
    async fn min_pending_id(
        &mut self,
        partition: Partition,
    ) -> Result<Option<OrderId>, CourierError> {
        self.ensure_open()?;
        let state = self.shared.state.lock();
        Ok(self.visible_min(&state, partition))
    }

    async fn min_pending_id_for_update(
        &mut self,
        partition: Partition,
    ) -> Result<Option<OrderId>, CourierError> {
        self.ensure_open()?;
        self.acquire(LockKey::Partition(partition)).await?;

        loop {
            let candidate = {
                let state = self.shared.state.lock();
                self.visible_min(&state, partition)
            };
            let Some(order_id) = candidate else {
                return Ok(None);
            };

            // the row may be claimed by a writer that does not hold the partition lock
            self.acquire(LockKey::Row(partition, order_id)).await?;

            let visible = {
                let state = self.shared.state.lock();
                self.is_visible(&state, partition, order_id)
            };
            if visible {
                return Ok(Some(order_id));
            }
        }
    }

    async fn delete_item(
        &mut self,
        partition: Partition,
        order_id: OrderId,
    ) -> Result<u64, CourierError> {
        self.ensure_open()?;
        self.acquire(LockKey::Row(partition, order_id)).await?;

        let state = self.shared.state.lock();
        if let Some(ids) = self.inserted.get_mut(&partition)
            && ids.remove(&order_id)
        {
            return Ok(1);
        }
        if state.contains(partition, order_id) && self.deleted.insert((partition, order_id)) {
            return Ok(1);
        }
        Ok(0)
    }

    async fn insert_item(&mut self, item: PendingItem) -> Result<(), CourierError> {
        self.ensure_open()?;
        let partition = item.partition();
        self.acquire(LockKey::Row(partition, item.order_id)).await?;

        let state = self.shared.state.lock();
        if self.is_visible(&state, partition, item.order_id) {
            return Err(CourierError::DuplicateKey(item.to_string()));
        }
        drop(state);

        // re-inserting a row this transaction deleted restores the committed row
        if !self.deleted.remove(&(partition, item.order_id)) {
            self.inserted
                .entry(partition)
                .or_default()
                .insert(item.order_id);
        }
        Ok(())
    }

    async fn bulk_insert(&mut self, items: &[PendingItem]) -> Result<u64, CourierError> {
        self.ensure_open()?;

        let mut seen = HashSet::with_capacity(items.len());
        for item in items {
            if !seen.insert(*item) {
                return Err(CourierError::DuplicateKey(item.to_string()));
            }
        }

        for item in items {
            self.acquire(LockKey::Row(item.partition(), item.order_id))
                .await?;
        }

        {
            let state = self.shared.state.lock();
            if let Some(dup) = items
                .iter()
                .find(|item| self.is_visible(&state, item.partition(), item.order_id))
            {
                return Err(CourierError::DuplicateKey(dup.to_string()));
            }
        }

        for item in items {
            let partition = item.partition();
            if !self.deleted.remove(&(partition, item.order_id)) {
                self.inserted
                    .entry(partition)
                    .or_default()
                    .insert(item.order_id);
            }
        }
        Ok(items.len() as u64)
    }

    async fn commit(self: Box<Self>) -> Result<(), CourierError> {
        let mut tx = self;
        tx.ensure_open()?;
        tx.finish(true);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), CourierError> {
        let mut tx = self;
        tx.finish(false);
        Ok(())
    }
}
