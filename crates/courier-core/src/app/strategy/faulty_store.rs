//! Test double: a one-row store whose transactions fail on demand.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::{CourierError, OrderId, Partition, PendingItem};
use crate::ports::{QueueStore, StoreTx};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Fault {
    /// `delete_item` removes nothing even right after a locking read.
    DeleteMisses,
    /// Reads fail with `StoreUnavailable`.
    ReadUnavailable,
    CommitUnavailable,
    /// Every delete misses and rollback fails with `StoreUnavailable`.
    RollbackUnavailable,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(super) struct Ledger {
    pub begun: usize,
    pub committed: usize,
    pub rolled_back: usize,
}

/// Every partition appears to hold order 2101.
#[derive(Clone)]
pub(super) struct FaultyStore {
    fault: Fault,
    ledger: Arc<Mutex<Ledger>>,
}

impl FaultyStore {
    pub fn new(fault: Fault) -> Self {
        Self {
            fault,
            ledger: Arc::default(),
        }
    }

    pub fn ledger(&self) -> Ledger {
        *self.ledger.lock()
    }
}

#[async_trait]
impl QueueStore for FaultyStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, CourierError> {
        self.ledger.lock().begun += 1;
        Ok(Box::new(FaultyTx {
            fault: self.fault,
            ledger: Arc::clone(&self.ledger),
        }))
    }
}

struct FaultyTx {
    fault: Fault,
    ledger: Arc<Mutex<Ledger>>,
}

impl FaultyTx {
    fn read(&self) -> Result<Option<OrderId>, CourierError> {
        match self.fault {
            Fault::ReadUnavailable => {
                Err(CourierError::StoreUnavailable("connection reset".into()))
            }
            _ => Ok(Some(OrderId::new(2101))),
        }
    }
}

#[async_trait]
impl StoreTx for FaultyTx {
    async fn min_pending_id(
        &mut self,
        _partition: Partition,
    ) -> Result<Option<OrderId>, CourierError> {
        self.read()
    }

    async fn min_pending_id_for_update(
        &mut self,
        _partition: Partition,
    ) -> Result<Option<OrderId>, CourierError> {
        self.read()
    }

    async fn delete_item(
        &mut self,
        _partition: Partition,
        _order_id: OrderId,
    ) -> Result<u64, CourierError> {
        match self.fault {
            Fault::DeleteMisses | Fault::RollbackUnavailable => Ok(0),
            _ => Ok(1),
        }
    }

    async fn insert_item(&mut self, _item: PendingItem) -> Result<(), CourierError> {
        Ok(())
    }

    async fn bulk_insert(&mut self, items: &[PendingItem]) -> Result<u64, CourierError> {
        Ok(items.len() as u64)
    }

    async fn commit(self: Box<Self>) -> Result<(), CourierError> {
        if self.fault == Fault::CommitUnavailable {
            return Err(CourierError::StoreUnavailable("commit lost".into()));
        }
        self.ledger.lock().committed += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), CourierError> {
        self.ledger.lock().rolled_back += 1;
        if self.fault == Fault::RollbackUnavailable {
            return Err(CourierError::StoreUnavailable("rollback lost".into()));
        }
        Ok(())
    }
}
