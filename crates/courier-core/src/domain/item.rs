//! Pending items and the partitions they live in.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{DistrictId, OrderId, WarehouseId};

/// A `(warehouse, district)` pair: one independent FIFO sub-queue.
///
/// A partition may be empty at any time; that is a normal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Partition {
    pub warehouse_id: WarehouseId,
    pub district_id: DistrictId,
}

impl Partition {
    pub fn new(warehouse_id: WarehouseId, district_id: DistrictId) -> Self {
        Self {
            warehouse_id,
            district_id,
        }
    }

    pub fn item(self, order_id: OrderId) -> PendingItem {
        PendingItem::new(self, order_id)
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w={}, d={}", self.warehouse_id, self.district_id)
    }
}

/// The unit of queued work (one `new_orders` row).
///
/// Within a partition no two items share an `order_id`, and items drain in
/// ascending `order_id` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PendingItem {
    pub warehouse_id: WarehouseId,
    pub district_id: DistrictId,
    pub order_id: OrderId,
}

impl PendingItem {
    pub fn new(partition: Partition, order_id: OrderId) -> Self {
        Self {
            warehouse_id: partition.warehouse_id,
            district_id: partition.district_id,
            order_id,
        }
    }

    pub fn partition(&self) -> Partition {
        Partition::new(self.warehouse_id, self.district_id)
    }
}

impl fmt::Display for PendingItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "w={}, d={}, o={}",
            self.warehouse_id, self.district_id, self.order_id
        )
    }
}
