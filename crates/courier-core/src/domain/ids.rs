//! Domain identifiers (strongly-typed keys).
//!
//! new_orders の主キーは `(warehouse, district, order)` の 3 つの整数です。
//! 3 つとも `i32` なので、そのままだと引数の順番を取り違えても気づけません。
//!
//! ## Phantom Type パターン
//! `Key<T>` というジェネリック型で共通実装を提供しつつ、
//! `T` はコンパイル時だけ使うマーカー型にしています。
//! これで `WarehouseId` と `DistrictId` は混同できません。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;

/// KeyMarker は各キー型のマーカー trait
///
/// エラーメッセージやログで使う名前を提供します。
pub trait KeyMarker: Send + Sync + 'static {
    fn name() -> &'static str;
}

/// 型付きの整数キー
///
/// # 例
/// ```ignore
/// let w = WarehouseId::new(1);
/// let d = DistrictId::new(1);
/// // w と d は異なる型なので、混同できない
/// ```
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key<T: KeyMarker> {
    value: i32,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: KeyMarker> Key<T> {
    pub const fn new(value: i32) -> Self {
        Self {
            value,
            _marker: PhantomData,
        }
    }

    pub const fn get(self) -> i32 {
        self.value
    }

    /// 次のキー（オーバーフロー時は None）
    pub fn next(self) -> Option<Self> {
        self.value.checked_add(1).map(Self::new)
    }

    /// `delta` だけずらしたキー（オーバーフロー時は None）
    pub fn offset(self, delta: i32) -> Option<Self> {
        self.value.checked_add(delta).map(Self::new)
    }
}

impl<T: KeyMarker> From<i32> for Key<T> {
    fn from(value: i32) -> Self {
        Self::new(value)
    }
}

impl<T: KeyMarker> fmt::Display for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

// ========================================
// マーカー型の定義
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Warehouse {}

impl KeyMarker for Warehouse {
    fn name() -> &'static str {
        "warehouse"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum District {}

impl KeyMarker for District {
    fn name() -> &'static str {
        "district"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Order {}

impl KeyMarker for Order {
    fn name() -> &'static str {
        "order"
    }
}

// ========================================
// Type Alias
// ========================================

/// Partition key (1..=W).
pub type WarehouseId = Key<Warehouse>;

/// Partition sub-key (1..=partition_count).
pub type DistrictId = Key<District>;

/// Ordering key within a partition.
pub type OrderId = Key<Order>;

impl DistrictId {
    pub const FIRST: DistrictId = DistrictId::new(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_keep_their_value() {
        let w = WarehouseId::new(3);
        let d = DistrictId::new(7);
        let o = OrderId::new(2101);

        assert_eq!(w.get(), 3);
        assert_eq!(d.get(), 7);
        assert_eq!(o.to_string(), "2101");
        assert_eq!(Warehouse::name(), "warehouse");

        // let _: WarehouseId = d; // <- does not compile
    }

    #[test]
    fn offset_and_next_detect_overflow() {
        assert_eq!(OrderId::new(2101).offset(900), Some(OrderId::new(3001)));
        assert_eq!(OrderId::new(i32::MAX).offset(1), None);
        assert_eq!(DistrictId::FIRST.next(), Some(DistrictId::new(2)));
        assert_eq!(DistrictId::new(i32::MAX).next(), None);
    }

    #[test]
    fn keys_serialize_as_plain_integers() {
        let s = serde_json::to_string(&OrderId::new(42)).unwrap();
        assert_eq!(s, "42");
        let back: OrderId = serde_json::from_str(&s).unwrap();
        assert_eq!(back, OrderId::new(42));
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<OrderId>(), size_of::<i32>());
    }
}
