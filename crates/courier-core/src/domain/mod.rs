//! Domain model (keys, items, outcomes, session state machine, errors).
//!
//! ストアやワーカーの実装には依存しません。

pub mod errors;
pub mod ids;
pub mod item;
pub mod outcome;
pub mod session;

pub use self::errors::{CourierError, ErrorKind};
pub use self::ids::{DistrictId, OrderId, WarehouseId};
pub use self::item::{Partition, PendingItem};
pub use self::outcome::{DistrictOutcome, SessionReport, StrategyKind};
pub use self::session::{Session, SessionEvent, SessionState};
