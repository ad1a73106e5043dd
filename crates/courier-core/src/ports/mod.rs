//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! トランザクショナルなストアとスケジューラは外部から与えられる能力で、
//! コアはこの trait 越しにしか触りません。

pub mod queue_store;
pub mod scheduler;

pub use self::queue_store::{QueueStore, StoreTx};
pub use self::scheduler::{RandomSource, SeededRandom, SeederRole, ThreadRandom};
