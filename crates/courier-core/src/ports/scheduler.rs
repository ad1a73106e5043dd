//! Scheduler port - ワーカーの識別と乱数の抽象化
//!
//! 「自分は何番目のワーカーか」「一様乱数」は外部のスケジューラが与えるものです。
//! テスト容易性のために trait にしています。

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Identity 0 as handed out by the scheduler.
pub const INITIALIZER_IDENTITY: u32 = 0;

/// Role passed explicitly to the seeder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeederRole {
    /// The one designated worker that populates the store.
    Initializer,
    /// Everybody else; seeding is a no-op.
    Follower,
}

impl SeederRole {
    pub fn for_identity(identity: u32) -> Self {
        if identity == INITIALIZER_IDENTITY {
            SeederRole::Initializer
        } else {
            SeederRole::Follower
        }
    }
}

/// RandomSource は一様乱数を提供
///
/// # Thread Safety
/// - `Send + Sync` を要求（複数ワーカーで共有する）
pub trait RandomSource: Send + Sync {
    /// Uniform integer in `lo..=hi`.
    fn random_int(&self, lo: i32, hi: i32) -> i32;
}

/// Thread-local RNG（本番用）
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn random_int(&self, lo: i32, hi: i32) -> i32 {
        rand::thread_rng().gen_range(lo..=hi)
    }
}

/// Seeded RNG（テスト用、決定的）
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn random_int(&self, lo: i32, hi: i32) -> i32 {
        self.rng.lock().gen_range(lo..=hi)
    }
}
