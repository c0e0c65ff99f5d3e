//! Hybrid logical clock used to stamp membership views.
//!
//! A timestamp packs wall-clock milliseconds in the upper 48 bits and a
//! logical counter in the lower 16 bits, so timestamps compare as plain
//! integers and stay strictly increasing even if the wall clock steps back.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

const LOGICAL_BITS: u32 = 16;
const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

/// A hybrid logical clock timestamp.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct HlcTimestamp(u64);

impl HlcTimestamp {
    /// The zero timestamp; sorts before every real timestamp.
    pub const ZERO: HlcTimestamp = HlcTimestamp(0);

    /// Build a timestamp from its physical and logical parts.
    pub fn new(physical_millis: u64, logical: u16) -> Self {
        Self((physical_millis << LOGICAL_BITS) | u64::from(logical))
    }

    /// Wrap a raw packed value.
    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    /// Return the raw packed value.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Wall-clock component in unix milliseconds.
    pub fn physical_millis(self) -> u64 {
        self.0 >> LOGICAL_BITS
    }

    /// Logical counter component.
    pub fn logical(self) -> u16 {
        (self.0 & LOGICAL_MASK) as u16
    }
}

impl fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.physical_millis(), self.logical())
    }
}

impl fmt::Debug for HlcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HlcTimestamp({self})")
    }
}

/// Thread-safe hybrid logical clock.
///
/// [`tick`](Self::tick) never returns the same value twice and never goes
/// backward; [`witness`](Self::witness) folds in a timestamp observed from
/// another node so that subsequent ticks order after it.
#[derive(Debug, Default)]
pub struct HybridClock {
    last: AtomicU64,
}

impl HybridClock {
    /// Create a clock that has not issued any timestamp yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock whose next tick is strictly after `ts`.
    pub fn starting_after(ts: HlcTimestamp) -> Self {
        Self {
            last: AtomicU64::new(ts.as_u64()),
        }
    }

    /// Issue a new timestamp.
    pub fn tick(&self) -> HlcTimestamp {
        let wall = HlcTimestamp::new(wall_millis(), 0).as_u64();
        loop {
            let prev = self.last.load(Ordering::Acquire);
            let next = wall.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return HlcTimestamp(next),
                Err(_) => continue,
            }
        }
    }

    /// Observe a remote timestamp.
    pub fn witness(&self, remote: HlcTimestamp) {
        self.last.fetch_max(remote.as_u64(), Ordering::AcqRel);
    }

    /// Return the most recently issued or witnessed timestamp.
    pub fn last(&self) -> HlcTimestamp {
        HlcTimestamp(self.last.load(Ordering::Acquire))
    }
}

/// Current wall-clock time in unix milliseconds.
pub(crate) fn wall_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
