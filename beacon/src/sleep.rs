//! Poll interval with jitter.
//!
//! The interval and the jitter percentage are packed into one `AtomicU64`
//! (seconds in the high 56 bits, jitter in the low 8) so a `sleep` task
//! running concurrently with the poll loop can never be observed half-applied.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;

const JITTER_BITS: u32 = 8;
const MAX_SECS: u64 = u64::MAX >> JITTER_BITS;

#[derive(Debug)]
pub struct SleepCell {
    packed: AtomicU64,
}

fn pack(secs: u64, jitter_pct: u8) -> u64 {
    (secs.min(MAX_SECS) << JITTER_BITS) | u64::from(jitter_pct.min(100))
}

fn unpack(v: u64) -> (u64, u8) {
    #[allow(clippy::cast_possible_truncation)]
    let jitter = (v & 0xff) as u8;
    (v >> JITTER_BITS, jitter)
}

impl SleepCell {
    pub fn new(secs: u64, jitter_pct: u8) -> Self {
        Self {
            packed: AtomicU64::new(pack(secs, jitter_pct)),
        }
    }

    /// Current `(interval_secs, jitter_pct)`.
    pub fn get(&self) -> (u64, u8) {
        unpack(self.packed.load(Ordering::Acquire))
    }

    /// Replace the interval, and the jitter when given.
    pub fn set(&self, secs: u64, jitter_pct: Option<u8>) -> (u64, u8) {
        let prev = self
            .packed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                let (_, cur_jitter) = unpack(cur);
                Some(pack(secs, jitter_pct.unwrap_or(cur_jitter)))
            })
            .unwrap_or_else(|v| v);
        let (_, prev_jitter) = unpack(prev);
        (secs.min(MAX_SECS), jitter_pct.unwrap_or(prev_jitter).min(100))
    }

    /// Interval for the next sleep, shifted by up to ±jitter% at random.
    pub fn next_delay(&self) -> Duration {
        let (secs, jitter) = self.get();
        let base_ms = secs.saturating_mul(1000);
        if jitter == 0 || base_ms == 0 {
            return Duration::from_millis(base_ms);
        }
        let spread = base_ms / 100 * u64::from(jitter);
        let low = base_ms - spread;
        let high = base_ms.saturating_add(spread);
        Duration::from_millis(rand::thread_rng().gen_range(low..=high))
    }
}
