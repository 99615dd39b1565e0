//! Cheap per-thread pseudo-randomness.
//!
//! Threads use this to pick a stripe of the size counter and to jitter their spinning while
//! waiting for a bin lock. It only needs to decorrelate threads from one another.

use std::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering};

/// Distance between the seeds handed to successive threads (2^32 divided by the golden ratio).
const SEED_INCREMENT: u32 = 0x9e37_79b9;

static SEEDER: AtomicU32 = AtomicU32::new(0);

thread_local! {
    static STATE: Cell<u32> = Cell::new(seed());
}

fn seed() -> u32 {
    let seed = SEEDER
        .fetch_add(SEED_INCREMENT, Ordering::Relaxed)
        .wrapping_add(SEED_INCREMENT);
    // xorshift never leaves zero
    if seed == 0 {
        1
    } else {
        seed
    }
}

/// One step of Marsaglia's 32-bit xorshift.
#[inline]
pub(crate) fn xorshift(mut x: u32) -> u32 {
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    x
}

/// The calling thread's current value, without advancing it.
pub(crate) fn current() -> u32 {
    STATE.try_with(Cell::get).unwrap_or_else(|_| seed())
}

/// Advances the calling thread's state and returns the new value.
pub(crate) fn advance() -> u32 {
    STATE
        .try_with(|state| {
            let next = xorshift(state.get());
            state.set(next);
            next
        })
        .unwrap_or_else(|_| xorshift(seed()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn never_zero() {
        let mut x = 1;
        for _ in 0..10_000 {
            x = xorshift(x);
            assert_ne!(x, 0);
        }
    }

    #[test]
    fn advance_moves_current() {
        let before = current();
        let after = advance();
        assert_ne!(before, after);
        assert_eq!(after, current());
    }

    #[test]
    fn threads_start_apart() {
        let seeds: HashSet<u32> = (0..8)
            .map(|_| thread::spawn(current))
            .collect::<Vec<_>>()
            .into_iter()
            .map(|t| t.join().unwrap())
            .collect();
        assert_eq!(seeds.len(), 8);
    }
}
