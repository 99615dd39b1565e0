use crate::xorshift;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::OnceLock;

/// A counter cell that has a cache line to itself.
#[derive(Debug, Default)]
#[repr(align(64))]
struct Cell(AtomicIsize);

/// A striped adder: an approximate, low-contention counter.
///
/// Updates go to `base` until two threads collide on it. From then on each thread adds into
/// one of a fixed array of cells, chosen by its xorshift probe, and moves to another cell
/// whenever it collides again. `sum` folds the base and all cells, so it only reflects some
/// recent state while updates are in flight, and may transiently be negative.
#[derive(Debug, Default)]
pub(crate) struct StripedCounter {
    base: AtomicIsize,
    cells: OnceLock<Box<[Cell]>>,
}

impl StripedCounter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn increment(&self) {
        self.add(1);
    }

    pub(crate) fn add(&self, delta: isize) {
        if delta == 0 {
            return;
        }

        let cells = match self.cells.get() {
            Some(cells) => cells,
            None => {
                let base = self.base.load(Ordering::SeqCst);
                if self
                    .base
                    .compare_exchange(base, base + delta, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                // first contention: spread out from now on
                self.cells.get_or_init(|| {
                    let stripes = crate::map::num_cpus().next_power_of_two().max(2);
                    (0..stripes).map(|_| Cell::default()).collect()
                })
            }
        };

        let mask = cells.len() - 1;
        let mut probe = xorshift::current();
        loop {
            let cell = &cells[probe as usize & mask].0;
            let current = cell.load(Ordering::SeqCst);
            if cell
                .compare_exchange_weak(
                    current,
                    current + delta,
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return;
            }
            // another thread is on this cell; rehash to a different one
            probe = xorshift::advance();
        }
    }

    pub(crate) fn sum(&self) -> isize {
        let base = self.base.load(Ordering::SeqCst);
        match self.cells.get() {
            Some(cells) => cells
                .iter()
                .fold(base, |sum, cell| sum + cell.0.load(Ordering::SeqCst)),
            None => base,
        }
    }
}
