use crate::counter::StripedCounter;
use crate::iter::*;
use crate::node::*;
use crate::raw::*;
use crate::reclaim::{self, Atomic, Collector, Guard, Linked, RetireShared, Shared};
use std::borrow::Borrow;
use std::error::Error;
use std::fmt::{self, Debug, Display, Formatter};
use std::hash::{BuildHasher, Hash, Hasher};
use std::iter::FromIterator;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::Once;

const ISIZE_BITS: usize = core::mem::size_of::<isize>() * 8;

/// The largest possible table capacity.
///
/// Growth stops once a table has this many bins.
pub(crate) const MAXIMUM_CAPACITY: usize = 1 << 30;

/// The default initial table capacity. Must be a power of 2.
const DEFAULT_CAPACITY: usize = 16;

/// Tables with at most this many bins check whether they need to grow after every insertion.
///
/// Larger tables only check when an insertion lands in a bin that already holds more than
/// one entry, or when a bin turns out to be contended.
const EAGER_RESIZE_CHECK_LIMIT: usize = 64;

/// Minimum number of bins a resize helper claims at a time. Ranges are subdivided to allow
/// multiple resizer threads, and this lower bound keeps them from contending too much on
/// `transfer_index`. The value should be at least `DEFAULT_CAPACITY`.
const MIN_TRANSFER_STRIDE: isize = 16;

/// How many locked bins a resize helper sets aside to come back to later, before it starts
/// blocking on bin locks instead.
const TRANSFER_BUFFER_SIZE: usize = 32;

/// The number of bits used for the generation stamp in `size_ctl`.
const RESIZE_STAMP_BITS: usize = ISIZE_BITS / 2;

/// The maximum number of threads that can help resize.
const MAX_RESIZERS: isize = (1 << (ISIZE_BITS - RESIZE_STAMP_BITS)) - 1;

/// The bit shift for recording the size stamp in `size_ctl`.
const RESIZE_STAMP_SHIFT: usize = ISIZE_BITS - RESIZE_STAMP_BITS;

static NCPU_INITIALIZER: Once = Once::new();
static NCPU: AtomicUsize = AtomicUsize::new(0);

macro_rules! load_factor {
    ($n: expr) => {
        // ¾ n = n - n/4 = n - (n >> 2)
        $n - ($n >> 2)
    };
}

/// A concurrent hash table with per-bin locks.
///
/// Reads never lock. Writers lock only the bin they modify, by flipping a status bit on the
/// first entry of that bin, so writers to different bins never wait for each other. When the
/// table fills up, all threads that notice cooperate in moving its bins to a table twice the
/// size, while readers and writers keep going.
///
/// References into the map are tied to a [`Guard`], acquired through [`HashMap::guard`] or
/// implicitly through [`HashMap::pin`]. For more information, see the [notes in the
/// crate-level documentation].
///
/// [notes in the crate-level documentation]: index.html#a-note-on-guard-and-memory-use
pub struct HashMap<K, V, S = crate::DefaultHashBuilder> {
    /// The array of bins. Lazily initialized upon first insertion.
    /// Size is always a power of two. Accessed directly by iterators.
    table: Atomic<Table<K, V>>,

    /// The next table index (plus one) to split while resizing.
    transfer_index: AtomicIsize,

    /// Net number of insertions minus removals.
    count: StripedCounter,

    /// Table initialization and resizing control. When negative, the table is being
    /// initialized (-1) or resized, in which case the high bits hold the resize stamp of the
    /// table size and the low bits one more than the number of active resizing threads.
    /// Otherwise, when table is null, holds the initial table size to use upon creation, or
    /// 0 for default. After initialization, holds the element count above which the table
    /// grows.
    size_ctl: AtomicIsize,

    /// Collector that all `Guard` references used for operations on this map must be tied to.
    ///
    /// A guard from some other collector does not keep this map's garbage alive, so it could
    /// be used to observe freed memory. Every guard passed in is checked against this one.
    collector: Collector,

    build_hasher: S,
}

enum PutResult<'a, T> {
    Inserted { new: &'a T },
    Replaced { old: &'a T },
    Exists { current: &'a T, not_inserted: T },
}

impl<'a, T> PutResult<'a, T> {
    fn before(&self) -> Option<&'a T> {
        match *self {
            PutResult::Inserted { .. } => None,
            PutResult::Replaced { old } => Some(old),
            PutResult::Exists { current, .. } => Some(current),
        }
    }
}

/// What to do with the current mapping of a key.
enum Remap<V> {
    Keep,
    Replace(V),
    Remove,
}

/// The outcome of [`HashMap::replace_node`].
enum Remapped<'g, K, V> {
    Absent,
    Kept,
    Replaced { old: &'g V, new: &'g V },
    Removed { key: &'g K, old: &'g V },
}

/// The error type for the [`HashMap::try_insert`] method.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TryInsertError<'a, V> {
    /// A reference to the current value mapped to the key.
    pub current: &'a V,
    /// The value that [`HashMap::try_insert`] failed to insert.
    pub not_inserted: V,
}

impl<'a, V> Display for TryInsertError<'a, V>
where
    V: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Insert of \"{:?}\" failed as key was already present with value \"{:?}\"",
            self.not_inserted, self.current
        )
    }
}

impl<'a, V> Error for TryInsertError<'a, V>
where
    V: Debug,
{
    #[inline]
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        None
    }
}

/// The error type for the [`HashMap::try_reserve`] method.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TryReserveError {
    /// The number of entries asked for does not fit in a `usize`.
    CapacityOverflow,
    /// The number of entries asked for is more than the largest table can hold.
    MaximumCapacityExceeded {
        /// The number of entries that space was asked for.
        requested: usize,
        /// The number of entries the largest table holds before it would have to grow.
        maximum: usize,
    },
}

impl Display for TryReserveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            TryReserveError::CapacityOverflow => {
                write!(f, "requested capacity overflowed usize")
            }
            TryReserveError::MaximumCapacityExceeded { requested, maximum } => write!(
                f,
                "requested room for {} entries, but the map holds at most {}",
                requested, maximum
            ),
        }
    }
}

impl Error for TryReserveError {}

/// A locked placeholder node in a bin that was empty.
///
/// Other writers that reach the bin wait for the lock. Readers see a node without a value,
/// and so treat the key as absent. Dropping a reservation that was never filled takes the
/// placeholder back out of the bin.
struct Reservation<'g, 'c, K, V> {
    table: &'g Table<K, V>,
    index: usize,
    entry: Shared<'g, BinEntry<K, V>>,
    node: &'g Node<K, V>,
    lock: Option<BinLock<'g, K, V>>,
    guard: &'g Guard<'c>,
}

impl<'g, K, V> Reservation<'g, '_, K, V> {
    fn fill(mut self, value: Shared<'g, V>) -> &'g V {
        self.node.value.store(value, Ordering::SeqCst);
        drop(self.lock.take());
        // safety: we just published value, and our guard keeps it alive
        unsafe { &**value.deref() }
    }
}

impl<K, V> Drop for Reservation<'_, '_, K, V> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            self.table.store_bin(self.index, Shared::null());
            drop(lock);
            // safety: the placeholder is no longer in the bin, and it never had a value
            unsafe { self.guard.retire_shared(self.entry) };
        }
    }
}

// ===
// the following methods only see Ks and Vs if there have been inserts.
// modifications to the map are all guarded by thread-safety bounds (Send + Sync + 'static).
// but _these_ methods do not need to be, since they will never introduce keys or values, only give
// out ones that have already been inserted (which implies they must be thread-safe).
// ===

impl<K, V> HashMap<K, V, crate::DefaultHashBuilder> {
    /// Creates an empty `HashMap`.
    ///
    /// The hash map is initially created with a capacity of 0, so it will not allocate until it
    /// is first inserted into. The first table has 16 bins.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    /// let map: HashMap<&str, i32> = HashMap::new();
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty `HashMap` with the specified capacity.
    ///
    /// The table is sized so that `capacity` entries fit without growing it, given an even
    /// spread of hashes. It is still only allocated upon the first insertion.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    /// let map: HashMap<&str, i32> = HashMap::with_capacity(10);
    /// ```
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, crate::DefaultHashBuilder::default())
    }

    /// Creates an empty `HashMap` sized for `capacity` entries at the given `load_factor`.
    ///
    /// The load factor only shapes the size of the first table, which gets at least
    /// `1 + capacity / load_factor` bins. Once allocated, tables always grow when they are
    /// three quarters full.
    ///
    /// # Panics
    ///
    /// Panics if `load_factor` is not a positive, finite number.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    /// let map: HashMap<u64, u64> = HashMap::with_capacity_and_load_factor(100, 0.5);
    /// map.pin().insert(1, 2);
    /// ```
    pub fn with_capacity_and_load_factor(capacity: usize, load_factor: f64) -> Self {
        assert!(
            load_factor.is_finite() && load_factor > 0.0,
            "load factor must be a positive, finite number, not {}",
            load_factor
        );
        let map = Self::with_hasher(crate::DefaultHashBuilder::default());
        // float-to-int casts saturate
        let size = (1.0 + capacity as f64 / load_factor) as usize;
        map.size_ctl
            .store(table_size_for(size) as isize, Ordering::SeqCst);
        map
    }
}

impl<K, V, S> Default for HashMap<K, V, S>
where
    S: Default,
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, S> HashMap<K, V, S> {
    /// Creates an empty map which will use `hash_builder` to hash keys.
    ///
    /// The created map has the default initial capacity.
    ///
    /// Warning: `hash_builder` is normally randomly generated, and is designed to
    /// allow the map to be resistant to attacks that cause many collisions and
    /// very poor performance. Setting it manually using this
    /// function can expose a DoS attack vector.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::{HashMap, DefaultHashBuilder};
    ///
    /// let map = HashMap::with_hasher(DefaultHashBuilder::default());
    /// map.pin().insert(1, 2);
    /// ```
    pub fn with_hasher(hash_builder: S) -> Self {
        Self {
            table: Atomic::null(),
            transfer_index: AtomicIsize::new(0),
            count: StripedCounter::new(),
            size_ctl: AtomicIsize::new(0),
            build_hasher: hash_builder,
            collector: Collector::new(),
        }
    }

    /// Creates an empty map with the specified `capacity`, using `hash_builder` to hash the keys.
    ///
    /// The map will be sized to accommodate `capacity` elements with a low chance of reallocating
    /// (assuming uniformly distributed hashes). If `capacity` is 0, this is equivalent to
    /// [`HashMap::with_hasher`].
    ///
    /// Warning: `hash_builder` is normally randomly generated, and is designed to allow the map
    /// to be resistant to attacks that cause many collisions and very poor performance.
    /// Setting it manually using this function can expose a DoS attack vector.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    /// use std::collections::hash_map::RandomState;
    ///
    /// let s = RandomState::new();
    /// let map = HashMap::with_capacity_and_hasher(10, s);
    /// map.pin().insert(1, 2);
    /// ```
    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> Self {
        let map = Self::with_hasher(hash_builder);
        if capacity != 0 {
            // the table stays unallocated, size_ctl tells init_table how large to make it
            map.size_ctl
                .store(requested_capacity(capacity) as isize, Ordering::SeqCst);
        }
        map
    }

    /// Pin a `Guard` for use with this map.
    ///
    /// Keep in mind that for as long as you hold onto this `Guard`, you are preventing the
    /// collection of garbage generated by the map.
    pub fn guard(&self) -> Guard<'_> {
        self.collector.enter()
    }

    #[inline]
    pub(crate) fn check_guard(&self, guard: &Guard<'_>) {
        // guard.collector() is `None` for unprotected guards
        if let Some(c) = guard.collector() {
            assert!(
                Collector::ptr_eq(c, &self.collector),
                "guard was not created by this map's collector"
            );
        }
    }

    /// Returns the number of entries in the map.
    ///
    /// While other threads are modifying the map, this reflects some recent state.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let map = HashMap::new();
    ///
    /// map.pin().insert(1, "a");
    /// map.pin().insert(2, "b");
    /// assert!(map.pin().len() == 2);
    /// ```
    pub fn len(&self) -> usize {
        // the striped sum can briefly dip below zero when a removal is counted before the
        // insertion it undoes
        let n = self.count.sum();
        if n < 0 {
            0
        } else {
            n as usize
        }
    }

    /// Returns `true` if the map is empty. Otherwise returns `false`.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let map = HashMap::new();
    /// assert!(map.pin().is_empty());
    /// map.pin().insert("a", 1);
    /// assert!(!map.pin().is_empty());
    /// ```
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    /// Returns the capacity of the map.
    fn capacity(&self, guard: &Guard<'_>) -> usize {
        self.check_guard(guard);
        let table = self.table.load(Ordering::Relaxed, guard);

        if table.is_null() {
            0
        } else {
            // Safety: we loaded `table` under the `guard`,
            // so it must still be valid here
            unsafe { table.deref() }.len()
        }
    }

    /// Returns the stamp bits for resizing a table of size n.
    /// Must be negative when shifted left by `RESIZE_STAMP_SHIFT`.
    fn resize_stamp(n: usize) -> isize {
        n.leading_zeros() as isize | (1_isize << (RESIZE_STAMP_BITS - 1))
    }

    /// An iterator visiting all key-value pairs in arbitrary order.
    ///
    /// The iterator element type is `(&'g K, &'g V)`. Entries added or removed while
    /// iterating may or may not be seen.
    pub fn iter<'g>(&'g self, guard: &'g Guard<'_>) -> Iter<'g, K, V> {
        self.check_guard(guard);
        let table = self.table.load(Ordering::SeqCst, guard);
        let node_iter = NodeIter::new(table, guard);
        Iter { node_iter, guard }
    }

    /// An iterator visiting all keys in arbitrary order.
    ///
    /// The iterator element type is `&'g K`.
    pub fn keys<'g>(&'g self, guard: &'g Guard<'_>) -> Keys<'g, K, V> {
        self.check_guard(guard);
        let table = self.table.load(Ordering::SeqCst, guard);
        let node_iter = NodeIter::new(table, guard);
        Keys { node_iter, guard }
    }

    /// An iterator visiting all values in arbitrary order.
    ///
    /// The iterator element type is `&'g V`.
    pub fn values<'g>(&'g self, guard: &'g Guard<'_>) -> Values<'g, K, V> {
        self.check_guard(guard);
        let table = self.table.load(Ordering::SeqCst, guard);
        let node_iter = NodeIter::new(table, guard);
        Values { node_iter, guard }
    }

    /// Calls `f` with every key-value pair in the map.
    ///
    /// Like [`HashMap::iter`], this is safe to use while other threads modify the map, but
    /// is not a consistent snapshot of it.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let map = HashMap::new();
    /// let guard = map.guard();
    /// map.insert(1, 10, &guard);
    /// map.insert(2, 20, &guard);
    ///
    /// let mut sum = 0;
    /// map.for_each(|_, v| sum += v, &guard);
    /// assert_eq!(sum, 30);
    /// ```
    pub fn for_each<F>(&self, mut f: F, guard: &Guard<'_>)
    where
        F: FnMut(&K, &V),
    {
        for (k, v) in self.iter(guard) {
            f(k, v);
        }
    }

    fn init_table<'g>(&'g self, guard: &'g Guard<'_>) -> Shared<'g, Table<K, V>> {
        loop {
            let table = self.table.load(Ordering::SeqCst, guard);
            if !table.is_null() {
                break table;
            }
            // try to allocate the table
            let mut sc = self.size_ctl.load(Ordering::SeqCst);
            if sc < 0 {
                // we lost the initialization race; just spin
                std::thread::yield_now();
                continue;
            }

            if self
                .size_ctl
                .compare_exchange(sc, -1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                // we get to do it!
                let mut table = self.table.load(Ordering::SeqCst, guard);
                if table.is_null() {
                    let n = if sc > 0 {
                        sc as usize
                    } else {
                        DEFAULT_CAPACITY
                    };
                    table = Shared::boxed(Table::new(n, &self.collector), &self.collector);
                    self.table.store(table, Ordering::SeqCst);
                    sc = load_factor!(n as isize);
                }
                self.size_ctl.store(sc, Ordering::SeqCst);
                break table;
            }
        }
    }
}

// ===
// the following methods require Clone, since they ultimately call `transfer`, which needs to be
// able to clone keys. however, they do _not_ need to require thread-safety bounds
// (Send + Sync + 'static) since if the bounds do not hold, the map is empty, so no keys or values
// will be transfered anyway.
// ===

impl<K, V, S> HashMap<K, V, S>
where
    K: Clone,
{
    /// Grows the table if the number of entries has passed the threshold, or joins a resize
    /// that is already under way.
    fn check_for_resize(&self, guard: &Guard<'_>) {
        loop {
            let table = self.table.load(Ordering::SeqCst, guard);
            if table.is_null() {
                break;
            }
            // safety: table was loaded under our guard. a table is only retired after it has
            // been replaced as the current table, and then only freed once our guard is gone.
            let t = unsafe { table.deref() };
            let n = t.len();

            // size_ctl must be read after table, so that a resize that finished in between
            // shows up as a table mismatch below
            let sc = self.size_ctl.load(Ordering::SeqCst);
            if sc >= 0 && self.count.sum() <= sc {
                break;
            }
            if n >= MAXIMUM_CAPACITY {
                break;
            }

            let rs = Self::resize_stamp(n) << RESIZE_STAMP_SHIFT;
            if sc < 0 {
                // either initializing, or a resize of some table is in progress
                if (sc & !MAX_RESIZERS) != rs || sc == rs + 1 || sc == rs + MAX_RESIZERS {
                    break;
                }
                let next_table = t.next_table(guard);
                if next_table.is_null() || self.transfer_index.load(Ordering::SeqCst) <= 0 {
                    break;
                }
                if self
                    .size_ctl
                    .compare_exchange(sc, sc + 1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    self.transfer(table, next_table, guard);
                }
            } else if self
                .size_ctl
                .compare_exchange(sc, rs + 2, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                if self.table.load(Ordering::SeqCst, guard) != table {
                    // a resize completed since we loaded the table; back off and look again
                    self.size_ctl.store(sc, Ordering::SeqCst);
                    continue;
                }
                self.start_transfer(table, guard);
            }
        }
    }

    /// Allocates the next table and moves this thread's share of bins into it.
    ///
    /// The caller must have moved `size_ctl` to the initial resize stamp of `table`.
    fn start_transfer<'g>(&'g self, table: Shared<'g, Table<K, V>>, guard: &'g Guard<'_>) {
        // safety: loaded under our guard, and cannot be retired before this resize is done
        let t = unsafe { table.deref() };
        #[cfg(feature = "tracing")]
        tracing::debug!(bins = t.len(), next_bins = t.len() << 1, "resizing table");

        let next_table = t.next_size_table(&self.collector, guard);
        self.transfer_index
            .store(t.len() as isize, Ordering::SeqCst);
        self.transfer(table, next_table, guard);
    }

    /// Helps transfer if a resize is in progress.
    ///
    /// Returns the table that operations that ran into a forwarding marker in `table` should
    /// continue in.
    fn help_transfer<'g>(
        &'g self,
        table: Shared<'g, Table<K, V>>,
        guard: &'g Guard<'_>,
    ) -> Shared<'g, Table<K, V>> {
        if table.is_null() {
            return table;
        }

        // safety: table was loaded under our guard
        let t = unsafe { table.deref() };
        let next_table = t.next_table(guard);
        if next_table.is_null() {
            return table;
        }

        let rs = Self::resize_stamp(t.len()) << RESIZE_STAMP_SHIFT;
        while table == self.table.load(Ordering::SeqCst, guard) {
            let sc = self.size_ctl.load(Ordering::SeqCst);
            if sc >= 0
                || (sc & !MAX_RESIZERS) != rs
                || sc == rs + 1
                || sc == rs + MAX_RESIZERS
                || self.transfer_index.load(Ordering::SeqCst) <= 0
            {
                break;
            }

            if self
                .size_ctl
                .compare_exchange(sc, sc + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                self.transfer(table, next_table, guard);
                break;
            }
        }
        next_table
    }

    /// Moves bins from `table` to `next_table` until no unclaimed bins are left.
    ///
    /// The caller must have registered itself as a resizer in `size_ctl`. The last resizer to
    /// leave publishes `next_table` as the map's table.
    #[inline(never)]
    fn transfer<'g>(
        &'g self,
        table: Shared<'g, Table<K, V>>,
        next_table: Shared<'g, Table<K, V>>,
        guard: &'g Guard<'_>,
    ) {
        // safety: table was read while `guard` was held, and it can only be retired by the last
        // thread to leave this resize, which cannot be before we do. next_table was reached
        // through table, see the comment on Table::next_table.
        let t = unsafe { table.deref() };
        let nt = unsafe { next_table.deref() };
        let n = t.len();
        debug_assert_eq!(nt.len(), n << 1);

        let ncpu = num_cpus();
        let stride = if ncpu > 1 { (n >> 3) / ncpu } else { n };
        let stride = std::cmp::max(stride as isize, MIN_TRANSFER_STRIDE);

        // bins whose head was locked when we got to them
        let mut deferred = Vec::new();

        loop {
            let next_index = self.transfer_index.load(Ordering::SeqCst);
            if next_index <= 0 {
                break;
            }
            let next_bound = if next_index > stride {
                next_index - stride
            } else {
                0
            };
            if self
                .transfer_index
                .compare_exchange(next_index, next_bound, Ordering::SeqCst, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            // we own bins [next_bound, next_index), and go from the top down
            for i in (next_bound as usize..next_index as usize).rev() {
                self.transfer_bin(t, nt, i, Some(&mut deferred), guard);
            }
        }

        // nobody else will move these, so this time wait for the lock holders
        for i in deferred {
            self.transfer_bin(t, nt, i, None, guard);
        }

        let sc = self.size_ctl.fetch_sub(1, Ordering::SeqCst);
        if sc - 2 != Self::resize_stamp(n) << RESIZE_STAMP_SHIFT {
            // other resizers are still at work, and the last of them finishes up
            return;
        }

        if cfg!(debug_assertions) {
            for i in 0..n {
                let bin = t.bin(i, guard);
                // safety: loaded under our guard
                assert!(
                    matches!(unsafe { bin.as_ref() }.map(|b| &**b), Some(BinEntry::Moved)),
                    "bin {} was not transferred",
                    i
                );
            }
        }

        let now_garbage = self.table.swap(next_table, Ordering::SeqCst, guard);
        assert!(
            now_garbage == table,
            "the current table changed during a resize"
        );
        // safety: the old table is no longer the current table. threads that still look at
        // it loaded it under guards that also keep it (and next_table) alive.
        unsafe { guard.retire_shared(now_garbage) };

        let next_n = n << 1;
        if next_n >= MAXIMUM_CAPACITY {
            #[cfg(feature = "tracing")]
            tracing::warn!(bins = next_n, "table reached its maximum capacity and will not grow further");
            self.size_ctl.store(isize::MAX, Ordering::SeqCst);
        } else {
            #[cfg(feature = "tracing")]
            tracing::debug!(bins = next_n, "published resized table");
            self.size_ctl
                .store(load_factor!(next_n as isize), Ordering::SeqCst);
        }
    }

    /// Moves bin `i` of `t` into `nt`, and leaves the forwarding marker in its place.
    ///
    /// With a `deferred` list that has room, a locked bin is pushed onto it instead.
    fn transfer_bin<'g>(
        &'g self,
        t: &'g Table<K, V>,
        nt: &'g Table<K, V>,
        i: usize,
        mut deferred: Option<&mut Vec<usize>>,
        guard: &'g Guard<'_>,
    ) {
        let n = t.len();
        loop {
            let bin = t.bin(i, guard);
            if bin.is_null() {
                // even an empty bin gets a marker, or late writers could still insert into it
                if t.cas_bin(i, bin, t.get_moved(guard), guard).is_ok() {
                    return;
                }
                continue;
            }

            // safety: bin was loaded under our guard
            let head = match **unsafe { bin.deref() } {
                BinEntry::Moved => return,
                BinEntry::Node(ref head) => head,
            };

            if head.is_locked() {
                if let Some(deferred) = deferred.as_mut() {
                    if deferred.len() < TRANSFER_BUFFER_SIZE {
                        #[cfg(feature = "tracing")]
                        tracing::trace!(bin = i, "deferring locked bin");
                        deferred.push(i);
                        return;
                    }
                }
                #[cfg(feature = "tracing")]
                tracing::trace!(bin = i, "waiting for locked bin");
                head.try_await_lock(t, i, guard);
                continue;
            }

            let lock = match head.try_lock() {
                Some(lock) => lock,
                None => continue,
            };
            if t.bin(i, guard) != bin {
                // the head changed before we got the lock
                continue;
            }

            let (low, high, last_run) = self.split_bin(bin, n, guard);
            nt.store_bin(i, low);
            nt.store_bin(i + n, high);
            t.store_bin(i, t.get_moved(guard));
            drop(lock);

            // everything in front of last_run was copied, and the originals are unreachable
            // now that the marker is in place
            let mut p = bin;
            while p != last_run {
                // safety: p was reached from bin while we held its lock
                let node = unsafe { p.deref() }
                    .as_node()
                    .expect("entries after the head are always Nodes");
                let next = node.next.load(Ordering::SeqCst, guard);
                // safety: unreachable for threads that arrive from now on. the copy shares
                // the value, which is why only the node itself is retired.
                unsafe { guard.retire_shared(p) };
                p = next;
            }
            return;
        }
    }

    /// Splits the chain starting at `bin` on hash bit `n`.
    ///
    /// Returns the chains for index `i` and `i + n` of the next table, and the start of the
    /// longest tail that was reused as-is rather than copied. Must be called with the bin
    /// lock held.
    #[allow(clippy::type_complexity)]
    fn split_bin<'g>(
        &'g self,
        bin: Shared<'g, BinEntry<K, V>>,
        n: usize,
        guard: &'g Guard<'_>,
    ) -> (
        Shared<'g, BinEntry<K, V>>,
        Shared<'g, BinEntry<K, V>>,
        Shared<'g, BinEntry<K, V>>,
    ) {
        let bit = n as u64;

        // find the longest tail whose entries all go to the same side
        let mut run_bit = None;
        let mut last_run = bin;
        let mut p = bin;
        while !p.is_null() {
            // safety: we hold the bin lock, so the chain cannot be unlinked under us
            let node = unsafe { p.deref() }
                .as_node()
                .expect("entries after the head are always Nodes");
            let b = node.hash() & bit;
            if run_bit != Some(b) {
                run_bit = Some(b);
                last_run = p;
            }
            p = node.next.load(Ordering::SeqCst, guard);
        }

        let (mut low, mut high) = if run_bit == Some(0) {
            (last_run, Shared::null())
        } else {
            (Shared::null(), last_run)
        };

        // copy the remaining nodes in front of the two chains
        p = bin;
        while p != last_run {
            // safety: as above
            let node = unsafe { p.deref() }
                .as_node()
                .expect("entries after the head are always Nodes");
            let value = node.value.load(Ordering::SeqCst, guard);
            debug_assert!(!value.is_null(), "tombstone under the bin lock");

            let link = if node.hash() & bit == 0 {
                &mut low
            } else {
                &mut high
            };
            *link = Shared::boxed(
                BinEntry::Node(Node::with_next(
                    node.hash(),
                    node.key.clone(),
                    value,
                    Atomic::from(*link),
                )),
                &self.collector,
            );
            p = node.next.load(Ordering::SeqCst, guard);
        }

        (low, high, last_run)
    }

    /// Waits for the lock of a bin that `head` heads, checking for a resize first.
    fn await_bin(&self, t: &Table<K, V>, bini: usize, head: &Node<K, V>, guard: &Guard<'_>) {
        // contention on a bin is a hint that the table is getting crowded
        self.check_for_resize(guard);
        head.try_await_lock(t, bini, guard);
    }

    /// Tries to presize table to accommodate the given number of elements.
    fn try_presize(&self, size: usize, guard: &Guard<'_>) {
        let requested = requested_capacity(size) as isize;

        loop {
            let table = self.table.load(Ordering::SeqCst, guard);
            let sc = self.size_ctl.load(Ordering::SeqCst);
            if sc < 0 {
                break;
            }

            if table.is_null() {
                // since the map is uninitialized, size_ctl describes the initial capacity
                let n = std::cmp::max(requested, sc) as usize;
                if self
                    .size_ctl
                    .compare_exchange(sc, -1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_err()
                {
                    continue;
                }
                if !self.table.load(Ordering::SeqCst, guard).is_null() {
                    // initialized in the meantime
                    self.size_ctl.store(sc, Ordering::SeqCst);
                    continue;
                }
                let fresh = Shared::boxed(Table::new(n, &self.collector), &self.collector);
                self.table.store(fresh, Ordering::SeqCst);
                self.size_ctl.store(load_factor!(n as isize), Ordering::SeqCst);
                continue;
            }

            // safety: loaded under our guard
            let n = unsafe { table.deref() }.len();
            if requested <= sc || n >= MAXIMUM_CAPACITY {
                break;
            }

            let rs = Self::resize_stamp(n) << RESIZE_STAMP_SHIFT;
            if self
                .size_ctl
                .compare_exchange(sc, rs + 2, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                if self.table.load(Ordering::SeqCst, guard) != table {
                    self.size_ctl.store(sc, Ordering::SeqCst);
                    continue;
                }
                self.start_transfer(table, guard);
            }
        }
    }

    /// Tries to reserve capacity for at least `additional` more elements to be inserted in the
    /// `HashMap`.
    ///
    /// The collection may reserve more space to avoid frequent reallocations. If the table
    /// already has to grow, the calling thread does (its share of) the work right away.
    /// A request beyond what the largest table can hold grows the table as far as it goes.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let map: HashMap<&str, i32> = HashMap::new();
    ///
    /// map.pin().reserve(10);
    /// ```
    pub fn reserve(&self, additional: usize, guard: &Guard<'_>) {
        self.check_guard(guard);
        let absolute = self.len().saturating_add(additional);
        self.try_presize(absolute, guard);
    }

    /// Like [`HashMap::reserve`], but reports requests the map cannot satisfy.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::{HashMap, TryReserveError};
    ///
    /// let map: HashMap<u32, u32> = HashMap::new();
    /// let guard = map.guard();
    /// assert!(map.try_reserve(100, &guard).is_ok());
    /// assert!(matches!(
    ///     map.try_reserve(usize::MAX, &guard),
    ///     Err(TryReserveError::MaximumCapacityExceeded { .. })
    /// ));
    /// ```
    pub fn try_reserve(&self, additional: usize, guard: &Guard<'_>) -> Result<(), TryReserveError> {
        self.check_guard(guard);
        let requested = self
            .len()
            .checked_add(additional)
            .ok_or(TryReserveError::CapacityOverflow)?;
        let maximum = load_factor!(MAXIMUM_CAPACITY);
        if requested > maximum {
            return Err(TryReserveError::MaximumCapacityExceeded { requested, maximum });
        }
        self.try_presize(requested, guard);
        Ok(())
    }

    /// Clears the map, removing all key-value pairs.
    ///
    /// Entries inserted while the clear runs may survive it.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let map = HashMap::new();
    ///
    /// map.pin().insert(1, "a");
    /// map.pin().clear();
    /// assert!(map.pin().is_empty());
    /// ```
    pub fn clear(&self, guard: &Guard<'_>) {
        self.check_guard(guard);
        // Negative number of deletions
        let mut delta = 0;
        let mut idx = 0usize;

        let mut table = self.table.load(Ordering::SeqCst, guard);
        while !table.is_null() {
            // safety: loaded under our guard, either directly or through help_transfer
            let t = unsafe { table.deref() };
            if idx >= t.len() {
                break;
            }
            let bin = t.bin(idx, guard);
            if bin.is_null() {
                idx += 1;
                continue;
            }

            // safety: bin was loaded under our guard
            let head = match **unsafe { bin.deref() } {
                BinEntry::Moved => {
                    table = self.help_transfer(table, guard);
                    // start from the first bin again in the new table
                    idx = 0;
                    continue;
                }
                BinEntry::Node(ref head) => head,
            };

            if head.is_locked() {
                // publish what we removed so far before we possibly block
                if delta != 0 {
                    self.count.add(delta);
                    delta = 0;
                }
                head.try_await_lock(t, idx, guard);
                continue;
            }
            let lock = match head.try_lock() {
                Some(lock) => lock,
                None => continue,
            };
            if t.bin(idx, guard) != bin {
                continue;
            }

            // we now own the bin. tombstone every value, then unlink the whole chain.
            let mut p = bin;
            while !p.is_null() {
                // safety: we hold the bin lock
                let node = unsafe { p.deref() }
                    .as_node()
                    .expect("entries after the head are always Nodes");
                let value = node.value.swap(Shared::null(), Ordering::SeqCst, guard);
                if !value.is_null() {
                    delta -= 1;
                    // safety: the value is no longer reachable through the node
                    unsafe { guard.retire_shared(value) };
                }
                p = node.next.load(Ordering::SeqCst, guard);
            }
            t.store_bin(idx, Shared::null());
            drop(lock);

            let mut p = bin;
            while !p.is_null() {
                // safety: the chain is unlinked, but our guard keeps it alive
                let next = unsafe { p.deref() }
                    .as_node()
                    .expect("entries after the head are always Nodes")
                    .next
                    .load(Ordering::SeqCst, guard);
                // safety: unreachable for threads that arrive from now on
                unsafe { guard.retire_shared(p) };
                p = next;
            }
            idx += 1;
        }

        if delta != 0 {
            self.count.add(delta);
        }
    }
}

impl<K, V, S> HashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    #[inline]
    fn hash<Q: ?Sized + Hash>(&self, key: &Q) -> u64 {
        let mut h = self.build_hasher.build_hasher();
        key.hash(&mut h);
        h.finish() & HASH_BITS
    }

    fn get_node<'g, Q>(&'g self, key: &Q, guard: &'g Guard<'_>) -> Option<&'g Node<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let table = self.table.load(Ordering::SeqCst, guard);
        if table.is_null() {
            return None;
        }

        // safety: we loaded the table under our guard, and tables are only freed after the
        // last guard that could have seen them is gone
        let t = unsafe { table.deref() };
        let h = self.hash(key);
        let bin = t.bin(t.bini(h), guard);
        // safety: as above, for the bin
        let bin = unsafe { bin.as_ref() }?;
        t.find(bin, h, key, guard)
    }

    /// Returns `true` if the map contains a value for the specified key.
    ///
    /// The key may be any borrowed form of the map's key type, but
    /// [`Hash`] and [`Eq`] on the borrowed form *must* match those for
    /// the key type.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let map = HashMap::new();
    /// let mref = map.pin();
    /// mref.insert(1, "a");
    /// assert_eq!(mref.contains_key(&1), true);
    /// assert_eq!(mref.contains_key(&2), false);
    /// ```
    pub fn contains_key<Q>(&self, key: &Q, guard: &Guard<'_>) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.check_guard(guard);
        self.get(key, guard).is_some()
    }

    /// Returns a reference to the value corresponding to the key.
    ///
    /// The key may be any borrowed form of the map's key type, but
    /// [`Hash`] and [`Eq`] on the borrowed form *must* match those for
    /// the key type.
    ///
    /// To obtain a `Guard`, use [`HashMap::guard`].
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let map = HashMap::new();
    /// let mref = map.pin();
    /// mref.insert(1, "a");
    /// assert_eq!(mref.get(&1), Some(&"a"));
    /// assert_eq!(mref.get(&2), None);
    /// ```
    #[inline]
    pub fn get<'g, Q>(&'g self, key: &Q, guard: &'g Guard<'_>) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.check_guard(guard);
        let node = self.get_node(key, guard)?;

        let v = node.value.load(Ordering::SeqCst, guard);
        // a node without a value is being created or removed
        // safety: the value was loaded under our guard
        unsafe { v.as_ref() }.map(|v| &**v)
    }

    /// Returns the key-value pair corresponding to `key`.
    ///
    /// Returns `None` if this map contains no mapping for `key`.
    ///
    /// The key may be any borrowed form of the map's key type, but
    /// [`Hash`] and [`Eq`] on the borrowed form *must* match those for
    /// the key type.
    #[inline]
    pub fn get_key_value<'g, Q>(&'g self, key: &Q, guard: &'g Guard<'_>) -> Option<(&'g K, &'g V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.check_guard(guard);
        let node = self.get_node(key, guard)?;

        let v = node.value.load(Ordering::SeqCst, guard);
        // safety: the value was loaded under our guard
        unsafe { v.as_ref() }.map(|v| (&node.key, &**v))
    }

    pub(crate) fn guarded_eq(
        &self,
        other: &Self,
        our_guard: &Guard<'_>,
        their_guard: &Guard<'_>,
    ) -> bool
    where
        V: PartialEq,
    {
        if self.len() != other.len() {
            return false;
        }

        self.iter(our_guard)
            .all(|(key, value)| other.get(key, their_guard).map_or(false, |v| *value == *v))
    }
}

// ===
// the following methods _do_ introduce items into the map, and so must require that the keys and
// values are thread safe, and can be garbage collected at a later time.
// ===

impl<K, V, S> HashMap<K, V, S>
where
    K: 'static + Sync + Send + Clone + Hash + Eq,
    V: 'static + Sync + Send,
    S: BuildHasher,
{
    /// Inserts a key-value pair into the map.
    ///
    /// If the map did not have this key present, [`None`] is returned.
    ///
    /// If the map did have this key present, the value is updated, and the old
    /// value is returned. The key is left unchanged. See the [std-collections
    /// documentation] for more.
    ///
    /// [`None`]: std::option::Option::None
    /// [std-collections documentation]: https://doc.rust-lang.org/std/collections/index.html#insert-and-complex-keys
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let map = HashMap::new();
    /// assert_eq!(map.pin().insert(37, "a"), None);
    /// assert_eq!(map.pin().is_empty(), false);
    ///
    /// // you can also re-use a map pin like so:
    /// let mref = map.pin();
    ///
    /// mref.insert(37, "b");
    /// assert_eq!(mref.insert(37, "c"), Some(&"b"));
    /// assert_eq!(mref.get(&37), Some(&"c"));
    /// ```
    pub fn insert<'g>(&'g self, key: K, value: V, guard: &'g Guard<'_>) -> Option<&'g V> {
        self.check_guard(guard);
        self.put(key, value, false, guard).before()
    }

    /// Inserts a key-value pair into the map unless the key already exists.
    ///
    /// If the map does not contain the key, the key-value pair is inserted
    /// and this method returns `Ok`.
    ///
    /// If the map does contain the key, the map is left unchanged and this
    /// method returns `Err`.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::{HashMap, TryInsertError};
    ///
    /// let map = HashMap::new();
    /// let mref = map.pin();
    ///
    /// mref.insert(37, "a");
    /// assert_eq!(
    ///     mref.try_insert(37, "b"),
    ///     Err(TryInsertError { current: &"a", not_inserted: "b"})
    /// );
    /// assert_eq!(mref.try_insert(42, "c"), Ok(&"c"));
    /// assert_eq!(mref.get(&37), Some(&"a"));
    /// assert_eq!(mref.get(&42), Some(&"c"));
    /// ```
    #[inline]
    pub fn try_insert<'g>(
        &'g self,
        key: K,
        value: V,
        guard: &'g Guard<'_>,
    ) -> Result<&'g V, TryInsertError<'g, V>> {
        self.check_guard(guard);
        match self.put(key, value, true, guard) {
            PutResult::Exists {
                current,
                not_inserted,
            } => Err(TryInsertError {
                current,
                not_inserted,
            }),
            PutResult::Inserted { new } => Ok(new),
            PutResult::Replaced { .. } => {
                unreachable!("no_replacement cannot result in PutResult::Replaced")
            }
        }
    }

    fn put<'g>(
        &'g self,
        mut key: K,
        value: V,
        no_replacement: bool,
        guard: &'g Guard<'_>,
    ) -> PutResult<'g, V> {
        let hash = self.hash(&key);
        let mut table = self.table.load(Ordering::SeqCst, guard);
        let value = Shared::boxed(value, &self.collector);

        loop {
            if table.is_null() {
                table = self.init_table(guard);
                continue;
            }

            // safety: table was loaded under our guard, by us, by init_table or by
            // help_transfer. see the comment on Table::next_table for the latter.
            let t = unsafe { table.deref() };
            let bini = t.bini(hash);
            let bin = t.bin(bini, guard);

            if bin.is_null() {
                // fast path -- bin is empty so stick us at the front
                let node = Shared::boxed(
                    BinEntry::Node(Node::new(hash, key, value)),
                    &self.collector,
                );
                match t.cas_bin(bini, bin, node, guard) {
                    Ok(_) => {
                        self.count.increment();
                        if t.len() <= EAGER_RESIZE_CHECK_LIMIT {
                            self.check_for_resize(guard);
                        }
                        // safety: we published value, and our guard keeps it alive
                        return PutResult::Inserted {
                            new: unsafe { &**value.deref() },
                        };
                    }
                    Err(changed) => {
                        // someone got there first. take the key back and try again.
                        // safety: our node was never published
                        let entry = unsafe { changed.new.into_box() };
                        key = match Linked::into_inner(*entry) {
                            BinEntry::Node(node) => node.key,
                            BinEntry::Moved => unreachable!("we only ever insert Nodes"),
                        };
                        continue;
                    }
                }
            }

            // safety: bin was loaded under our guard
            let head = match **unsafe { bin.deref() } {
                BinEntry::Moved => {
                    table = self.help_transfer(table, guard);
                    continue;
                }
                BinEntry::Node(ref head) => head,
            };

            if head.is_locked() {
                self.await_bin(t, bini, head, guard);
                continue;
            }
            let lock = match head.try_lock() {
                Some(lock) => lock,
                None => continue,
            };
            if t.bin(bini, guard) != bin {
                // the head changed before we got the lock
                continue;
            }

            // we now own the bin
            let mut chain_len = 1;
            let mut node = head;
            let result = loop {
                if node.matches(hash, &key) {
                    let current = node.value.load(Ordering::SeqCst, guard);
                    // safety: values are only tombstoned under the bin lock, which we hold
                    let current = unsafe { current.as_ref() }
                        .expect("value missing under the bin lock");
                    if no_replacement {
                        // safety: value was never published
                        let not_inserted = Linked::into_inner(*unsafe { value.into_box() });
                        break PutResult::Exists {
                            current: &**current,
                            not_inserted,
                        };
                    }

                    let now_garbage = node.value.swap(value, Ordering::SeqCst, guard);
                    // safety: the old value is unreachable for threads that load the value
                    // from now on. threads that loaded it before hold guards that keep it alive.
                    unsafe { guard.retire_shared(now_garbage) };
                    break PutResult::Replaced { old: &**current };
                }

                let next = node.next.load(Ordering::SeqCst, guard);
                if next.is_null() {
                    let fresh = Shared::boxed(
                        BinEntry::Node(Node::new(hash, key, value)),
                        &self.collector,
                    );
                    node.next.store(fresh, Ordering::SeqCst);
                    // safety: we published value, and our guard keeps it alive
                    break PutResult::Inserted {
                        new: unsafe { &**value.deref() },
                    };
                }
                // safety: next was loaded under our guard while we hold the bin lock
                node = unsafe { next.deref() }
                    .as_node()
                    .expect("entries after the head are always Nodes");
                chain_len += 1;
            };
            drop(lock);

            if let PutResult::Inserted { .. } = result {
                self.count.increment();
                if chain_len > 1 || t.len() <= EAGER_RESIZE_CHECK_LIMIT {
                    self.check_for_resize(guard);
                }
            }
            return result;
        }
    }

    fn put_all<I: Iterator<Item = (K, V)>>(&self, iter: I, guard: &Guard<'_>) {
        for (key, value) in iter {
            self.put(key, value, false, guard);
        }
    }

    /// Installs a locked placeholder for `key` in bin `i` of `t`, if that bin is still empty.
    ///
    /// Hands the key back if it is not.
    fn reserve_bin<'g, 'c>(
        &'g self,
        t: &'g Table<K, V>,
        i: usize,
        hash: u64,
        key: K,
        guard: &'g Guard<'c>,
    ) -> Result<Reservation<'g, 'c, K, V>, K> {
        let entry = Shared::boxed(BinEntry::Node(Node::reserved(hash, key)), &self.collector);
        match t.cas_bin(i, Shared::null(), entry, guard) {
            Ok(_) => {
                // safety: we just published entry, and our guard keeps it alive
                let node = unsafe { entry.deref() }
                    .as_node()
                    .expect("we only ever reserve with Nodes");
                Ok(Reservation {
                    table: t,
                    index: i,
                    entry,
                    node,
                    lock: Some(node.adopt_lock()),
                    guard,
                })
            }
            Err(changed) => {
                // safety: our entry was never published
                let entry = unsafe { changed.new.into_box() };
                match Linked::into_inner(*entry) {
                    BinEntry::Node(node) => Err(node.key),
                    BinEntry::Moved => unreachable!("we only ever reserve with Nodes"),
                }
            }
        }
    }

    /// Looks for a value for `key` in the chain that starts at `head`, without locking.
    fn find_unlocked<'g>(
        &'g self,
        head: &'g Node<K, V>,
        hash: u64,
        key: &K,
        guard: &'g Guard<'_>,
    ) -> Option<&'g V> {
        let mut node = head;
        let mut visited = 1;
        let found = loop {
            if node.matches(hash, key) {
                let value = node.value.load(Ordering::SeqCst, guard);
                // safety: loaded under our guard
                break unsafe { value.as_ref() }.map(|v| &**v);
            }
            let next = node.next.load(Ordering::SeqCst, guard);
            // safety: loaded under our guard
            node = match unsafe { next.as_ref() } {
                Some(next) => next
                    .as_node()
                    .expect("entries after the head are always Nodes"),
                None => break None,
            };
            visited += 1;
        };
        if visited > 1 {
            // walked past a collision
            self.check_for_resize(guard);
        }
        found
    }

    /// Returns the value for `key`, computing and inserting it with `f` if there is none.
    ///
    /// `f` runs at most once, while the bin the key falls into is locked. Other writers to
    /// that bin wait for it, and readers keep seeing the key as absent until it returns. If
    /// `f` panics, the map is left as it was.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let map = HashMap::new();
    /// let mref = map.pin();
    /// assert_eq!(mref.compute_if_absent("a", || 1), &1);
    /// // already present, so the closure does not run
    /// assert_eq!(mref.compute_if_absent("a", || unreachable!()), &1);
    /// ```
    pub fn compute_if_absent<'g, F>(&'g self, key: K, f: F, guard: &'g Guard<'_>) -> &'g V
    where
        F: FnOnce() -> V,
    {
        self.check_guard(guard);
        let hash = self.hash(&key);
        let mut key = key;
        let mut table = self.table.load(Ordering::SeqCst, guard);

        loop {
            if table.is_null() {
                table = self.init_table(guard);
                continue;
            }

            // safety: see put
            let t = unsafe { table.deref() };
            let bini = t.bini(hash);
            let bin = t.bin(bini, guard);

            if bin.is_null() {
                match self.reserve_bin(t, bini, hash, key, guard) {
                    Ok(reservation) => {
                        let value = reservation.fill(Shared::boxed(f(), &self.collector));
                        self.count.increment();
                        if t.len() <= EAGER_RESIZE_CHECK_LIMIT {
                            self.check_for_resize(guard);
                        }
                        return value;
                    }
                    Err(k) => {
                        key = k;
                        continue;
                    }
                }
            }

            // safety: bin was loaded under our guard
            let head = match **unsafe { bin.deref() } {
                BinEntry::Moved => {
                    table = self.help_transfer(table, guard);
                    continue;
                }
                BinEntry::Node(ref head) => head,
            };

            if let Some(value) = self.find_unlocked(head, hash, &key, guard) {
                return value;
            }

            if head.is_locked() {
                self.await_bin(t, bini, head, guard);
                continue;
            }
            let lock = match head.try_lock() {
                Some(lock) => lock,
                None => continue,
            };
            if t.bin(bini, guard) != bin {
                continue;
            }

            let mut chain_len = 1;
            let mut node = head;
            let (value, inserted) = loop {
                if node.matches(hash, &key) {
                    let value = node.value.load(Ordering::SeqCst, guard);
                    // safety: values are only tombstoned under the bin lock, which we hold
                    let value = unsafe { value.as_ref() }
                        .expect("value missing under the bin lock");
                    break (&**value, false);
                }
                let next = node.next.load(Ordering::SeqCst, guard);
                if next.is_null() {
                    let value = Shared::boxed(f(), &self.collector);
                    let fresh = Shared::boxed(
                        BinEntry::Node(Node::new(hash, key, value)),
                        &self.collector,
                    );
                    node.next.store(fresh, Ordering::SeqCst);
                    // safety: we published value, and our guard keeps it alive
                    break (unsafe { &**value.deref() }, true);
                }
                // safety: we hold the bin lock
                node = unsafe { next.deref() }
                    .as_node()
                    .expect("entries after the head are always Nodes");
                chain_len += 1;
            };
            drop(lock);

            if inserted {
                self.count.increment();
                if chain_len > 1 || t.len() <= EAGER_RESIZE_CHECK_LIMIT {
                    self.check_for_resize(guard);
                }
            }
            return value;
        }
    }

    /// Computes a new mapping for `key` from its current value, if it has one.
    ///
    /// If `f` returns `None`, the mapping is removed. Returns the new value, or `None` if the
    /// key was absent or has been removed. `f` runs while the key's bin is locked.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let map = HashMap::new();
    /// let mref = map.pin();
    /// mref.insert(1, 10);
    /// assert_eq!(mref.compute_if_present(&1, |_, v| Some(v + 1)), Some(&11));
    /// assert_eq!(mref.compute_if_present(&1, |_, _| None), None);
    /// assert_eq!(mref.get(&1), None);
    /// assert_eq!(mref.compute_if_present(&2, |_, v| Some(v + 1)), None);
    /// ```
    pub fn compute_if_present<'g, Q, F>(&'g self, key: &Q, f: F, guard: &'g Guard<'_>) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        F: FnOnce(&K, &V) -> Option<V>,
    {
        self.check_guard(guard);
        let remapped = self.replace_node(
            key,
            |k, v| match f(k, v) {
                Some(new) => Remap::Replace(new),
                None => Remap::Remove,
            },
            guard,
        );
        match remapped {
            Remapped::Replaced { new, .. } => Some(new),
            _ => None,
        }
    }

    /// Computes a new mapping for `key` from its current value, or from nothing.
    ///
    /// `f` is given the current value, if any. If it returns `None`, the key ends up absent.
    /// Returns the new value. `f` runs while the key's bin is locked, and readers see either
    /// the value from before or the one `f` produced.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let map = HashMap::new();
    /// let mref = map.pin();
    /// assert_eq!(mref.compute("a", |v| Some(v.map_or(1, |v| v + 10))), Some(&1));
    /// assert_eq!(mref.compute("a", |v| Some(v.map_or(1, |v| v + 10))), Some(&11));
    /// assert_eq!(mref.compute("a", |_| None), None);
    /// assert!(mref.is_empty());
    /// ```
    pub fn compute<'g, F>(&'g self, key: K, f: F, guard: &'g Guard<'_>) -> Option<&'g V>
    where
        F: FnOnce(Option<&V>) -> Option<V>,
    {
        self.check_guard(guard);
        let hash = self.hash(&key);
        let mut key = key;
        let mut table = self.table.load(Ordering::SeqCst, guard);

        loop {
            if table.is_null() {
                table = self.init_table(guard);
                continue;
            }

            // safety: see put
            let t = unsafe { table.deref() };
            let bini = t.bini(hash);
            let bin = t.bin(bini, guard);

            if bin.is_null() {
                match self.reserve_bin(t, bini, hash, key, guard) {
                    Ok(reservation) => {
                        return match f(None) {
                            Some(value) => {
                                let value =
                                    reservation.fill(Shared::boxed(value, &self.collector));
                                self.count.increment();
                                if t.len() <= EAGER_RESIZE_CHECK_LIMIT {
                                    self.check_for_resize(guard);
                                }
                                Some(value)
                            }
                            // dropping the reservation empties the bin again
                            None => None,
                        };
                    }
                    Err(k) => {
                        key = k;
                        continue;
                    }
                }
            }

            // safety: bin was loaded under our guard
            let head = match **unsafe { bin.deref() } {
                BinEntry::Moved => {
                    table = self.help_transfer(table, guard);
                    continue;
                }
                BinEntry::Node(ref head) => head,
            };

            if head.is_locked() {
                self.await_bin(t, bini, head, guard);
                continue;
            }
            let lock = match head.try_lock() {
                Some(lock) => lock,
                None => continue,
            };
            if t.bin(bini, guard) != bin {
                continue;
            }

            let mut chain_len = 1;
            let mut pred: Option<&Node<K, V>> = None;
            let mut p = bin;
            let mut removed = None;
            let mut delta = 0;
            let result = loop {
                // safety: we hold the bin lock
                let node = unsafe { p.deref() }
                    .as_node()
                    .expect("entries after the head are always Nodes");
                if node.matches(hash, &key) {
                    let current = node.value.load(Ordering::SeqCst, guard);
                    // safety: values are only tombstoned under the bin lock, which we hold
                    let current_ref = unsafe { current.as_ref() }
                        .expect("value missing under the bin lock");
                    match f(Some(&**current_ref)) {
                        Some(value) => {
                            let value = Shared::boxed(value, &self.collector);
                            node.value.store(value, Ordering::SeqCst);
                            // safety: see put
                            unsafe { guard.retire_shared(current) };
                            // safety: we published value, and our guard keeps it alive
                            break Some(unsafe { &**value.deref() });
                        }
                        None => {
                            node.value.store(Shared::null(), Ordering::SeqCst);
                            let next = node.next.load(Ordering::SeqCst, guard);
                            match pred {
                                Some(pred) => pred.next.store(next, Ordering::SeqCst),
                                None => t.store_bin(bini, next),
                            }
                            removed = Some((p, current));
                            delta = -1;
                            break None;
                        }
                    }
                }

                let next = node.next.load(Ordering::SeqCst, guard);
                if next.is_null() {
                    match f(None) {
                        Some(value) => {
                            let value = Shared::boxed(value, &self.collector);
                            let fresh = Shared::boxed(
                                BinEntry::Node(Node::new(hash, key, value)),
                                &self.collector,
                            );
                            node.next.store(fresh, Ordering::SeqCst);
                            delta = 1;
                            // safety: we published value, and our guard keeps it alive
                            break Some(unsafe { &**value.deref() });
                        }
                        None => break None,
                    }
                }
                pred = Some(node);
                p = next;
                chain_len += 1;
            };
            drop(lock);

            if let Some((entry, value)) = removed {
                // safety: both were unlinked under the bin lock, and the unlink is visible
                // to every thread that acquires the lock or loads the bin after us
                unsafe {
                    guard.retire_shared(entry);
                    guard.retire_shared(value);
                }
            }
            if delta != 0 {
                self.count.add(delta);
            }
            if delta > 0 && (chain_len > 1 || t.len() <= EAGER_RESIZE_CHECK_LIMIT) {
                self.check_for_resize(guard);
            }
            return result;
        }
    }

    /// Merges `value` into the mapping for `key`.
    ///
    /// If the key is absent, it is mapped to `value`. Otherwise the mapping becomes
    /// `f(current, value)`, and is removed if that is `None`. Returns the new value.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let map = HashMap::new();
    /// let mref = map.pin();
    /// assert_eq!(mref.merge("hits", 1, |old, new| Some(old + new)), Some(&1));
    /// assert_eq!(mref.merge("hits", 1, |old, new| Some(old + new)), Some(&2));
    /// assert_eq!(mref.merge("hits", 1, |_, _| None), None);
    /// assert_eq!(mref.get("hits"), None);
    /// ```
    pub fn merge<'g, F>(&'g self, key: K, value: V, f: F, guard: &'g Guard<'_>) -> Option<&'g V>
    where
        F: FnOnce(&V, V) -> Option<V>,
    {
        self.compute(
            key,
            move |current| match current {
                Some(current) => f(current, value),
                None => Some(value),
            },
            guard,
        )
    }

    /// Replaces the value of `key` with `new`, but only if it currently equals `expected`.
    ///
    /// Returns whether the value was replaced. This is the compare-and-set primitive for
    /// optimistic updates.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let map = HashMap::new();
    /// let mref = map.pin();
    /// mref.insert("a", 1);
    /// assert!(!mref.replace("a", &2, 3));
    /// assert!(mref.replace("a", &1, 3));
    /// assert_eq!(mref.get("a"), Some(&3));
    /// assert!(!mref.replace("b", &1, 3));
    /// ```
    pub fn replace<Q>(&self, key: &Q, expected: &V, new: V, guard: &Guard<'_>) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        V: PartialEq,
    {
        self.check_guard(guard);
        let remapped = self.replace_node(
            key,
            |_, current| {
                if current == expected {
                    Remap::Replace(new)
                } else {
                    Remap::Keep
                }
            },
            guard,
        );
        matches!(remapped, Remapped::Replaced { .. })
    }

    /// Replaces the value of `key` with `value`, if the key is present.
    ///
    /// Returns the previous value, or `None` (leaving the map unchanged) if there was none.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let map = HashMap::new();
    /// let mref = map.pin();
    /// assert_eq!(mref.replace_if_exists("a", 1), None);
    /// assert!(mref.is_empty());
    /// mref.insert("a", 1);
    /// assert_eq!(mref.replace_if_exists("a", 2), Some(&1));
    /// assert_eq!(mref.get("a"), Some(&2));
    /// ```
    pub fn replace_if_exists<'g, Q>(&'g self, key: &Q, value: V, guard: &'g Guard<'_>) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.check_guard(guard);
        match self.replace_node(key, |_, _| Remap::Replace(value), guard) {
            Remapped::Replaced { old, .. } => Some(old),
            _ => None,
        }
    }

    /// Removes a key from the map, returning the value at the key if the key
    /// was previously in the map.
    ///
    /// The key may be any borrowed form of the map's key type, but
    /// [`Hash`] and [`Eq`] on the borrowed form *must* match those for
    /// the key type.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let map = HashMap::new();
    /// map.pin().insert(1, "a");
    /// assert_eq!(map.pin().remove(&1), Some(&"a"));
    /// assert_eq!(map.pin().remove(&1), None);
    /// ```
    pub fn remove<'g, Q>(&'g self, key: &Q, guard: &'g Guard<'_>) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.remove_entry(key, guard).map(|(_, v)| v)
    }

    /// Removes a key from the map, returning the stored key and value if the
    /// key was previously in the map.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let map = HashMap::new();
    /// let guard = map.guard();
    /// map.insert(1, "a", &guard);
    /// assert_eq!(map.remove_entry(&1, &guard), Some((&1, &"a")));
    /// assert_eq!(map.remove(&1, &guard), None);
    /// ```
    pub fn remove_entry<'g, Q>(&'g self, key: &Q, guard: &'g Guard<'_>) -> Option<(&'g K, &'g V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.check_guard(guard);
        match self.replace_node(key, |_, _| Remap::Remove, guard) {
            Remapped::Removed { key, old } => Some((key, old)),
            _ => None,
        }
    }

    /// Removes `key` only if it currently maps to a value equal to `expected`.
    ///
    /// Returns whether the entry was removed.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let map = HashMap::new();
    /// let mref = map.pin();
    /// mref.insert("a", 1);
    /// assert!(!mref.remove_pair("a", &2));
    /// assert!(mref.remove_pair("a", &1));
    /// assert!(mref.is_empty());
    /// ```
    pub fn remove_pair<Q>(&self, key: &Q, expected: &V, guard: &Guard<'_>) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        V: PartialEq,
    {
        self.check_guard(guard);
        let remapped = self.replace_node(
            key,
            |_, current| {
                if current == expected {
                    Remap::Remove
                } else {
                    Remap::Keep
                }
            },
            guard,
        );
        matches!(remapped, Remapped::Removed { .. })
    }

    /// Applies `remap` to the current mapping of `key`, if there is one.
    ///
    /// `remap` runs while the bin lock is held, and its verdict is carried out before the lock
    /// is released. Removals are counted only once the unlink is visible.
    fn replace_node<'g, Q, F>(&'g self, key: &Q, remap: F, guard: &'g Guard<'_>) -> Remapped<'g, K, V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        F: FnOnce(&'g K, &'g V) -> Remap<V>,
    {
        let hash = self.hash(key);
        let mut table = self.table.load(Ordering::SeqCst, guard);

        loop {
            if table.is_null() {
                return Remapped::Absent;
            }

            // safety: see put
            let t = unsafe { table.deref() };
            let bini = t.bini(hash);
            let bin = t.bin(bini, guard);
            if bin.is_null() {
                // fast path -- bin is empty so key is not present
                return Remapped::Absent;
            }

            // safety: bin was loaded under our guard
            let head = match **unsafe { bin.deref() } {
                BinEntry::Moved => {
                    table = self.help_transfer(table, guard);
                    continue;
                }
                BinEntry::Node(ref head) => head,
            };

            // a lone node with some other hash cannot be it, so don't bother locking
            if head.hash() != hash && head.next.load(Ordering::SeqCst, guard).is_null() {
                return Remapped::Absent;
            }

            if head.is_locked() {
                self.await_bin(t, bini, head, guard);
                continue;
            }
            let lock = match head.try_lock() {
                Some(lock) => lock,
                None => continue,
            };
            if t.bin(bini, guard) != bin {
                continue;
            }

            let mut pred: Option<&Node<K, V>> = None;
            let mut p = bin;
            let mut removed = None;
            let result = loop {
                // safety: we hold the bin lock
                let node = unsafe { p.deref() }
                    .as_node()
                    .expect("entries after the head are always Nodes");
                if node.matches(hash, key) {
                    let current = node.value.load(Ordering::SeqCst, guard);
                    // safety: values are only tombstoned under the bin lock, which we hold
                    let old = &**unsafe { current.as_ref() }
                        .expect("value missing under the bin lock");
                    break match remap(&node.key, old) {
                        Remap::Keep => Remapped::Kept,
                        Remap::Replace(value) => {
                            let value = Shared::boxed(value, &self.collector);
                            node.value.store(value, Ordering::SeqCst);
                            // safety: see put
                            unsafe { guard.retire_shared(current) };
                            Remapped::Replaced {
                                old,
                                // safety: we published value, and our guard keeps it alive
                                new: unsafe { &**value.deref() },
                            }
                        }
                        Remap::Remove => {
                            // tombstone first, so readers already on this node see it gone
                            node.value.store(Shared::null(), Ordering::SeqCst);
                            let next = node.next.load(Ordering::SeqCst, guard);
                            match pred {
                                Some(pred) => pred.next.store(next, Ordering::SeqCst),
                                None => t.store_bin(bini, next),
                            }
                            removed = Some((p, current));
                            Remapped::Removed {
                                key: &node.key,
                                old,
                            }
                        }
                    };
                }

                let next = node.next.load(Ordering::SeqCst, guard);
                if next.is_null() {
                    break Remapped::Absent;
                }
                pred = Some(node);
                p = next;
            };
            drop(lock);

            if let Some((entry, value)) = removed {
                // safety: both were unlinked under the bin lock, and the unlink is visible
                // to every thread that acquires the lock or loads the bin after us
                unsafe {
                    guard.retire_shared(entry);
                    guard.retire_shared(value);
                }
                self.count.add(-1);
            }
            return result;
        }
    }

    /// Retains only the elements specified by the predicate.
    ///
    /// In other words, remove all pairs `(k, v)` such that `f(&k,&v)` returns `false`.
    ///
    /// If the value of a rejected pair is replaced before the removal takes place, the entry
    /// is left alone.
    ///
    /// # Examples
    ///
    /// ```
    /// use stripemap::HashMap;
    ///
    /// let map = HashMap::new();
    ///
    /// for i in 0..8 {
    ///     map.pin().insert(i, i*10);
    /// }
    /// map.pin().retain(|&k, _| k % 2 == 0);
    /// assert_eq!(map.pin().len(), 4);
    /// ```
    pub fn retain<F>(&self, mut f: F, guard: &Guard<'_>)
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.check_guard(guard);
        for (k, v) in self.iter(guard) {
            if !f(k, v) {
                self.replace_node(
                    k,
                    |_, current| {
                        if std::ptr::eq(current, v) {
                            Remap::Remove
                        } else {
                            Remap::Keep
                        }
                    },
                    guard,
                );
            }
        }
    }
}

impl<K, V, S> PartialEq for HashMap<K, V, S>
where
    K: Hash + Eq,
    V: PartialEq,
    S: BuildHasher,
{
    fn eq(&self, other: &Self) -> bool {
        self.guarded_eq(other, &self.guard(), &other.guard())
    }
}

impl<K, V, S> Eq for HashMap<K, V, S>
where
    K: Hash + Eq,
    V: Eq,
    S: BuildHasher,
{
}

impl<K, V, S> fmt::Debug for HashMap<K, V, S>
where
    K: Debug,
    V: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let guard = self.guard();
        f.debug_map().entries(self.iter(&guard)).finish()
    }
}

impl<K, V, S> Drop for HashMap<K, V, S> {
    fn drop(&mut self) {
        // safety: we have &mut self _and_ all references we have returned are bound to the
        // lifetime of their borrow of self, so there cannot be any outstanding references to
        // anything in the map.
        let guard = unsafe { reclaim::unprotected() };

        let table = self.table.swap(Shared::null(), Ordering::SeqCst, &guard);
        if table.is_null() {
            // table was never allocated!
            return;
        }

        // safety: same as above + we own the table
        let mut table = unsafe { table.into_box() };
        // no resize can be in flight: every thread that took part in one has returned
        assert!(table.next_table(&guard).is_null());
        table.drop_bins();
    }
}

impl<K, V, S> Extend<(K, V)> for &HashMap<K, V, S>
where
    K: 'static + Sync + Send + Clone + Hash + Eq,
    V: 'static + Sync + Send,
    S: BuildHasher,
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        // from `hashbrown::HashMap::extend`:
        // Keys may be already present or show multiple times in the iterator.
        // Reserve the entire hint lower bound if the map is empty.
        // Otherwise reserve half the hint (rounded up), so the map
        // will only resize twice in the worst case.
        let iter = iter.into_iter();
        let reserve = if self.is_empty() {
            iter.size_hint().0
        } else {
            (iter.size_hint().0 + 1) / 2
        };

        let guard = self.guard();
        self.reserve(reserve, &guard);
        (*self).put_all(iter, &guard);
    }
}

impl<'a, K, V, S> Extend<(&'a K, &'a V)> for &HashMap<K, V, S>
where
    K: 'static + Sync + Send + Copy + Hash + Eq,
    V: 'static + Sync + Send + Copy,
    S: BuildHasher,
{
    fn extend<T: IntoIterator<Item = (&'a K, &'a V)>>(&mut self, iter: T) {
        self.extend(iter.into_iter().map(|(&key, &value)| (key, value)));
    }
}

impl<K, V, S> FromIterator<(K, V)> for HashMap<K, V, S>
where
    K: 'static + Sync + Send + Clone + Hash + Eq,
    V: 'static + Sync + Send,
    S: BuildHasher + Default,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let iter = iter.into_iter();
        let (lower, _) = iter.size_hint();
        let map = HashMap::with_capacity_and_hasher(lower, S::default());
        {
            let guard = map.guard();
            map.put_all(iter, &guard);
        }
        map
    }
}

impl<'a, K, V, S> FromIterator<(&'a K, &'a V)> for HashMap<K, V, S>
where
    K: 'static + Sync + Send + Copy + Hash + Eq,
    V: 'static + Sync + Send + Copy,
    S: BuildHasher + Default,
{
    fn from_iter<T: IntoIterator<Item = (&'a K, &'a V)>>(iter: T) -> Self {
        Self::from_iter(iter.into_iter().map(|(&k, &v)| (k, v)))
    }
}

impl<K, V, S> Clone for HashMap<K, V, S>
where
    K: 'static + Sync + Send + Clone + Hash + Eq,
    V: 'static + Sync + Send + Clone,
    S: BuildHasher + Clone,
{
    fn clone(&self) -> HashMap<K, V, S> {
        let cloned = Self::with_hasher(self.build_hasher.clone());
        {
            let ours = self.guard();
            let table = self.table.load(Ordering::SeqCst, &ours);
            if !table.is_null() {
                // start out with as many bins as we have now
                // safety: loaded under our guard
                let n = unsafe { table.deref() }.len();
                cloned.size_ctl.store(n as isize, Ordering::SeqCst);
            }

            let theirs = cloned.guard();
            for (k, v) in self.iter(&ours) {
                cloned.insert(k.clone(), v.clone(), &theirs);
            }
        }
        cloned
    }
}

/// The number of bins for a table that should hold `size` entries without growing.
fn requested_capacity(size: usize) -> usize {
    if size >= MAXIMUM_CAPACITY / 2 {
        MAXIMUM_CAPACITY
    } else {
        // 1.5 * size + 1, so that size stays below the ¾ threshold
        table_size_for(size + (size >> 1) + 1)
    }
}

/// The smallest power of two that is at least `size`, between 2 and `MAXIMUM_CAPACITY`.
fn table_size_for(size: usize) -> usize {
    size.checked_next_power_of_two()
        .unwrap_or(MAXIMUM_CAPACITY)
        .clamp(2, MAXIMUM_CAPACITY)
}

#[cfg(not(miri))]
#[inline]
/// Returns the number of physical CPUs in the machine (_O(1)_).
pub(crate) fn num_cpus() -> usize {
    NCPU_INITIALIZER.call_once(|| NCPU.store(num_cpus::get_physical(), Ordering::Relaxed));
    NCPU.load(Ordering::Relaxed)
}

#[cfg(miri)]
#[inline]
pub(crate) const fn num_cpus() -> usize {
    1
}

#[test]
fn capacity() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();

    assert_eq!(map.capacity(&guard), 0);
    // The table has not yet been allocated

    map.insert(42, 0, &guard);

    assert_eq!(map.capacity(&guard), 16);
    // The table has been allocated and has default capacity

    for i in 0..16 {
        map.insert(i, 42, &guard);
    }

    assert_eq!(map.capacity(&guard), 32);
    // The table has been resized once (and it's capacity doubled),
    // since we inserted more elements than it can hold
}
