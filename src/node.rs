use crate::raw::Table;
use crate::reclaim::{Atomic, Guard};
use crate::xorshift;
use parking_lot::{Condvar, Mutex};
use std::borrow::Borrow;
use std::hint;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

/// Set in a node's control word while its bin is locked.
pub(crate) const LOCKED: u64 = 0b01 << 62;
/// Set, together with [`LOCKED`], once some thread has parked waiting for the unlock.
pub(crate) const WAITING: u64 = 0b11 << 62;
/// The bits of a control word that hold the hash.
pub(crate) const HASH_BITS: u64 = !WAITING;

/// Entry in a bin.
///
/// The head of a non-empty bin is either a `Node` or, once the bin has been transferred, the
/// table's shared `Moved` marker. Entries after the head are always `Node`s.
pub(crate) enum BinEntry<K, V> {
    Node(Node<K, V>),
    /// All entries of this bin now live in the owning table's `next_table`.
    Moved,
}

impl<K, V> BinEntry<K, V> {
    pub(crate) fn as_node(&self) -> Option<&Node<K, V>> {
        if let BinEntry::Node(ref n) = *self {
            Some(n)
        } else {
            None
        }
    }
}

/// Key-value entry.
///
/// The control word packs two status bits above the key's hash. A bin is locked by setting
/// [`LOCKED`] on its head node, so the first node of a bin doubles as the bin's lock. The
/// monitor is only touched by threads that gave up spinning on that lock.
pub(crate) struct Node<K, V> {
    control: AtomicU64,
    pub(crate) key: K,
    /// Null while the node is being created or removed.
    pub(crate) value: Atomic<V>,
    pub(crate) next: Atomic<BinEntry<K, V>>,
    monitor: Mutex<()>,
    unlocked: Condvar,
}

impl<K, V> Node<K, V> {
    pub(crate) fn new<AV>(hash: u64, key: K, value: AV) -> Self
    where
        AV: Into<Atomic<V>>,
    {
        Self::with_next(hash, key, value, Atomic::null())
    }

    pub(crate) fn with_next<AV>(hash: u64, key: K, value: AV, next: Atomic<BinEntry<K, V>>) -> Self
    where
        AV: Into<Atomic<V>>,
    {
        debug_assert_eq!(hash & !HASH_BITS, 0);
        Self {
            control: AtomicU64::new(hash),
            key,
            value: value.into(),
            next,
            monitor: Mutex::new(()),
            unlocked: Condvar::new(),
        }
    }

    /// A placeholder for `key` that is born locked and without a value.
    ///
    /// Whoever installs it owns the bin's lock and must publish a value or take the node
    /// back out before unlocking it.
    pub(crate) fn reserved(hash: u64, key: K) -> Self {
        let node = Self::new(hash, key, Atomic::null());
        node.control.store(hash | LOCKED, Ordering::Relaxed);
        node
    }

    #[inline]
    pub(crate) fn hash(&self) -> u64 {
        self.control.load(Ordering::Relaxed) & HASH_BITS
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.control.load(Ordering::Acquire) & LOCKED != 0
    }

    pub(crate) fn matches<Q>(&self, hash: u64, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        self.hash() == hash && self.key.borrow() == key
    }

    /// Locks the bin this node heads, if nobody holds it.
    ///
    /// The caller must check that the node still heads its bin after this succeeds.
    pub(crate) fn try_lock(&self) -> Option<BinLock<'_, K, V>> {
        let hash = self.hash();
        self.control
            .compare_exchange(hash, hash | LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| BinLock { node: self })
    }

    /// Takes over the lock of a node created with [`Node::reserved`].
    pub(crate) fn adopt_lock(&self) -> BinLock<'_, K, V> {
        debug_assert!(self.is_locked());
        BinLock { node: self }
    }

    fn unlock(&self) {
        let hash = self.hash();
        if self
            .control
            .compare_exchange(hash | LOCKED, hash, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            // someone set WAITING while we held the lock
            self.control.store(hash, Ordering::Release);
            let _monitor = self.monitor.lock();
            self.unlocked.notify_all();
        }
    }

    /// Waits for a while for the lock on this node to be released.
    ///
    /// Spins first, with randomized backoff, then parks until the lock holder wakes it up.
    /// Returns early once the node is unlocked or no longer heads bin `i` of `table`. The
    /// caller then starts over, since the bin may have changed in any way.
    pub(crate) fn try_await_lock(&self, table: &Table<K, V>, i: usize, guard: &Guard<'_>) {
        let mut spins = spin_lock_attempts();
        let mut base = xorshift::advance();
        let mut randomizer = base;

        loop {
            if !table.is_head(i, self, guard) {
                return;
            }
            let control = self.control.load(Ordering::Acquire);
            if control & LOCKED == 0 {
                return;
            }

            if spins >= 0 {
                randomizer >>= 1;
                if randomizer & 1 == 0 {
                    spins -= 1;
                    if spins == 0 {
                        thread::yield_now();
                    } else if randomizer == 0 {
                        base = xorshift::xorshift(base);
                        randomizer = base;
                    }
                }
                hint::spin_loop();
            } else if control & WAITING == WAITING
                || self
                    .control
                    .compare_exchange(
                        control,
                        control | WAITING,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                self.park(table, i, guard);
                return;
            }
        }
    }

    fn park(&self, table: &Table<K, V>, i: usize, guard: &Guard<'_>) {
        let mut monitor = self.monitor.lock();
        if table.is_head(i, self, guard) && self.control.load(Ordering::Acquire) & WAITING == WAITING
        {
            #[cfg(feature = "tracing")]
            tracing::trace!(bin = i, "parking on a contended bin lock");
            self.unlocked.wait(&mut monitor);
        } else {
            // the holder may already be past its notify
            self.unlocked.notify_all();
        }
    }
}

impl<K, V> std::fmt::Debug for Node<K, V>
where
    K: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("hash", &self.hash())
            .field("locked", &self.is_locked())
            .field("key", &self.key)
            .finish()
    }
}

/// Holds the lock of one bin. Dropping it unlocks the bin and wakes any parked waiters.
pub(crate) struct BinLock<'a, K, V> {
    node: &'a Node<K, V>,
}

impl<K, V> Drop for BinLock<'_, K, V> {
    fn drop(&mut self) {
        self.node.unlock();
    }
}

/// How many times a thread spins on a bin lock before parking.
fn spin_lock_attempts() -> isize {
    let cpus = crate::map::num_cpus();
    if cpus > 1 {
        cpus as isize * 2
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reclaim::{Collector, Shared};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    fn single_bin_table(
        collector: &Collector,
    ) -> (Table<usize, usize>, Shared<'static, BinEntry<usize, usize>>) {
        let table = Table::new(2, collector);
        let value = Shared::boxed(1, collector);
        let entry = Shared::boxed(BinEntry::Node(Node::new(4, 4, value)), collector);
        table.store_bin(0, entry);
        (table, entry)
    }

    #[test]
    fn control_bits() {
        assert_eq!(LOCKED & HASH_BITS, 0);
        assert_eq!(WAITING & LOCKED, LOCKED);
        assert_eq!(HASH_BITS.count_ones(), 62);
    }

    #[test]
    fn lock_and_unlock() {
        let node = Node::<usize, usize>::new(7, 0, Atomic::null());
        let lock = node.try_lock().expect("unlocked node");
        assert!(node.is_locked());
        assert_eq!(node.hash(), 7);
        assert!(node.try_lock().is_none());
        drop(lock);
        assert!(!node.is_locked());
        assert_eq!(node.control.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn reserved_is_locked() {
        let node = Node::<usize, usize>::reserved(3, 0);
        assert!(node.is_locked());
        assert!(node.value.load(Ordering::SeqCst, &unsafe { crate::reclaim::unprotected() }).is_null());
        drop(node.adopt_lock());
        assert!(!node.is_locked());
    }

    #[test]
    fn matches_hash_and_key() {
        let node = Node::<String, usize>::new(9, "a".to_string(), Atomic::null());
        assert!(node.matches(9, "a"));
        assert!(!node.matches(8, "a"));
        assert!(!node.matches(9, "b"));
        let _lock = node.try_lock();
        assert!(node.matches(9, "a"));
    }

    #[test]
    fn await_returns_when_not_head() {
        let collector = Collector::new();
        let guard = collector.enter();
        let (mut table, entry) = single_bin_table(&collector);
        let node = unsafe { entry.deref() }.as_node().unwrap();
        let _lock = node.try_lock().unwrap();
        // not the head of bin 1, so this must not block
        node.try_await_lock(&table, 1, &guard);
        drop(_lock);
        table.drop_bins();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn parked_waiter_is_woken() {
        let collector = Arc::new(Collector::new());
        let (table, entry) = single_bin_table(&collector);
        let table = Arc::new(table);
        let entry = entry.as_ptr() as usize;

        let node = unsafe { &*(entry as *const crate::reclaim::Linked<BinEntry<usize, usize>>) }
            .as_node()
            .unwrap();
        let lock = node.try_lock().unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let waiter = {
            let table = Arc::clone(&table);
            let collector = Arc::clone(&collector);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let guard = collector.enter();
                let node =
                    unsafe { &*(entry as *const crate::reclaim::Linked<BinEntry<usize, usize>>) }
                        .as_node()
                        .unwrap();
                while node.is_locked() {
                    node.try_await_lock(&table, 0, &guard);
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));
        drop(lock);
        waiter.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert!(!node.is_locked());

        let mut table = Arc::try_unwrap(table).ok().expect("waiter has exited");
        table.drop_bins();
    }
}
