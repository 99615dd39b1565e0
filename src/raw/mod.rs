use seize::Linked;

use crate::node::*;
use crate::reclaim::{self, Atomic, Collector, Guard, Shared};
use std::borrow::Borrow;
use std::ptr;
use std::sync::atomic::Ordering;

/// A fixed-size, power-of-two array of bins.
///
/// Tables are never resized in place. A resize fills `next_table` bin by bin and leaves the
/// table's forwarding marker in every bin it has emptied.
pub(crate) struct Table<K, V> {
    bins: Box<[Atomic<BinEntry<K, V>>]>,

    // a Moved carries no data of its own, so every forwarded bin of this table points at
    // this one instance
    moved: Atomic<BinEntry<K, V>>,

    // set once, by the thread that starts the resize away from this table.
    //
    // safety: a Moved marker is only ever stored after next_table is set, and a table is only
    // retired after it has been replaced as the map's current table. a thread that reached a
    // Moved in this table did so under a guard taken while this table was still reachable,
    // and next_table was reachable (as the map's next or current table) at that point too. the
    // guard therefore keeps next_table alive for as long as it keeps this table alive.
    next_table: Atomic<Table<K, V>>,
}

impl<K, V> Table<K, V> {
    pub(crate) fn from(bins: Vec<Atomic<BinEntry<K, V>>>, collector: &Collector) -> Self {
        debug_assert!(bins.len().is_power_of_two());
        Self {
            bins: bins.into_boxed_slice(),
            moved: Atomic::from(Shared::boxed(BinEntry::Moved, collector)),
            next_table: Atomic::null(),
        }
    }

    pub(crate) fn new(bins: usize, collector: &Collector) -> Self {
        Self::from((0..bins).map(|_| Atomic::null()).collect(), collector)
    }

    pub(crate) fn len(&self) -> usize {
        self.bins.len()
    }

    #[inline]
    pub(crate) fn bini(&self, hash: u64) -> usize {
        let mask = self.bins.len() as u64 - 1;
        (hash & mask) as usize
    }

    #[inline]
    pub(crate) fn bin<'g>(&self, i: usize, guard: &'g Guard<'_>) -> Shared<'g, BinEntry<K, V>> {
        self.bins[i].load(Ordering::Acquire, guard)
    }

    #[inline]
    pub(crate) fn store_bin(&self, i: usize, new: Shared<'_, BinEntry<K, V>>) {
        self.bins[i].store(new, Ordering::Release)
    }

    #[inline]
    #[allow(clippy::type_complexity)]
    pub(crate) fn cas_bin<'g>(
        &self,
        i: usize,
        current: Shared<'_, BinEntry<K, V>>,
        new: Shared<'g, BinEntry<K, V>>,
        guard: &'g Guard<'_>,
    ) -> Result<Shared<'g, BinEntry<K, V>>, reclaim::CompareExchangeError<'g, BinEntry<K, V>>>
    {
        self.bins[i].compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire, guard)
    }

    /// Whether `node` is (still) the first entry of bin `i`.
    pub(crate) fn is_head(&self, i: usize, node: &Node<K, V>, guard: &Guard<'_>) -> bool {
        let bin = self.bin(i, guard);
        // safety: bin was loaded under the guard, so it has not been reclaimed
        match unsafe { bin.as_ref() } {
            Some(entry) => match **entry {
                BinEntry::Node(ref head) => ptr::eq(head, node),
                BinEntry::Moved => false,
            },
            None => false,
        }
    }

    pub(crate) fn next_table<'g>(&self, guard: &'g Guard<'_>) -> Shared<'g, Table<K, V>> {
        self.next_table.load(Ordering::SeqCst, guard)
    }

    /// The table of twice this size that bins move into, allocated on first use.
    pub(crate) fn next_size_table<'g>(
        &self,
        collector: &Collector,
        guard: &'g Guard<'_>,
    ) -> Shared<'g, Table<K, V>> {
        let next = self.next_table(guard);
        if !next.is_null() {
            return next;
        }

        let fresh = Shared::boxed(Table::new(self.len() << 1, collector), collector);
        match self.next_table.compare_exchange(
            Shared::null(),
            fresh,
            Ordering::SeqCst,
            Ordering::SeqCst,
            guard,
        ) {
            Ok(_) => fresh,
            Err(changed) => {
                // safety: fresh lost the race, so no other thread has ever seen it
                drop(unsafe { changed.new.into_box() });
                changed.current
            }
        }
    }

    /// The forwarding marker of this table.
    pub(crate) fn get_moved<'g>(&self, guard: &'g Guard<'_>) -> Shared<'g, BinEntry<K, V>> {
        debug_assert!(
            !self.next_table(guard).is_null(),
            "forwarding to a table that does not exist"
        );
        self.moved.load(Ordering::SeqCst, guard)
    }

    /// Finds the node for `key`, starting from the head of its bin in this table.
    ///
    /// Forwarding markers switch the search over to the next table. The returned node may
    /// carry a null value if it is being created or removed.
    pub(crate) fn find<'g, Q>(
        &'g self,
        bin: &'g Linked<BinEntry<K, V>>,
        hash: u64,
        key: &Q,
        guard: &'g Guard<'_>,
    ) -> Option<&'g Node<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        let mut table = self;
        let mut entry = bin;
        loop {
            match **entry {
                BinEntry::Node(ref head) => {
                    let mut node = head;
                    loop {
                        if node.matches(hash, key) {
                            return Some(node);
                        }
                        let next = node.next.load(Ordering::Acquire, guard);
                        // safety: nodes are only reclaimed after being unlinked, and our
                        // guard was taken before that could have happened
                        node = match unsafe { next.as_ref() } {
                            Some(next) => next
                                .as_node()
                                .expect("only the head of a bin can be a forwarding marker"),
                            None => return None,
                        };
                    }
                }
                BinEntry::Moved => {
                    // safety: see the comment on next_table
                    table = &**unsafe { table.next_table(guard).deref() };
                    let bin = table.bin(table.bini(hash), guard);
                    // safety: loaded under our guard
                    entry = unsafe { bin.as_ref() }?;
                }
            }
        }
    }

    /// Frees every chain in this table, and the values in them.
    pub(crate) fn drop_bins(&mut self) {
        // safety: we have &mut self, so no other thread can reach the bins any more
        let guard = unsafe { reclaim::unprotected() };

        for bin in Vec::from(std::mem::replace(&mut self.bins, vec![].into_boxed_slice())) {
            let head = bin.load(Ordering::SeqCst, &guard);
            if head.is_null() {
                continue;
            }

            // safety: as above
            if let BinEntry::Moved = **unsafe { head.deref() } {
                // the marker is shared and freed by Drop
                continue;
            }

            // safety: as above, and nodes belong to exactly one bin
            let mut p = unsafe { bin.into_box() };
            loop {
                let node = match Linked::into_inner(*p) {
                    BinEntry::Node(node) => node,
                    BinEntry::Moved => unreachable!("forwarding marker inside a chain"),
                };

                if !node.value.load(Ordering::SeqCst, &guard).is_null() {
                    // safety: as above
                    drop(unsafe { node.value.into_box() });
                }

                if node.next.load(Ordering::SeqCst, &guard).is_null() {
                    break;
                }
                // safety: as above
                p = unsafe { node.next.into_box() };
            }
        }
    }
}

impl<K, V> Drop for Table<K, V> {
    fn drop(&mut self) {
        // safety: we have &mut self, so no other thread can reach the table any more
        let guard = unsafe { reclaim::unprotected() };

        // the map calls drop_bins on its live table. every other table was retired at the end
        // of a resize, at which point all of its bins held the shared marker.
        let bins = Vec::from(std::mem::replace(&mut self.bins, vec![].into_boxed_slice()));
        if cfg!(debug_assertions) {
            for bin in bins.iter() {
                let bin = bin.load(Ordering::SeqCst, &guard);
                // safety: as above
                if let Some(entry) = unsafe { bin.as_ref() } {
                    assert!(
                        matches!(**entry, BinEntry::Moved),
                        "dropped table with non-empty bin"
                    );
                }
            }
        }
        drop(bins);

        let moved = self.moved.swap(Shared::null(), Ordering::SeqCst, &guard);
        assert!(
            !moved.is_null(),
            "self.moved is initialized together with the table"
        );
        // safety: as above
        drop(unsafe { moved.into_box() });

        // the next table is not ours to free
    }
}

impl<K, V> std::fmt::Debug for Table<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("bins", &self.bins.len())
            .field("next_table", &self.next_table)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(hash: u64, key: usize, collector: &Collector) -> Shared<'static, BinEntry<usize, usize>> {
        Shared::boxed(
            BinEntry::Node(Node::new(hash, key, Shared::boxed(key * 10, collector))),
            collector,
        )
    }

    #[test]
    fn bini_masks() {
        let collector = Collector::new();
        let table = Table::<usize, usize>::new(16, &collector);
        assert_eq!(table.len(), 16);
        assert_eq!(table.bini(3), 3);
        assert_eq!(table.bini(16), 0);
        assert_eq!(table.bini(35), 3);
    }

    #[test]
    fn cas_only_into_expected() {
        let collector = Collector::new();
        let guard = collector.enter();
        let mut table = Table::<usize, usize>::new(4, &collector);

        let first = node(1, 1, &collector);
        assert!(table.cas_bin(1, Shared::null(), first, &guard).is_ok());

        let second = node(1, 2, &collector);
        let err = table
            .cas_bin(1, Shared::null(), second, &guard)
            .expect_err("bin is occupied");
        assert_eq!(err.current, first);
        // safety: second was never published
        let second = unsafe { err.new.into_box() };
        match Linked::into_inner(*second) {
            BinEntry::Node(n) => drop(unsafe { n.value.into_box() }),
            BinEntry::Moved => unreachable!(),
        }

        table.drop_bins();
    }

    #[test]
    fn find_walks_chain() {
        let collector = Collector::new();
        let guard = collector.enter();
        let mut table = Table::<usize, usize>::new(4, &collector);

        let head = node(1, 1, &collector);
        let tail = node(5, 5, &collector);
        unsafe { head.deref() }
            .as_node()
            .unwrap()
            .next
            .store(tail, Ordering::SeqCst);
        table.store_bin(1, head);

        let bin = unsafe { table.bin(1, &guard).deref() };
        assert_eq!(table.find(bin, 5, &5, &guard).map(|n| n.key), Some(5));
        assert_eq!(table.find(bin, 1, &1, &guard).map(|n| n.key), Some(1));
        assert!(table.find(bin, 9, &9, &guard).is_none());
        // same hash, different key
        assert!(table.find(bin, 5, &6, &guard).is_none());

        table.drop_bins();
    }

    #[test]
    fn find_follows_forwarding() {
        let collector = Collector::new();
        let guard = collector.enter();
        let mut table = Table::<usize, usize>::new(2, &collector);

        let next = table.next_size_table(&collector, &guard);
        assert_eq!(table.next_size_table(&collector, &guard), next);
        let next_ref = unsafe { next.deref() };
        assert_eq!(next_ref.len(), 4);

        next_ref.store_bin(3, node(3, 3, &collector));
        table.store_bin(1, table.get_moved(&guard));

        let bin = unsafe { table.bin(1, &guard).deref() };
        assert_eq!(table.find(bin, 3, &3, &guard).map(|n| n.key), Some(3));
        assert!(table.find(bin, 1, &1, &guard).is_none());
        let head = unsafe { next_ref.bin(3, &guard).deref() }.as_node().unwrap();
        assert!(next_ref.is_head(3, head, &guard));
        assert!(!next_ref.is_head(2, head, &guard));
        assert!(!table.is_head(1, head, &guard));

        table.drop_bins();
        // safety: nothing else refers to the next table
        let mut next = unsafe { next.into_box() };
        next.drop_bins();
    }
}
