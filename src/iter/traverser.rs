use crate::node::{BinEntry, Node};
use crate::raw::Table;
use crate::reclaim::{Guard, Shared};
use std::sync::atomic::Ordering;

/// Walks every node of a table, following forwarding markers into the tables that bins have
/// moved to.
///
/// A bin `i` of a table with `n` bins ends up in bins `i` and `i + n` of the next table. The
/// traversal visits exactly those, and keeps a stack of where it came from, so every entry
/// that stays in the map for the whole traversal is returned exactly once, however many
/// resizes happen in the meantime.
#[derive(Debug)]
pub(crate) struct NodeIter<'g, K, V> {
    /// Current table; update if resized
    table: Option<&'g Table<K, V>>,

    stack: Option<Box<TableStack<'g, K, V>>>,
    spare: Option<Box<TableStack<'g, K, V>>>,

    /// The last node iterated over
    prev: Option<&'g Node<K, V>>,

    /// Index of bin to use next
    index: usize,

    /// Current index of initial table
    base_index: usize,

    /// Index bound for initial table
    base_limit: usize,

    /// Initial table size
    base_size: usize,

    guard: &'g Guard<'g>,
}

impl<'g, K, V> NodeIter<'g, K, V> {
    pub(crate) fn new(table: Shared<'g, Table<K, V>>, guard: &'g Guard<'_>) -> Self {
        // safety: a table loaded under a guard is not freed until after that guard is dropped
        let (table, len) = match unsafe { table.as_ref() } {
            Some(table) => (Some(&**table), table.len()),
            None => (None, 0),
        };

        Self {
            table,
            stack: None,
            spare: None,
            prev: None,
            base_size: len,
            base_index: 0,
            index: 0,
            base_limit: len,
            guard,
        }
    }

    fn push_state(&mut self, t: &'g Table<K, V>, i: usize, n: usize) {
        let mut s = self.spare.take();
        if let Some(ref mut s) = s {
            self.spare = s.next.take();
        }

        let target = TableStack {
            table: t,
            length: n,
            index: i,
            next: self.stack.take(),
        };

        self.stack = if let Some(mut s) = s {
            *s = target;
            Some(s)
        } else {
            Some(Box::new(target))
        };
    }

    fn recover_state(&mut self, mut n: usize) {
        while let Some(ref mut s) = self.stack {
            if self.index + s.length < n {
                // the upper half of this bin in the next table is still to do
                self.index += s.length;
                break;
            }

            let mut s = self.stack.take().expect("while let Some");
            n = s.length;
            self.index = s.index;
            self.table = Some(s.table);
            self.stack = s.next.take();

            // keep the frame around for the next time we descend
            s.next = self.spare.take();
            self.spare = Some(s);
        }

        if self.stack.is_none() {
            self.index += self.base_size;
            if self.index >= n {
                self.base_index += 1;
                self.index = self.base_index;
            }
        }
    }
}

impl<'g, K, V> Iterator for NodeIter<'g, K, V> {
    type Item = &'g Node<K, V>;
    fn next(&mut self) -> Option<Self::Item> {
        let mut e = None;
        if let Some(prev) = self.prev {
            let next = prev.next.load(Ordering::SeqCst, self.guard);
            // safety: nodes reached under our guard are not freed until after it is dropped
            if let Some(next) = unsafe { next.as_ref() } {
                e = Some(
                    next.as_node()
                        .expect("entries after the head are always Nodes"),
                );
            }
        }

        loop {
            if e.is_some() {
                self.prev = e;
                return e;
            }

            let t = match self.table {
                Some(t) if self.base_index < self.base_limit && self.index < t.len() => t,
                _ => {
                    self.prev = None;
                    return None;
                }
            };

            let i = self.index;
            let n = t.len();
            let bin = t.bin(i, self.guard);
            // safety: as above
            if let Some(bin) = unsafe { bin.as_ref() } {
                match **bin {
                    BinEntry::Moved => {
                        // safety: see the comment on Table::next_table
                        self.table = Some(&**unsafe { t.next_table(self.guard).deref() });
                        self.prev = None;
                        // make sure we can get back "up" to where we're at
                        self.push_state(t, i, n);
                        continue;
                    }
                    BinEntry::Node(ref node) => {
                        e = Some(node);
                    }
                }
            }

            if self.stack.is_some() {
                self.recover_state(n);
            } else {
                self.index = i + self.base_size;
                if self.index >= n {
                    self.base_index += 1;
                    self.index = self.base_index;
                }
            }
        }
    }
}

#[derive(Debug)]
struct TableStack<'g, K, V> {
    length: usize,
    index: usize,
    table: &'g Table<K, V>,
    next: Option<Box<TableStack<'g, K, V>>>,
}
