mod traverser;
pub(crate) use traverser::NodeIter;

use crate::reclaim::Guard;
use std::sync::atomic::Ordering;

/// An iterator over a map's entries.
///
/// See [`HashMap::iter`](crate::HashMap::iter) for details.
#[derive(Debug)]
pub struct Iter<'g, K, V> {
    pub(crate) node_iter: NodeIter<'g, K, V>,
    pub(crate) guard: &'g Guard<'g>,
}

impl<'g, K, V> Iterator for Iter<'g, K, V> {
    type Item = (&'g K, &'g V);
    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let node = self.node_iter.next()?;
            let value = node.value.load(Ordering::SeqCst, self.guard);
            // nodes without a value are being inserted or removed
            // safety: values loaded under our guard live at least as long as it does
            if let Some(value) = unsafe { value.as_ref() } {
                return Some((&node.key, &**value));
            }
        }
    }
}

/// An iterator over a map's keys.
///
/// See [`HashMap::keys`](crate::HashMap::keys) for details.
#[derive(Debug)]
pub struct Keys<'g, K, V> {
    pub(crate) node_iter: NodeIter<'g, K, V>,
    pub(crate) guard: &'g Guard<'g>,
}

impl<'g, K, V> Iterator for Keys<'g, K, V> {
    type Item = &'g K;
    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let node = self.node_iter.next()?;
            if !node.value.load(Ordering::SeqCst, self.guard).is_null() {
                return Some(&node.key);
            }
        }
    }
}

/// An iterator over a map's values.
///
/// See [`HashMap::values`](crate::HashMap::values) for details.
#[derive(Debug)]
pub struct Values<'g, K, V> {
    pub(crate) node_iter: NodeIter<'g, K, V>,
    pub(crate) guard: &'g Guard<'g>,
}

impl<'g, K, V> Iterator for Values<'g, K, V> {
    type Item = &'g V;
    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let node = self.node_iter.next()?;
            let value = node.value.load(Ordering::SeqCst, self.guard);
            // safety: values loaded under our guard live at least as long as it does
            if let Some(value) = unsafe { value.as_ref() } {
                return Some(&**value);
            }
        }
    }
}
