//! Weak references. A handle shares one entry per target; the sweep clears
//! the entry when its target did not survive, and forgets entries nobody
//! holds a handle to anymore.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::util::Address;

#[derive(Debug)]
struct WeakEntry {
    target: AtomicUsize,
}

/// A weak handle to a recycler object. Clones share the same entry.
#[derive(Clone, Debug)]
pub struct WeakReference(Arc<WeakEntry>);

impl WeakReference {
    /// The raw target, without the bookkeeping a read during marking needs.
    /// Use [`crate::recycler::Recycler::get_weak_reference`] from the mutator.
    pub(crate) fn peek(&self) -> Option<Address> {
        let target = self.0.target.load(Ordering::Acquire);
        // SAFETY: zero is the cleared state; anything else was a valid object address.
        (target != 0).then(|| unsafe { Address::from_usize(target) })
    }

    pub fn ptr_eq(&self, other: &WeakReference) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[derive(Default)]
pub struct WeakReferenceMap {
    entries: HashMap<Address, Arc<WeakEntry>>,
}

impl WeakReferenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The handle for `target`, shared with any earlier one.
    pub fn get_or_create(&mut self, target: Address) -> WeakReference {
        let entry = self.entries.entry(target).or_insert_with(|| {
            Arc::new(WeakEntry {
                target: AtomicUsize::new(target.as_usize()),
            })
        });
        WeakReference(entry.clone())
    }

    /// Clear every entry whose target `is_live` rejects, and drop entries
    /// only the map still holds. Returns the number of cleared entries.
    pub fn sweep<F: Fn(Address) -> bool>(&mut self, is_live: F) -> usize {
        let mut cleared = 0;
        self.entries.retain(|target, entry| {
            if !is_live(*target) {
                entry.target.store(0, Ordering::Release);
                cleared += 1;
                return false;
            }
            Arc::strong_count(entry) > 1
        });
        cleared
    }

    /// Shutdown: every target is about to go away.
    pub fn clear_all(&mut self) {
        for entry in self.entries.values() {
            entry.target.store(0, Ordering::Release);
        }
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(v: usize) -> Address {
        unsafe { Address::from_usize(v) }
    }

    #[test]
    fn handles_are_shared_per_target() {
        let mut map = WeakReferenceMap::new();
        let a = map.get_or_create(addr(0x1000));
        let b = map.get_or_create(addr(0x1000));
        assert!(a.ptr_eq(&b));
        assert_eq!(map.len(), 1);
        assert_eq!(a.peek(), Some(addr(0x1000)));
    }

    #[test]
    fn dead_targets_are_cleared() {
        let mut map = WeakReferenceMap::new();
        let live = map.get_or_create(addr(0x1000));
        let dead = map.get_or_create(addr(0x2000));
        assert_eq!(map.sweep(|target| target == addr(0x1000)), 1);
        assert_eq!(dead.peek(), None);
        assert_eq!(live.peek(), Some(addr(0x1000)));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn unreferenced_entries_are_pruned() {
        let mut map = WeakReferenceMap::new();
        drop(map.get_or_create(addr(0x1000)));
        assert_eq!(map.sweep(|_| true), 0);
        assert!(map.is_empty());
    }
}
