//! Fixed-size bit vectors.
//!
//! [`BitVector`] is owned by a single thread (free bits, segment maps).
//! [`AtomicBitVector`] is shared between the mutator and marking threads (mark bits).

use std::sync::atomic::{AtomicU64, Ordering};

const LOG_BITS_IN_UNIT: usize = 6;
const BITS_IN_UNIT: usize = 1 << LOG_BITS_IN_UNIT;

fn units_for(bits: usize) -> usize {
    (bits + BITS_IN_UNIT - 1) >> LOG_BITS_IN_UNIT
}

fn locate(index: usize) -> (usize, u64) {
    (index >> LOG_BITS_IN_UNIT, 1u64 << (index & (BITS_IN_UNIT - 1)))
}

#[derive(Clone, PartialEq, Eq)]
pub struct BitVector {
    units: Box<[u64]>,
    len: usize,
}

impl BitVector {
    /// Create a bit vector of `len` bits, all clear.
    pub fn new(len: usize) -> Self {
        BitVector {
            units: vec![0u64; units_for(len)].into_boxed_slice(),
            len,
        }
    }

    /// Create a bit vector of `len` bits, all set.
    pub fn new_all_set(len: usize) -> Self {
        let mut bv = Self::new(len);
        bv.set_range(0, len);
        bv
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn test(&self, index: usize) -> bool {
        debug_assert!(index < self.len);
        let (unit, mask) = locate(index);
        self.units[unit] & mask != 0
    }

    pub fn set(&mut self, index: usize) {
        debug_assert!(index < self.len);
        let (unit, mask) = locate(index);
        self.units[unit] |= mask;
    }

    pub fn clear(&mut self, index: usize) {
        debug_assert!(index < self.len);
        let (unit, mask) = locate(index);
        self.units[unit] &= !mask;
    }

    /// Set `count` bits starting at `start`.
    pub fn set_range(&mut self, start: usize, count: usize) {
        for i in start..start + count {
            self.set(i);
        }
    }

    /// Clear `count` bits starting at `start`.
    pub fn clear_range(&mut self, start: usize, count: usize) {
        for i in start..start + count {
            self.clear(i);
        }
    }

    pub fn clear_all(&mut self) {
        self.units.iter_mut().for_each(|u| *u = 0);
    }

    /// Are all `count` bits from `start` set?
    pub fn all_set_in_range(&self, start: usize, count: usize) -> bool {
        (start..start + count).all(|i| self.test(i))
    }

    /// Are all `count` bits from `start` clear?
    pub fn all_clear_in_range(&self, start: usize, count: usize) -> bool {
        (start..start + count).all(|i| !self.test(i))
    }

    pub fn count(&self) -> usize {
        self.units.iter().map(|u| u.count_ones() as usize).sum()
    }

    pub fn count_in_range(&self, start: usize, count: usize) -> usize {
        (start..start + count).filter(|i| self.test(*i)).count()
    }

    /// Find the first run of `count` consecutive set bits at or after `from`.
    /// Returns the index of the first bit of the run.
    pub fn first_set_run(&self, from: usize, count: usize) -> Option<usize> {
        if count == 0 || count > self.len {
            return None;
        }
        let mut run_start = from;
        let mut run_len = 0;
        let mut i = from;
        while i < self.len {
            let (unit, _) = locate(i);
            // Skip whole empty units.
            if i & (BITS_IN_UNIT - 1) == 0 && self.units[unit] == 0 {
                run_len = 0;
                i += BITS_IN_UNIT;
                run_start = i;
                continue;
            }
            if self.test(i) {
                if run_len == 0 {
                    run_start = i;
                }
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            } else {
                run_len = 0;
            }
            i += 1;
        }
        None
    }

    /// Iterate over the indices of set bits.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |i| self.test(*i))
    }
}

impl std::fmt::Debug for BitVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BitVector({}/{} set)", self.count(), self.len)
    }
}

/// A bit vector that can be set concurrently from several threads.
pub struct AtomicBitVector {
    units: Box<[AtomicU64]>,
    len: usize,
}

impl AtomicBitVector {
    pub fn new(len: usize) -> Self {
        AtomicBitVector {
            units: (0..units_for(len)).map(|_| AtomicU64::new(0)).collect(),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn test(&self, index: usize) -> bool {
        debug_assert!(index < self.len);
        let (unit, mask) = locate(index);
        self.units[unit].load(Ordering::Acquire) & mask != 0
    }

    /// Set the bit. Returns true if the bit was already set.
    pub fn test_and_set(&self, index: usize) -> bool {
        debug_assert!(index < self.len);
        let (unit, mask) = locate(index);
        // Skip the RMW if someone already marked it.
        if self.units[unit].load(Ordering::Relaxed) & mask != 0 {
            return true;
        }
        self.units[unit].fetch_or(mask, Ordering::AcqRel) & mask != 0
    }

    pub fn set(&self, index: usize) {
        self.test_and_set(index);
    }

    pub fn clear(&self, index: usize) {
        debug_assert!(index < self.len);
        let (unit, mask) = locate(index);
        self.units[unit].fetch_and(!mask, Ordering::AcqRel);
    }

    pub fn clear_all(&self) {
        for u in self.units.iter() {
            u.store(0, Ordering::Release);
        }
    }

    pub fn count(&self) -> usize {
        self.units
            .iter()
            .map(|u| u.load(Ordering::Acquire).count_ones() as usize)
            .sum()
    }
}
