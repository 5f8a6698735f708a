//! The process-wide write-barrier card table.
//!
//! One byte per 4K card. The table covers the whole address space but is split
//! into 1GB sections whose card bytes are only mapped once the page allocator
//! reserves a segment inside them. A write to an unmapped section cannot be a
//! write to a heap object, so the barrier ignores it.
//!
//! Each card byte carries two independent dirty bits:
//! - [`CARD_RESCAN`] is consumed by the rescan that ends a concurrent mark. It is
//!   cleared for the whole heap when marks are reset and per card as the rescan
//!   processes it.
//! - [`CARD_SINCE_GC`] is the remembered set of a partial collection. It survives
//!   until the next collection has used it to find roots.
//!
//! Writers only ever store "both bits set", so a racing rescan can at worst see a
//! card one pass late, never lose it.

use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::util::constants::*;
use crate::util::conversions;
use crate::util::os::memory::{self, MmapAnnotation, MmapProtection};
use crate::util::Address;

/// Dirty since the current mark started.
pub const CARD_RESCAN: u8 = 0b01;
/// Dirty since the previous collection finished finding roots.
pub const CARD_SINCE_GC: u8 = 0b10;
const CARD_DIRTY: u8 = CARD_RESCAN | CARD_SINCE_GC;

const LOG_BYTES_IN_SECTION: u8 = 30;
const BYTES_IN_SECTION: usize = 1 << LOG_BYTES_IN_SECTION;
const SECTION_COUNT: usize = 1 << (LOG_ADDRESS_SPACE - LOG_BYTES_IN_SECTION);
const CARDS_IN_SECTION: usize = 1 << (LOG_BYTES_IN_SECTION - LOG_BYTES_IN_CARD);

pub struct CardTable {
    sections: Box<[AtomicPtr<AtomicU8>]>,
    /// Serializes section creation. Lookups never take it.
    commit_lock: Mutex<()>,
    committed_sections: AtomicUsize,
}

impl CardTable {
    pub fn new() -> Self {
        CardTable {
            sections: (0..SECTION_COUNT)
                .map(|_| AtomicPtr::new(std::ptr::null_mut()))
                .collect(),
            commit_lock: Mutex::new(()),
            committed_sections: AtomicUsize::new(0),
        }
    }

    fn section_index(addr: Address) -> usize {
        addr >> LOG_BYTES_IN_SECTION as usize
    }

    /// Make sure the cards covering `[start, start + size)` are backed by memory.
    /// Called by the page allocator before it hands out a new segment.
    pub fn ensure_committed(&self, start: Address, size: usize) -> std::io::Result<()> {
        if size == 0 {
            return Ok(());
        }
        let first = Self::section_index(start);
        let last = Self::section_index(start + (size - 1));
        for index in first..=last {
            if index >= SECTION_COUNT {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{} is outside the card table", start),
                ));
            }
            if !self.sections[index].load(Ordering::Acquire).is_null() {
                continue;
            }
            let _guard = self.commit_lock.lock().unwrap();
            if !self.sections[index].load(Ordering::Acquire).is_null() {
                continue;
            }
            let cards = memory::dzmmap(
                None,
                CARDS_IN_SECTION,
                MmapProtection::ReadWrite,
                &MmapAnnotation::CardTable,
            )?;
            self.sections[index].store(cards.to_mut_ptr(), Ordering::Release);
            self.committed_sections.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Card table section {} committed for {}",
                index,
                unsafe { Address::from_usize(index << LOG_BYTES_IN_SECTION) }
            );
        }
        Ok(())
    }

    pub fn committed_sections(&self) -> usize {
        self.committed_sections.load(Ordering::Relaxed)
    }

    fn card(&self, addr: Address) -> Option<&AtomicU8> {
        let index = Self::section_index(addr);
        let section = self.sections.get(index)?.load(Ordering::Acquire);
        if section.is_null() {
            return None;
        }
        let offset = (addr & (BYTES_IN_SECTION - 1)) >> LOG_BYTES_IN_CARD;
        // SAFETY: the section holds CARDS_IN_SECTION bytes and is never unmapped while `self` lives.
        Some(unsafe { &*section.add(offset) })
    }

    /// Is `addr` covered by a committed section?
    pub fn covers(&self, addr: Address) -> bool {
        self.card(addr).is_some()
    }

    /// Record a write to `addr`. Returns false if the address is not in any
    /// memory the page allocator handed out.
    #[inline(always)]
    pub fn set_dirty(&self, addr: Address) -> bool {
        match self.card(addr) {
            Some(card) => {
                card.store(CARD_DIRTY, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn is_dirty(&self, addr: Address, bit: u8) -> bool {
        self.card(addr)
            .is_some_and(|card| card.load(Ordering::Acquire) & bit != 0)
    }

    /// Clear `bit` on the card containing `addr`. Returns whether it was set.
    /// The bit is cleared before the caller reads the card's memory, so a write
    /// racing with the read dirties the card again.
    pub fn test_and_clear(&self, addr: Address, bit: u8) -> bool {
        self.card(addr)
            .is_some_and(|card| card.fetch_and(!bit, Ordering::AcqRel) & bit != 0)
    }

    /// Clear `bit` on every card overlapping `[start, start + size)`.
    pub fn clear_range(&self, start: Address, size: usize, bit: u8) {
        self.for_each_card(start, size, |card| {
            card.fetch_and(!bit, Ordering::AcqRel);
        });
    }

    /// Count cards overlapping `[start, start + size)` with `bit` set.
    pub fn count_dirty(&self, start: Address, size: usize, bit: u8) -> usize {
        let mut count = 0;
        self.for_each_card(start, size, |card| {
            if card.load(Ordering::Acquire) & bit != 0 {
                count += 1;
            }
        });
        count
    }

    fn for_each_card<F: FnMut(&AtomicU8)>(&self, start: Address, size: usize, mut f: F) {
        if size == 0 {
            return;
        }
        let first = conversions::address_to_card_index(start);
        let last = conversions::address_to_card_index(start + (size - 1));
        for index in first..=last {
            if let Some(card) = self.card(conversions::card_index_to_address(index)) {
                f(card);
            }
        }
    }
}

impl Default for CardTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CardTable {
    fn drop(&mut self) {
        for section in self.sections.iter() {
            let ptr = section.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if !ptr.is_null() {
                let _ = memory::munmap(Address::from_mut_ptr(ptr), CARDS_IN_SECTION);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::os::memory::mmap_reserve;

    fn reserve_test_range(size: usize) -> Address {
        mmap_reserve(None, size, crate::mmap_anno_test!()).unwrap()
    }

    #[test]
    fn unmapped_sections_ignore_writes() {
        let table = CardTable::new();
        let addr = reserve_test_range(BYTES_IN_PAGE);
        assert!(!table.set_dirty(addr));
        assert!(!table.is_dirty(addr, CARD_RESCAN));
        memory::munmap(addr, BYTES_IN_PAGE).unwrap();
    }

    #[test]
    fn barrier_sets_both_bits() {
        let table = CardTable::new();
        let addr = reserve_test_range(4 * BYTES_IN_CARD);
        table.ensure_committed(addr, 4 * BYTES_IN_CARD).unwrap();
        assert!(table.committed_sections() >= 1);

        let slot = addr + (BYTES_IN_CARD + 8);
        assert!(table.set_dirty(slot));
        assert!(table.is_dirty(slot, CARD_RESCAN));
        assert!(table.is_dirty(slot, CARD_SINCE_GC));
        assert!(!table.is_dirty(addr, CARD_RESCAN));
        assert_eq!(table.count_dirty(addr, 4 * BYTES_IN_CARD, CARD_RESCAN), 1);

        // Consuming the rescan bit leaves the remembered-set bit alone.
        assert!(table.test_and_clear(slot, CARD_RESCAN));
        assert!(!table.test_and_clear(slot, CARD_RESCAN));
        assert!(table.is_dirty(slot, CARD_SINCE_GC));

        table.clear_range(addr, 4 * BYTES_IN_CARD, CARD_SINCE_GC);
        assert_eq!(table.count_dirty(addr, 4 * BYTES_IN_CARD, CARD_SINCE_GC), 0);
        memory::munmap(addr, 4 * BYTES_IN_CARD).unwrap();
    }

    #[test]
    fn commit_is_idempotent() {
        let table = CardTable::new();
        let addr = reserve_test_range(BYTES_IN_PAGE);
        table.ensure_committed(addr, BYTES_IN_PAGE).unwrap();
        let sections = table.committed_sections();
        table.ensure_committed(addr, BYTES_IN_PAGE).unwrap();
        assert_eq!(table.committed_sections(), sections);
        memory::munmap(addr, BYTES_IN_PAGE).unwrap();
    }
}
