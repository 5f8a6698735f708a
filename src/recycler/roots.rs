//! Roots the recycler holds on the host's behalf: pinned objects and guest
//! arenas. Both are read by the background marker while the mutator keeps
//! pinning and unpinning, so they live behind locks in an `Arc` of their own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use crate::util::Address;
use crate::vm::{scan_words_conservatively, ObjectTracer};

/// Handle for a registered guest arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GuestArenaId(u64);

struct GuestArena {
    id: GuestArenaId,
    start: Address,
    size: usize,
}

#[derive(Default)]
pub struct RootSet {
    /// Pin counts. Counts change under the read lock; entries are only added
    /// or removed under the write lock.
    pinned: RwLock<HashMap<Address, AtomicUsize>>,
    arenas: RwLock<Vec<GuestArena>>,
    next_arena: AtomicU64,
    /// A root scan is running. Entries that drop to zero pins stay in the map
    /// until it is over.
    scanning: AtomicBool,
    pending_unpin: Mutex<Vec<Address>>,
}

impl RootSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the new pin count.
    pub fn pin(&self, object: Address) -> usize {
        {
            let pinned = self.pinned.read().unwrap();
            if let Some(count) = pinned.get(&object) {
                return count.fetch_add(1, Ordering::AcqRel) + 1;
            }
        }
        let mut pinned = self.pinned.write().unwrap();
        pinned
            .entry(object)
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::AcqRel)
            + 1
    }

    /// Returns the new pin count, or `None` if the object was not pinned.
    pub fn unpin(&self, object: Address) -> Option<usize> {
        let remaining = {
            let pinned = self.pinned.read().unwrap();
            let count = pinned.get(&object)?;
            let mut current = count.load(Ordering::Acquire);
            loop {
                if current == 0 {
                    return None;
                }
                match count.compare_exchange_weak(current, current - 1, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => break current - 1,
                    Err(actual) => current = actual,
                }
            }
        };
        if remaining == 0 {
            if self.scanning.load(Ordering::Acquire) {
                trace!("Deferring unpin of {} until the root scan is over", object);
                self.pending_unpin.lock().unwrap().push(object);
            } else {
                self.remove_if_unpinned(object);
            }
        }
        Some(remaining)
    }

    fn remove_if_unpinned(&self, object: Address) {
        let mut pinned = self.pinned.write().unwrap();
        if pinned
            .get(&object)
            .is_some_and(|count| count.load(Ordering::Acquire) == 0)
        {
            pinned.remove(&object);
        }
    }

    pub fn pin_count(&self, object: Address) -> usize {
        self.pinned
            .read()
            .unwrap()
            .get(&object)
            .map_or(0, |count| count.load(Ordering::Acquire))
    }

    /// Pinned objects, counting entries whose removal is still pending.
    pub fn pinned_len(&self) -> usize {
        self.pinned.read().unwrap().len()
    }

    /// Remove the entries whose unpin was deferred, unless they were pinned
    /// again since. Returns how many were looked at.
    pub fn drain_pending_unpins(&self) -> usize {
        debug_assert!(!self.scanning.load(Ordering::Acquire));
        let pending = std::mem::take(&mut *self.pending_unpin.lock().unwrap());
        for object in pending.iter() {
            self.remove_if_unpinned(*object);
        }
        pending.len()
    }

    pub fn add_arena(&self, start: Address, size: usize) -> GuestArenaId {
        let id = GuestArenaId(self.next_arena.fetch_add(1, Ordering::Relaxed));
        self.arenas.write().unwrap().push(GuestArena { id, start, size });
        debug!("Guest arena {:?} at {} ({} bytes)", id, start, size);
        id
    }

    /// Blocks while a root scan is reading the arenas, so the caller may free
    /// the arena's memory once this returns.
    pub fn remove_arena(&self, id: GuestArenaId) -> bool {
        let mut arenas = self.arenas.write().unwrap();
        match arenas.iter().position(|arena| arena.id == id) {
            Some(index) => {
                arenas.swap_remove(index);
                true
            }
            None => false,
        }
    }

    pub fn arena_count(&self) -> usize {
        self.arenas.read().unwrap().len()
    }

    /// Report the pinned objects, then every word of every guest arena.
    /// Returns the number of pinned objects reported.
    pub fn scan(&self, tracer: &mut dyn ObjectTracer) -> usize {
        self.scanning.store(true, Ordering::Release);
        let pinned: Vec<Address> = self.pinned.read().unwrap().keys().copied().collect();
        for object in pinned.iter() {
            tracer.trace_candidate(*object);
        }
        {
            let arenas = self.arenas.read().unwrap();
            for arena in arenas.iter() {
                // SAFETY: the host keeps a registered arena mapped until
                // `remove_arena` returns, which waits for this read lock.
                unsafe { scan_words_conservatively(arena.start, arena.start + arena.size, tracer) };
            }
        }
        self.scanning.store(false, Ordering::Release);
        pinned.len()
    }
}

#[cfg(target_arch = "x86_64")]
const SPILLED_REGISTERS: usize = 6;
#[cfg(not(target_arch = "x86_64"))]
const SPILLED_REGISTERS: usize = 0;

/// Copy the callee-saved registers somewhere the scan can see them. Anything
/// the compiler kept in a register above this frame is found this way.
#[cfg(target_arch = "x86_64")]
#[inline(never)]
fn spill_registers() -> [usize; SPILLED_REGISTERS] {
    let mut registers = [0usize; SPILLED_REGISTERS];
    // SAFETY: writes exactly six words into `registers`.
    unsafe {
        std::arch::asm!(
            "mov [{0}], rbx",
            "mov [{0} + 8], rbp",
            "mov [{0} + 16], r12",
            "mov [{0} + 24], r13",
            "mov [{0} + 32], r14",
            "mov [{0} + 40], r15",
            in(reg) registers.as_mut_ptr(),
            options(nostack, preserves_flags),
        );
    }
    registers
}

#[cfg(not(target_arch = "x86_64"))]
fn spill_registers() -> [usize; SPILLED_REGISTERS] {
    []
}

/// Conservatively scan the spilled registers and the live part of the stack
/// `[low, high)`. Must run on the thread that owns the stack.
#[inline(never)]
pub(crate) fn scan_stack(low: Address, high: Address, tracer: &mut dyn ObjectTracer) -> usize {
    let registers = spill_registers();
    for word in registers.iter() {
        // SAFETY: any value is a valid candidate; the tracer checks it.
        tracer.trace_candidate(unsafe { Address::from_usize(*word) });
    }
    // Frames below this one are dead.
    let here = Address::from_ref(&registers);
    let start = if here.is_in(low, high) { here } else { low };
    // SAFETY: `[start, high)` is the live part of this thread's stack.
    unsafe { scan_words_conservatively(start, high, tracer) };
    (high - start) + registers.len() * std::mem::size_of::<usize>()
}
