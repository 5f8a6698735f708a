//! The base page allocator: every reservation and commit the recycler makes goes
//! through [`VirtualAllocWrapper`], or through the pre-reserved region which shares
//! its commit path.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::util::error::PageError;
use crate::util::os::memory::{self, MmapAnnotation, MmapProtection};
use crate::util::Address;

/// What an allocation call should do with the range.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AllocationType {
    /// Reserve address space only.
    Reserve,
    /// Commit part of an existing reservation. The caller passes the address.
    Commit,
    /// Reserve and commit in one call.
    ReserveAndCommit,
}

impl AllocationType {
    pub fn reserves(self) -> bool {
        matches!(self, AllocationType::Reserve | AllocationType::ReserveAndCommit)
    }

    pub fn commits(self) -> bool {
        matches!(self, AllocationType::Commit | AllocationType::ReserveAndCommit)
    }
}

/// What a free call should do with the range.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FreeType {
    /// Return the physical pages but keep the reservation. The size must be given.
    Decommit,
    /// Return the whole reservation. The size must be zero; the reservation's own size is used.
    Release,
}

thread_local! {
    static DYNAMIC_CODE_ALLOWED: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread may currently create executable mappings.
pub fn dynamic_code_generation_allowed() -> bool {
    DYNAMIC_CODE_ALLOWED.with(|c| c.get())
}

/// Enables dynamic code generation for the current thread for the guard's
/// lifetime and restores the previous policy when dropped.
pub struct AutoEnableDynamicCodeGen {
    previous: bool,
}

impl AutoEnableDynamicCodeGen {
    pub fn new(enable: bool) -> Self {
        let previous = DYNAMIC_CODE_ALLOWED.with(|c| c.replace(c.get() || enable));
        if enable && !previous {
            trace!("Dynamic code generation enabled on this thread");
        }
        AutoEnableDynamicCodeGen { previous }
    }
}

impl Drop for AutoEnableDynamicCodeGen {
    fn drop(&mut self) {
        DYNAMIC_CODE_ALLOWED.with(|c| c.set(self.previous));
    }
}

/// Commit `[start, start + size)` with `prot`.
///
/// With the code-integrity guard on, custom-heap pages are first committed
/// writable and executable and then re-protected to what the caller asked for.
/// The executable commit is what makes the OS set up its code-integrity state
/// for the range; committing non-executable first would leave it unset.
pub(crate) fn commit_pages(
    start: Address,
    size: usize,
    prot: MmapProtection,
    is_custom_heap: bool,
    code_integrity_guard: bool,
) -> std::io::Result<()> {
    let _dynamic_code = AutoEnableDynamicCodeGen::new(is_custom_heap);
    if is_custom_heap && code_integrity_guard {
        memory::commit(start, size, MmapProtection::ReadWriteExec)?;
        if prot != MmapProtection::ReadWriteExec {
            if let Err(e) = memory::mprotect(start, size, prot) {
                let _ = memory::decommit(start, size);
                return Err(e);
            }
        }
        Ok(())
    } else {
        memory::commit(start, size, prot)
    }
}

pub struct VirtualAllocWrapper {
    /// Reservation start -> size. Needed because a release passes no size.
    reservations: Mutex<HashMap<Address, usize>>,
    code_integrity_guard: bool,
}

impl VirtualAllocWrapper {
    pub fn new(code_integrity_guard: bool) -> Self {
        VirtualAllocWrapper {
            reservations: Mutex::new(HashMap::new()),
            code_integrity_guard,
        }
    }

    /// Reserve and/or commit `size` bytes. `address_hint` is where to reserve, or
    /// for [`AllocationType::Commit`] the start of the range to commit.
    pub fn alloc(
        &self,
        address_hint: Option<Address>,
        size: usize,
        allocation_type: AllocationType,
        prot: MmapProtection,
        is_custom_heap: bool,
    ) -> Result<Address, PageError> {
        debug_assert!(size > 0);
        let start = if allocation_type.reserves() {
            let start = memory::mmap_reserve(
                address_hint,
                size,
                &if is_custom_heap {
                    MmapAnnotation::Misc { name: "custom-heap" }
                } else {
                    MmapAnnotation::Segment
                },
            )?;
            self.reservations.lock().unwrap().insert(start, size);
            start
        } else {
            address_hint.ok_or(PageError::InvalidRange)?
        };

        if allocation_type.commits() {
            if let Err(e) =
                commit_pages(start, size, prot, is_custom_heap, self.code_integrity_guard)
            {
                if allocation_type.reserves() {
                    let _ = self.free(start, 0, FreeType::Release);
                }
                return Err(e.into());
            }
        }
        trace!(
            "VirtualAlloc {:?} {} bytes at {} ({:?})",
            allocation_type,
            size,
            start,
            prot
        );
        Ok(start)
    }

    pub fn free(&self, address: Address, size: usize, free_type: FreeType) -> Result<(), PageError> {
        match free_type {
            FreeType::Decommit => {
                if size == 0 {
                    return Err(PageError::InvalidRange);
                }
                memory::decommit(address, size)?;
            }
            FreeType::Release => {
                if size != 0 {
                    return Err(PageError::InvalidRange);
                }
                let size = self
                    .reservations
                    .lock()
                    .unwrap()
                    .remove(&address)
                    .ok_or(PageError::InvalidRange)?;
                memory::munmap(address, size)?;
            }
        }
        trace!("VirtualFree {:?} at {}", free_type, address);
        Ok(())
    }

    /// Number of live reservations.
    pub fn reservation_count(&self) -> usize {
        self.reservations.lock().unwrap().len()
    }
}

impl Drop for VirtualAllocWrapper {
    fn drop(&mut self) {
        let reservations = std::mem::take(&mut *self.reservations.lock().unwrap());
        for (start, size) in reservations {
            let _ = memory::munmap(start, size);
        }
    }
}
