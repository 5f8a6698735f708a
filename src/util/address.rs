use std::fmt;
use std::ops::{Add, BitAnd, Shr, Sub};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::util::conversions;

/// size in bytes
pub type ByteSize = usize;

/// A raw machine address. Heap objects, block headers, guest arenas and
/// reserved regions are all named by one. Arithmetic is safe; anything that
/// dereferences is `unsafe`.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq)]
pub struct Address(usize);

impl Add<ByteSize> for Address {
    type Output = Address;
    fn add(self, bytes: ByteSize) -> Address {
        Address(self.0 + bytes)
    }
}

impl Sub<ByteSize> for Address {
    type Output = Address;
    fn sub(self, bytes: ByteSize) -> Address {
        Address(self.0 - bytes)
    }
}

/// The distance between two addresses. The left one must not be lower.
impl Sub<Address> for Address {
    type Output = ByteSize;
    fn sub(self, base: Address) -> ByteSize {
        debug_assert!(self.0 >= base.0, "{} is below {}", self, base);
        self.0 - base.0
    }
}

/// Offset bits under a mask.
impl BitAnd<usize> for Address {
    type Output = usize;
    fn bitand(self, mask: usize) -> usize {
        self.0 & mask
    }
}

/// Page, card and section indices.
impl Shr<usize> for Address {
    type Output = usize;
    fn shr(self, log: usize) -> usize {
        self.0 >> log
    }
}

impl Address {
    pub const ZERO: Self = Address(0);

    pub fn from_ptr<T>(ptr: *const T) -> Address {
        Address(ptr as usize)
    }

    pub fn from_mut_ptr<T>(ptr: *mut T) -> Address {
        Address(ptr as usize)
    }

    pub fn from_ref<T>(r: &T) -> Address {
        Address::from_ptr(r)
    }

    /// # Safety
    /// Nothing checks that `raw` names memory the caller may touch. Use it for
    /// addresses computed from indices or handed back by the OS.
    pub const unsafe fn from_usize(raw: usize) -> Address {
        Address(raw)
    }

    /// # Safety
    /// The address must be valid for a read of `T` and suitably aligned.
    pub unsafe fn load<T: Copy>(self) -> T {
        *(self.0 as *const T)
    }

    /// Write `value` without dropping whatever was there.
    ///
    /// # Safety
    /// The address must be valid for a write of `T` and suitably aligned.
    pub unsafe fn store<T>(self, value: T) {
        (self.0 as *mut T).write(value);
    }

    /// Load a word without tearing. Used when the collector reads object
    /// fields that a mutator may be writing concurrently.
    /// # Safety
    /// The address must be word aligned and readable.
    pub unsafe fn load_word_relaxed(self) -> Address {
        let word = &*(self.0 as *const AtomicUsize);
        Address(word.load(Ordering::Relaxed))
    }

    /// Is this address within `[start, end)`?
    pub fn is_in(self, start: Address, end: Address) -> bool {
        start <= self && self < end
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn align_up(self, align: ByteSize) -> Address {
        Address(conversions::raw_align_up(self.0, align))
    }

    pub const fn align_down(self, align: ByteSize) -> Address {
        Address(conversions::raw_align_down(self.0, align))
    }

    pub const fn is_aligned_to(self, align: usize) -> bool {
        conversions::raw_is_aligned(self.0, align)
    }

    pub fn to_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    pub fn to_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
