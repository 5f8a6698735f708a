use crate::util::constants::*;
use crate::util::Address;

/* Alignment */

pub fn is_address_aligned(addr: Address) -> bool {
    addr.is_aligned_to(BYTES_IN_ADDRESS)
}

pub fn page_align_down(address: Address) -> Address {
    address.align_down(BYTES_IN_PAGE)
}

pub fn is_page_aligned(address: Address) -> bool {
    address.is_aligned_to(BYTES_IN_PAGE)
}

pub const fn raw_align_up(val: usize, align: usize) -> usize {
    // See https://github.com/rust-lang/rust/blob/e620d0f337d0643c757bab791fc7d88d63217704/src/libcore/alloc.rs#L192
    val.wrapping_add(align).wrapping_sub(1) & !align.wrapping_sub(1)
}

pub const fn raw_align_down(val: usize, align: usize) -> usize {
    val & !align.wrapping_sub(1)
}

pub const fn raw_is_aligned(val: usize, align: usize) -> bool {
    val & align.wrapping_sub(1) == 0
}

/* Conversion */

pub const fn pages_to_bytes(pages: usize) -> usize {
    pages << LOG_BYTES_IN_PAGE
}

pub const fn bytes_to_pages_up(bytes: usize) -> usize {
    (bytes + BYTES_IN_PAGE - 1) >> LOG_BYTES_IN_PAGE
}

/// Number of allocation-granularity segments needed to hold `bytes`.
pub const fn bytes_to_granularity_segments_up(bytes: usize) -> usize {
    (bytes + BYTES_IN_ALLOCATION_GRANULARITY - 1) >> LOG_BYTES_IN_ALLOCATION_GRANULARITY
}

/// Index of the page containing `addr`, counted from address zero.
pub fn address_to_page_index(addr: Address) -> usize {
    addr >> LOG_BYTES_IN_PAGE as usize
}

pub fn page_index_to_address(index: usize) -> Address {
    unsafe { Address::from_usize(index << LOG_BYTES_IN_PAGE) }
}

/// Index of the card containing `addr`, counted from address zero.
pub fn address_to_card_index(addr: Address) -> usize {
    addr >> LOG_BYTES_IN_CARD as usize
}

pub fn card_index_to_address(index: usize) -> Address {
    unsafe { Address::from_usize(index << LOG_BYTES_IN_CARD) }
}

pub fn bytes_to_formatted_string(bytes: usize) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut i = 0;
    let mut num = bytes;
    while i < UNITS.len() - 1 {
        let new_num = num >> 10;
        if new_num == 0 {
            return format!("{}{}", num, UNITS[i]);
        }
        num = new_num;
        i += 1;
    }
    format!("{}{}", num, UNITS.last().unwrap())
}
