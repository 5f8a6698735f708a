/// log2 of the number of bits in a byte
pub const LOG_BITS_IN_BYTE: u8 = 3;
/// The number of bits in a byte
pub const BITS_IN_BYTE: usize = 1 << LOG_BITS_IN_BYTE;

/// log2 of the number of bytes in a gigabyte
pub const LOG_BYTES_IN_GBYTE: u8 = 30;
/// The number of bytes in a gigabyte
pub const BYTES_IN_GBYTE: usize = 1 << LOG_BYTES_IN_GBYTE;

/// log2 of the number of bytes in a megabyte
pub const LOG_BYTES_IN_MBYTE: u8 = 20;
/// The number of bytes in a megabyte
pub const BYTES_IN_MBYTE: usize = 1 << LOG_BYTES_IN_MBYTE;

/// log2 of the number of bytes in a kilobyte
pub const LOG_BYTES_IN_KBYTE: u8 = 10;
/// The number of bytes in a kilobyte
pub const BYTES_IN_KBYTE: usize = 1 << LOG_BYTES_IN_KBYTE;

#[cfg(target_pointer_width = "32")]
/// log2 of the number of bytes in an address
pub const LOG_BYTES_IN_ADDRESS: u8 = 2;
#[cfg(target_pointer_width = "64")]
/// log2 of the number of bytes in an address
pub const LOG_BYTES_IN_ADDRESS: u8 = 3;
/// The number of bytes in an address
pub const BYTES_IN_ADDRESS: usize = 1 << LOG_BYTES_IN_ADDRESS;
/// log2 of the number of bytes in a word
pub const LOG_BYTES_IN_WORD: u8 = LOG_BYTES_IN_ADDRESS;
/// The number of bytes in a word
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;
/// log2 of the number of bits in a word
pub const LOG_BITS_IN_WORD: u8 = LOG_BITS_IN_BYTE + LOG_BYTES_IN_WORD;
/// The number of bits in a word
pub const BITS_IN_WORD: usize = 1 << LOG_BITS_IN_WORD;

/// log2 of the number of bytes in a page
pub const LOG_BYTES_IN_PAGE: u8 = 12;
/// The number of bytes in a page
pub const BYTES_IN_PAGE: usize = 1 << LOG_BYTES_IN_PAGE;

/// log2 of the OS allocation granularity. Reservations handed out by the
/// pre-reserved region are multiples of this.
pub const LOG_BYTES_IN_ALLOCATION_GRANULARITY: u8 = 16;
/// The OS allocation granularity (64K).
pub const BYTES_IN_ALLOCATION_GRANULARITY: usize = 1 << LOG_BYTES_IN_ALLOCATION_GRANULARITY;

/// log2 of the number of pages in a page-allocator segment.
pub const LOG_PAGES_IN_SEGMENT: u8 = 8;
/// The number of pages in a page-allocator segment (1MB with 4K pages).
pub const PAGES_IN_SEGMENT: usize = 1 << LOG_PAGES_IN_SEGMENT;
/// The number of bytes in a page-allocator segment.
pub const BYTES_IN_SEGMENT: usize = PAGES_IN_SEGMENT << LOG_BYTES_IN_PAGE;
/// Requests above this many pages get a dedicated segment of their own.
pub const MAX_PAGES_IN_SHARED_SEGMENT: usize = 32;

/// log2 of the number of bytes covered by one write-barrier card.
pub const LOG_BYTES_IN_CARD: u8 = 12;
/// The number of bytes covered by one write-barrier card.
pub const BYTES_IN_CARD: usize = 1 << LOG_BYTES_IN_CARD;

/// log2 of the size of the address space the card table covers.
#[cfg(target_pointer_width = "64")]
pub const LOG_ADDRESS_SPACE: u8 = 48;
#[cfg(target_pointer_width = "32")]
pub const LOG_ADDRESS_SPACE: u8 = 32;

/// Object alignment. Every heap object starts at a multiple of this.
pub const LOG_OBJECT_GRANULARITY: u8 = 4;
/// Object alignment in bytes.
pub const OBJECT_GRANULARITY: usize = 1 << LOG_OBJECT_GRANULARITY;

/// Sentinel for an infinite wait.
pub const INFINITE: Option<std::time::Duration> = None;
