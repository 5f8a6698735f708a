pub mod address;
pub mod bit_vector;
pub mod constants;
pub mod conversions;
pub mod error;
pub mod fatal;
pub mod heap;
pub mod logger;
pub mod mark;
pub mod options;
pub mod os;
#[cfg(any(test, feature = "test_private"))]
pub mod test_util;
pub mod write_barrier;

pub use self::address::Address;
pub use self::address::ByteSize;
