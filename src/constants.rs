//! Core constants and configuration limits for quantum-alloc.

use static_assertions::const_assert;

/// Order of bytes per 64-bit word (2^3 = 8 bytes).
pub const BYTES_PER_WORD_ORDER: u32 = 3;

/// Order of bits per 64-bit word (2^6 = 64 bits).
pub const BITS_PER_WORD_ORDER: u32 = 6;

/// Number of bytes per word.
pub const BYTES_PER_WORD: usize = 1 << BYTES_PER_WORD_ORDER;

/// Number of bits per word.
pub const BITS_PER_WORD: usize = 1 << BITS_PER_WORD_ORDER;

/// Mask for the bit index within a word.
pub const BITS_MASK: usize = BITS_PER_WORD - 1;

/// All sixty-four bits set.
pub const ALL_ONES: u64 = !0u64;

/// Order of the reservation/commit page size. Hard-wired to 4K pages.
pub const PAGE_SIZE_ORDER: u32 = 12;

/// Reservation and commit granularity in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SIZE_ORDER;

/// Order of the maximum hardware memory address (2^52).
pub const MAX_ADDRESS_ORDER: u32 = 52;

/// Order of the maximum allocation supported (256T).
pub const MAX_ALLOCATION_ORDER: u32 = MAX_ADDRESS_ORDER - 4;

/// Maximum value for a size order.
pub const MAX_ORDER: u32 = BITS_PER_WORD as u32;

/// Maximum allocation size in bytes.
pub const MAX_ALLOCATION_SIZE: u64 = 1 << MAX_ALLOCATION_ORDER;

/// Maximum quanta per partition.
///
/// Keeps every quantum registry at or under 16K bits so that even a
/// worst-case full scan stays short.
pub const MAX_PARTITION_QUANTUM: usize = 16 * 1024;

/// Upper bound on the number of bits managed by a single registry.
pub const MAX_REGISTRY_BIT_COUNT: usize = MAX_PARTITION_QUANTUM;

/// Number of words backing a maximally sized registry.
pub const MAX_REGISTRY_WORD_COUNT: usize = MAX_REGISTRY_BIT_COUNT / BITS_PER_WORD;

/// Number of quantum allocator tiers (small, medium, large).
pub const MAX_QUANTUM_ALLOCATORS: usize = 3;

/// Number of consecutive size orders covered by one tier.
pub const MAX_QUANTUM_ALLOCATOR_ORDERS: u32 = 8;

/// Order of the smallest quantum, 8 bytes. Also the minimum allocation size.
pub const SMALLEST_SIZE_ORDER: u32 = 3;

/// Order of the largest quantum, 64M.
pub const LARGEST_SIZE_ORDER: u32 = SMALLEST_SIZE_ORDER
    + MAX_QUANTUM_ALLOCATORS as u32 * MAX_QUANTUM_ALLOCATOR_ORDERS
    - 1;

/// Maximum subdivision degree accepted by the fit allocation API.
///
/// Degree 1 is a plain allocate with 25% average internal fragmentation,
/// 2 is 12.5%, 3 is 6.25%, 4 is 3.125%.
pub const MAX_FIT_DEGREE: u32 = 4;

/// Maximum number of bytes in a shared link name, including the NUL.
pub const MAX_LINK_NAME: usize = 256;

/// Maximum bytes of side data per allocation.
pub const MAX_SIDE_DATA_SIZE: usize = BYTES_PER_WORD;

/// Length of the stats count/size arrays.
pub const STATS_SIZE: usize = 64;

const_assert!(LARGEST_SIZE_ORDER == 26);
const_assert!(MAX_REGISTRY_WORD_COUNT == 256);
const_assert!(MAX_ALLOCATION_ORDER == 48);
const_assert!(MAX_PARTITION_QUANTUM.is_power_of_two());
