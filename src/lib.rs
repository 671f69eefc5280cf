//! # quantum-alloc
//!
//! Lock-free quantum based memory allocator for 64-bit address spaces.
//! A fast alternative to malloc-free when allocation throughput matters
//! across the full size range, from 8 bytes to 256T.
//!
//! ## Features
//! - Constant time allocate, deallocate, size query and base recovery
//! - No locks or monitors; coherence by atomic bitmap operations only,
//!   which also makes instances usable across processes over a named
//!   shared memory object
//! - No free lists and no metadata inside allocated blocks; all
//!   administrative state lives on the sidelines
//! - Every allocation size aligned up to 64M, with per-allocation side
//!   data and a live-allocation walk
//!
//! ## Architecture
//! Allocation requests round to a power of two and dispatch by size
//! order through an atomic roster: three quantum tiers cover orders 3
//! to 26 with bitmap-registered partitions, a slab allocator covers
//! everything above, and a null allocator absorbs the rest. Partitions
//! are promoted lazily and installed directly into the roster, so the
//! steady-state fast path is one atomic load and one bitmap claim.

mod bits;
mod constants;
mod director;
mod ffi;
mod fit;
mod partition;
mod quantum;
mod registry;
mod roster;
mod slab;
mod space;
mod system;

pub use constants::{
    LARGEST_SIZE_ORDER, MAX_ALLOCATION_ORDER, MAX_ALLOCATION_SIZE, MAX_FIT_DEGREE, MAX_LINK_NAME,
    MAX_QUANTUM_ALLOCATORS, MAX_SIDE_DATA_SIZE, SMALLEST_SIZE_ORDER, STATS_SIZE,
};
pub use director::{CreateError, Director};
pub use ffi::*;
