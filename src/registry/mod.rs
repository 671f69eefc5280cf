//! Atomic bitmap registries.
//!
//! A registry tracks the in-use/free state of up to 16K indexable elements
//! (quanta, partitions or slab slots) with one atomic bit each, plus a
//! cached lowest-free-word hint that makes the common claim constant time.

mod iter;
#[allow(clippy::module_inception)]
mod registry;

pub use iter::BulkRelease;
pub use registry::Registry;
