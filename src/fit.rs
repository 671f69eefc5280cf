//! FitSize: subdivision planning for low-fragmentation allocation.

use crate::bits::{ctz, order_to_size, size_to_order};
use crate::constants::SMALLEST_SIZE_ORDER;

/// Plans how many downsized blocks cover a request to a given
/// fragmentation degree, trading internal for external fragmentation.
///
/// Degree 1 is the plain allocate with 25% average internal
/// fragmentation, 2 is 12.5%, 3 is 6.25%, 4 is 3.125%.
///
/// Ex. a 48 byte request rounds to one 64 byte block at 25% waste.
/// At degree 2 the plan becomes 3 consecutive blocks of 16 bytes, 0%
/// waste.
#[derive(Debug)]
pub struct FitSize {
    /// Block size to allocate.
    size: u64,

    /// Number of consecutive blocks to allocate.
    count: usize,
}

impl FitSize {
    /// Plan the subdivision of `size` bytes at `degree`.
    pub fn new(size: u64, degree: u32) -> Self {
        let order = size_to_order(size);

        // Lowest usable sub-quantum order, clipped to the smallest
        // allocation order.
        let low_order = order.saturating_sub(degree).max(SMALLEST_SIZE_ORDER);

        // Round the request up to the low order, then rescale.
        let rounded = size + order_to_size(low_order) - 1;
        let scaled = rounded >> low_order;

        // Trailing zeros give the largest sub-quantum that tiles the
        // rescaled size exactly.
        let zeroes = ctz(scaled);
        let count = (scaled >> zeroes) as usize;

        if count > 1 {
            FitSize {
                size: order_to_size(low_order + zeroes),
                count,
            }
        } else {
            FitSize {
                size: order_to_size(order),
                count: 1,
            }
        }
    }

    /// Size of each block to allocate.
    #[inline(always)]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of consecutive blocks to allocate.
    #[inline(always)]
    pub fn count(&self) -> usize {
        self.count
    }
}
