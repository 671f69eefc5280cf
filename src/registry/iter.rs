//! Word-batched bulk release for registries.

use crate::bits::two_to_order;
use crate::registry::Registry;

/// Accumulates bits to clear and flushes them one registry word at a
/// time. Deallocating in bulk this way costs one atomic write per touched
/// word instead of one per bit.
///
/// Dropping the accumulator flushes any pending bits.
pub struct BulkRelease<'a> {
    /// Registry being updated.
    registry: &'a Registry,

    /// Word index the pending bits belong to, if any.
    word_index: Option<usize>,

    /// Pending bits for that word.
    mask: u64,
}

impl<'a> BulkRelease<'a> {
    /// Create an accumulator over `registry`.
    pub fn new(registry: &'a Registry) -> Self {
        BulkRelease {
            registry,
            word_index: None,
            mask: 0,
        }
    }

    /// Flush any pending bits to the registry.
    pub fn flush(&mut self) {
        if let Some(word_index) = self.word_index.take() {
            self.registry.clear_mask(word_index, self.mask);
            self.registry.update_lowest_free_word(word_index);
            self.mask = 0;
        }
    }

    /// Mark the bit at `index` for clearing. Crossing into a different
    /// word flushes the previous one.
    pub fn clear(&mut self, index: usize) {
        let word_index = Registry::word_index(index);
        let bit_index = Registry::bit_index(index);

        if self.word_index != Some(word_index) {
            self.flush();
            self.word_index = Some(word_index);
        }

        self.mask |= two_to_order(bit_index as u32);
    }
}

impl Drop for BulkRelease<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}
