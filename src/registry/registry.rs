//! The atomic bitmap registry.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::bits::{clz, ctz, hi_mask, lo_mask, lowest_zero_bit, lowest_zero_run, popcount, two_to_order};
use crate::constants::{
    ALL_ONES, BITS_MASK, BITS_PER_WORD, BITS_PER_WORD_ORDER, MAX_REGISTRY_BIT_COUNT,
    MAX_REGISTRY_WORD_COUNT,
};

/// Optimized atomic bitmap.
///
/// Bit `i` set means element `i` is in use. Free bits are claimed with
/// compare-exchange on 64-bit words, never one bit at a time, and a cached
/// index of the lowest word known to hold free bits keeps the usual claim
/// at a single word. Lowest bits fill first, so long lived allocations
/// sink to the bottom and word scans stay near the top.
///
/// # Thread Safety
/// Every operation is lock-free. Multi-word range claims are approximated
/// by a first/middle/last sequence of conditional word claims with an
/// unconditional rollback of this thread's own bits on failure.
#[derive(Debug)]
#[repr(C)]
pub struct Registry {
    /// Maximum bit index.
    maximum_index: usize,

    /// Maximum word index. `maximum_word_index * 64` may exceed
    /// `maximum_index` due to rounding up to full words.
    maximum_word_index: usize,

    /// Index of the lowest bitmap word containing free bits. A hint, not
    /// an invariant: it may lag behind the true minimum and must never be
    /// used to conclude fullness.
    lowest_index: AtomicUsize,

    /// Bitmap words.
    bits: [AtomicU64; MAX_REGISTRY_WORD_COUNT],
}

impl Registry {
    /// Create a registry managing `maximum_index` elements.
    pub fn new(maximum_index: usize) -> Self {
        debug_assert!(
            maximum_index <= MAX_REGISTRY_BIT_COUNT,
            "maximum index out of range"
        );

        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO_WORD: AtomicU64 = AtomicU64::new(0);

        Registry {
            maximum_index,
            maximum_word_index: Self::words_needed(maximum_index),
            lowest_index: AtomicUsize::new(0),
            bits: [ZERO_WORD; MAX_REGISTRY_WORD_COUNT],
        }
    }

    /// Number of words needed to represent `count` bits.
    #[inline(always)]
    pub fn words_needed(count: usize) -> usize {
        (count + BITS_PER_WORD - 1) >> BITS_PER_WORD_ORDER
    }

    /// Word index of the word containing the indexed bit.
    #[inline(always)]
    pub fn word_index(index: usize) -> usize {
        index >> BITS_PER_WORD_ORDER
    }

    /// Bit position within its word of the indexed bit.
    #[inline(always)]
    pub fn bit_index(index: usize) -> usize {
        index & BITS_MASK
    }

    /// Combine a word index and a bit position into a bit index.
    #[inline(always)]
    pub fn index(word_index: usize, bit_index: usize) -> usize {
        (word_index << BITS_PER_WORD_ORDER) + bit_index
    }

    /// Current value of the indexed word.
    #[inline(always)]
    pub fn word(&self, word_index: usize) -> u64 {
        self.bits[word_index].load(Ordering::Acquire)
    }

    /// Current lowest-free-word hint.
    #[inline(always)]
    pub fn lowest_index(&self) -> usize {
        self.lowest_index.load(Ordering::Acquire)
    }

    #[inline(always)]
    fn is_valid_index(&self, index: usize) -> bool {
        index < self.maximum_index
    }

    /// Unconditionally set the mask bits in the indexed word. Returns true
    /// if the bits were all previously clear.
    #[inline]
    pub fn set_mask(&self, word_index: usize, mask: u64) -> bool {
        mask == 0 || self.bits[word_index].fetch_or(mask, Ordering::AcqRel) & mask == 0
    }

    /// Unconditionally clear the mask bits in the indexed word. Returns
    /// true if any of the bits were previously set.
    #[inline]
    pub fn clear_mask(&self, word_index: usize, mask: u64) -> bool {
        mask == 0 || self.bits[word_index].fetch_and(!mask, Ordering::AcqRel) & mask != 0
    }

    /// Conditionally claim the mask bits in the indexed word. Fails if any
    /// target bit is already set in the observed word, or if the word
    /// changes under the claim.
    #[inline]
    pub fn conditionally_set_mask(&self, word_index: usize, mask: u64) -> bool {
        if mask == 0 {
            return true;
        }

        let value = self.word(word_index);

        if value & mask != 0 {
            return false;
        }

        self.bits[word_index]
            .compare_exchange(value, value | mask, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Conditionally claim a multi-word contiguous run: `first_mask` in
    /// the first word, `middle_count` full words after it, `last_mask` in
    /// the word after those. Claims in order; any failure unconditionally
    /// clears whatever this call already set and reports false.
    ///
    /// The sequence is lock-free but may be observed mid-flight by other
    /// scanners. Since the rollback clears only bits this thread just
    /// claimed, a failed attempt restores the state to "those bits never
    /// appeared".
    pub fn conditionally_set_mask_range(
        &self,
        first_word_index: usize,
        middle_count: usize,
        first_mask: u64,
        last_mask: u64,
    ) -> bool {
        if !self.conditionally_set_mask(first_word_index, first_mask) {
            return false;
        }

        for i in 0..middle_count {
            if !self.conditionally_set_mask(first_word_index + i + 1, ALL_ONES) {
                // Back out the first word and the middles set so far.
                self.clear_mask_range(first_word_index, i, first_mask, 0);
                return false;
            }
        }

        if !self.conditionally_set_mask(first_word_index + middle_count + 1, last_mask) {
            self.clear_mask_range(first_word_index, middle_count, first_mask, 0);
            return false;
        }

        true
    }

    /// Unconditionally clear a multi-word contiguous run laid out as in
    /// `conditionally_set_mask_range`.
    pub fn clear_mask_range(
        &self,
        first_word_index: usize,
        middle_count: usize,
        first_mask: u64,
        last_mask: u64,
    ) {
        self.clear_mask(first_word_index, first_mask);

        for i in 0..middle_count {
            self.clear_mask(first_word_index + i + 1, ALL_ONES);
        }

        if last_mask != 0 {
            self.clear_mask(first_word_index + middle_count + 1, last_mask);
        }
    }

    /// Weakly test if a bit is set. The state may change after reading
    /// unless the reader owns the bit.
    #[inline]
    pub fn is_set(&self, index: usize) -> bool {
        debug_assert!(self.is_valid_index(index), "index out of range");
        self.word(Self::word_index(index)) & two_to_order(Self::bit_index(index) as u32) != 0
    }

    /// Unconditionally set a bit. Returns true if it was previously clear.
    #[inline]
    pub fn set(&self, index: usize) -> bool {
        debug_assert!(self.is_valid_index(index), "index out of range");
        self.set_mask(
            Self::word_index(index),
            two_to_order(Self::bit_index(index) as u32),
        )
    }

    /// Unconditionally clear a bit. Returns true if it was previously set.
    #[inline]
    pub fn clear(&self, index: usize) -> bool {
        debug_assert!(self.is_valid_index(index), "index out of range");
        self.clear_mask(
            Self::word_index(index),
            two_to_order(Self::bit_index(index) as u32),
        )
    }

    /// Attempt to advance the lowest-free-word hint past a packed word.
    /// If another thread moved the hint first, its value wins.
    #[inline]
    fn increment_lowest_free_word(&self, word_index: usize) -> usize {
        let next = word_index + 1;

        match self.lowest_index.compare_exchange_weak(
            word_index,
            next,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => next,
            Err(other) => other,
        }
    }

    /// Lower the lowest-free-word hint to `word_index` if it currently
    /// points higher.
    pub fn update_lowest_free_word(&self, word_index: usize) {
        let mut lowest = self.lowest_index.load(Ordering::Acquire);

        while lowest > word_index {
            match self.lowest_index.compare_exchange_weak(
                lowest,
                word_index,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(other) => lowest = other,
            }
        }
    }

    /// Find and claim the lowest free bit. Returns the index, or `None`
    /// if a completed scan found no free bit.
    ///
    /// # Performance
    /// Constant time in the common case; linear in the number of fully
    /// packed words otherwise.
    pub fn find_free(&self) -> Option<usize> {
        let mut word_index = self.lowest_index();

        loop {
            if word_index >= self.maximum_word_index {
                return None;
            }

            let value = self.word(word_index);

            if value == ALL_ONES {
                // Packed word. Bump the hint, or adopt the hint another
                // thread just published.
                word_index = self.increment_lowest_free_word(word_index);
                continue;
            }

            let bit_index = ctz(!value) as usize;
            let index = Self::index(word_index, bit_index);

            // Free bits in the unused tail of the last word do not count.
            if index >= self.maximum_index {
                return None;
            }

            if self.bits[word_index]
                .compare_exchange_weak(
                    value,
                    value | two_to_order(bit_index as u32),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return Some(index);
            }

            // Lost the race or spurious failure. Re-read and retry.
        }
    }

    /// Find and claim `count` consecutive free bits. Returns the index of
    /// the first, or `None`.
    pub fn find_free_range(&self, count: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }

        if count == 1 {
            return self.find_free();
        }

        if count > self.maximum_index {
            return None;
        }

        // Walk words from the hint. Hint updates from concurrent frees
        // are ignored here; they are typically single-bit events.
        for word_index in self.lowest_index()..self.maximum_word_index {
            let value = self.word(word_index);

            if count <= BITS_PER_WORD {
                // The run lives in at most two words.
                let bit_index = match lowest_zero_run(value, count as u32) {
                    Some(bit) => bit as usize,
                    None => continue,
                };

                let index = Self::index(word_index, bit_index);

                if index + count > self.maximum_index {
                    return None;
                }

                if bit_index + count <= BITS_PER_WORD {
                    if self.conditionally_set_mask(word_index, lo_mask(count as u32) << bit_index)
                    {
                        return Some(index);
                    }
                } else {
                    // Straddles into the next word.
                    let first = lo_mask(count as u32) << bit_index;
                    let last = lo_mask((bit_index + count - BITS_PER_WORD) as u32);

                    if self.conditionally_set_mask_range(word_index, 0, first, last) {
                        return Some(index);
                    }
                }
            } else {
                // Spanning multiple words, starting with the free upper
                // bits of the current word.
                let leading = clz(value) as usize;
                let index = Self::index(word_index, BITS_PER_WORD - leading);

                if index + count > self.maximum_index {
                    return None;
                }

                let remaining = count - leading;
                let remaining_words = Self::word_index(remaining);
                let remaining_bits = Self::bit_index(remaining);

                if self.conditionally_set_mask_range(
                    word_index,
                    remaining_words,
                    hi_mask(leading as u32),
                    lo_mask(remaining_bits as u32),
                ) {
                    return Some(index);
                }
            }
        }

        None
    }

    /// Clear the indexed bit and restore the lowest-free-word hint.
    #[inline]
    pub fn free(&self, index: usize) {
        self.clear(index);
        self.update_lowest_free_word(Self::word_index(index));
    }

    /// Clear `count` consecutive bits starting at `index`, then restore
    /// the lowest-free-word hint.
    pub fn free_range(&self, index: usize, count: usize) {
        debug_assert!(self.is_valid_index(index), "index out of range");
        debug_assert!(index + count <= self.maximum_index, "range out of bounds");

        let word_index = Self::word_index(index);
        let bit_index = Self::bit_index(index);

        if bit_index + count <= BITS_PER_WORD {
            // Bits in a single word.
            self.clear_mask(word_index, lo_mask(count as u32) << bit_index);
        } else if count <= BITS_PER_WORD {
            // Bits span two words.
            self.clear_mask_range(
                word_index,
                0,
                lo_mask(count as u32) << bit_index,
                lo_mask((bit_index + count - BITS_PER_WORD) as u32),
            );
        } else {
            // Bits span multiple words.
            let leading = BITS_PER_WORD - bit_index;
            let remaining = count - leading;
            let remaining_words = Self::word_index(remaining);
            let remaining_bits = Self::bit_index(remaining);
            self.clear_mask_range(
                word_index,
                remaining_words,
                hi_mask(leading as u32),
                lo_mask(remaining_bits as u32),
            );
        }

        self.update_lowest_free_word(word_index);
    }

    /// Find the next set bit at or above `from`. Returns its index, or
    /// `None`.
    pub fn next_set(&self, from: usize) -> Option<usize> {
        if from >= self.maximum_index {
            return None;
        }

        let mut bit_index = Self::bit_index(from);

        for word_index in Self::word_index(from)..self.maximum_word_index {
            // Mask out the already seen low bits.
            let value = self.word(word_index) & !lo_mask(bit_index as u32);

            if value != 0 {
                let index = Self::index(word_index, ctz(value) as usize);

                if index >= self.maximum_index {
                    return None;
                }

                return Some(index);
            }

            bit_index = 0;
        }

        None
    }

    /// Sample population count of the whole bitmap. Not atomic across
    /// words; the result is approximate under concurrent traffic.
    pub fn count(&self) -> usize {
        let mut total = 0usize;

        for word_index in 0..self.maximum_word_index {
            total += popcount(self.word(word_index)) as usize;
        }

        total
    }

    /// Best guess emptiness test. Accurate only when the registry is
    /// offline; otherwise use it to sample, take the registry offline,
    /// and test again.
    pub fn is_empty(&self) -> bool {
        if self.lowest_index() != 0 {
            return false;
        }

        for word_index in 0..self.maximum_word_index {
            if self.word(word_index) != 0 {
                return false;
            }
        }

        true
    }

    /// Pre-claim every remaining free bit word by word, invoking the
    /// visitor with each bit index claimed from the snapshot. A visitor
    /// returning false stops the sweep; claimed bits the visitor never
    /// consumed are unconditionally released.
    pub fn iterate_and_claim<F>(&self, mut found_free: F)
    where
        F: FnMut(usize) -> bool,
    {
        for word_index in self.lowest_index()..self.maximum_word_index {
            let mut value = self.word(word_index);

            // Pre-set all bits in the word, retrying until a clean
            // snapshot of the prior value is claimed.
            while value != ALL_ONES {
                match self.bits[word_index].compare_exchange_weak(
                    value,
                    ALL_ONES,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(current) => value = current,
                }
            }

            // Hand out the free bits of the snapshot.
            while value != ALL_ONES {
                let lowest = lowest_zero_bit(value);
                let bit_index = (BITS_PER_WORD as u32 - 1 - clz(lowest)) as usize;
                let index = Self::index(word_index, bit_index);

                if index >= self.maximum_index {
                    break;
                }

                if !found_free(index) {
                    // Output full. Release what was claimed but not
                    // consumed.
                    if value != ALL_ONES {
                        self.clear_mask(word_index, !value);
                    }

                    return;
                }

                value |= lowest;
            }

            // Release the unused claims of the last word (tail bits past
            // the maximum index).
            if value != ALL_ONES {
                self.clear_mask(word_index, !value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_free_sequential() {
        let registry = Registry::new(200);

        // Lowest bits fill first.
        for expected in 0..200 {
            assert_eq!(registry.find_free(), Some(expected));
        }

        // Exhausted.
        assert_eq!(registry.find_free(), None);
    }

    #[test]
    fn test_free_reclaims_lowest() {
        let registry = Registry::new(256);

        for _ in 0..256 {
            registry.find_free().unwrap();
        }

        registry.free(70);
        registry.free(5);

        // The hint drops back to the lowest freed word.
        assert_eq!(registry.find_free(), Some(5));
        assert_eq!(registry.find_free(), Some(70));
        assert_eq!(registry.find_free(), None);
    }

    #[test]
    fn test_set_clear_is_set() {
        let registry = Registry::new(128);

        assert!(!registry.is_set(42));
        assert!(registry.set(42));
        assert!(registry.is_set(42));

        // Setting an already set bit reports false.
        assert!(!registry.set(42));

        assert!(registry.clear(42));
        assert!(!registry.is_set(42));
        assert!(!registry.clear(42));
    }

    #[test]
    fn test_unused_tail_not_allocated() {
        // 10 bits in a 64-bit word; the tail must never be handed out.
        let registry = Registry::new(10);

        for expected in 0..10 {
            assert_eq!(registry.find_free(), Some(expected));
        }

        assert_eq!(registry.find_free(), None);
    }

    #[test]
    fn test_find_free_range_single_word() {
        let registry = Registry::new(256);

        assert_eq!(registry.find_free_range(0), None);
        assert_eq!(registry.find_free_range(8), Some(0));
        assert_eq!(registry.find_free_range(8), Some(8));

        for index in 0..16 {
            assert!(registry.is_set(index));
        }
        assert!(!registry.is_set(16));
    }

    #[test]
    fn test_find_free_range_straddle() {
        let registry = Registry::new(256);

        // Occupy up to bit 60; a run of 8 must straddle words 0 and 1.
        for _ in 0..60 {
            registry.find_free().unwrap();
        }

        let index = registry.find_free_range(8).unwrap();
        assert_eq!(index, 60);

        for bit in 60..68 {
            assert!(registry.is_set(bit));
        }
        assert!(!registry.is_set(68));

        registry.free_range(index, 8);
        for bit in 60..68 {
            assert!(!registry.is_set(bit));
        }
        assert!(registry.is_set(59));
    }

    #[test]
    fn test_find_free_range_multiword() {
        let registry = Registry::new(1024);

        // 200 bits span four words.
        let index = registry.find_free_range(200).unwrap();
        assert_eq!(index, 0);

        for bit in 0..200 {
            assert!(registry.is_set(bit));
        }
        assert!(!registry.is_set(200));

        // A second large run lands after the first.
        let second = registry.find_free_range(100).unwrap();
        assert_eq!(second, 200);

        registry.free_range(0, 200);
        registry.free_range(200, 100);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_find_free_range_skips_fragmentation() {
        let registry = Registry::new(256);

        // Pin a bit in the middle of the first word.
        assert!(registry.set(30));

        let index = registry.find_free_range(40).unwrap();
        assert_eq!(index, 31);

        registry.free_range(31, 40);
        registry.free(30);
    }

    #[test]
    fn test_find_free_range_exact_tail_fit() {
        let registry = Registry::new(128);

        assert_eq!(registry.find_free_range(128), Some(0));
        assert_eq!(registry.find_free(), None);

        registry.free_range(0, 128);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_find_free_range_too_large() {
        let registry = Registry::new(100);
        assert_eq!(registry.find_free_range(101), None);
    }

    #[test]
    fn test_conditional_mask_rejects_taken_bits() {
        let registry = Registry::new(128);

        assert!(registry.set(3));
        assert!(!registry.conditionally_set_mask(0, 0b1111));
        // The failed claim must not have disturbed anything.
        assert!(registry.is_set(3));
        assert!(!registry.is_set(0));
    }

    #[test]
    fn test_mask_range_rollback() {
        let registry = Registry::new(256);

        // Occupy a bit in word 2 so a three-word claim fails its middle.
        assert!(registry.set(130));

        assert!(!registry.conditionally_set_mask_range(0, 2, ALL_ONES, 0b1));

        // Rollback cleared everything this attempt set.
        assert_eq!(registry.count(), 1);
        assert!(registry.is_set(130));
    }

    #[test]
    fn test_next_set() {
        let registry = Registry::new(256);

        assert!(registry.set(5));
        assert!(registry.set(67));
        assert!(registry.set(200));

        assert_eq!(registry.next_set(0), Some(5));
        assert_eq!(registry.next_set(5), Some(5));
        assert_eq!(registry.next_set(6), Some(67));
        assert_eq!(registry.next_set(68), Some(200));
        assert_eq!(registry.next_set(201), None);
    }

    #[test]
    fn test_count_and_is_empty() {
        let registry = Registry::new(512);

        assert!(registry.is_empty());
        assert_eq!(registry.count(), 0);

        registry.find_free_range(70).unwrap();
        assert_eq!(registry.count(), 70);
        assert!(!registry.is_empty());

        registry.free_range(0, 70);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_iterate_and_claim_all() {
        let registry = Registry::new(150);
        let mut seen = Vec::new();

        registry.iterate_and_claim(|index| {
            seen.push(index);
            true
        });

        assert_eq!(seen.len(), 150);
        assert_eq!(seen[0], 0);
        assert_eq!(seen[149], 149);
        assert_eq!(registry.count(), 150);
    }

    #[test]
    fn test_iterate_and_claim_partial() {
        let registry = Registry::new(256);

        // Claim only the first 10; the rest must be released.
        let mut taken = 0;
        registry.iterate_and_claim(|_| {
            taken += 1;
            taken < 10
        });

        assert_eq!(registry.count(), 10);
        for index in 0..10 {
            assert!(registry.is_set(index));
        }
        assert!(!registry.is_set(10));
    }

    #[test]
    fn test_iterate_and_claim_skips_taken() {
        let registry = Registry::new(64);

        assert!(registry.set(2));
        assert!(registry.set(5));

        let mut seen = Vec::new();
        registry.iterate_and_claim(|index| {
            seen.push(index);
            true
        });

        assert!(!seen.contains(&2));
        assert!(!seen.contains(&5));
        assert_eq!(seen.len(), 62);
    }

    #[test]
    fn test_concurrent_find_free_unique() {
        use std::sync::Arc;
        use std::thread;

        let registry = Arc::new(Registry::new(4096));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                let mut indices = Vec::new();
                for _ in 0..512 {
                    indices.push(registry.find_free().expect("registry exhausted early"));
                }
                indices
            }));
        }

        let mut all: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        // Every claim distinct, all 4096 handed out exactly once.
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4096);
        assert_eq!(registry.find_free(), None);
    }

    #[test]
    fn test_concurrent_range_claims_disjoint() {
        use std::sync::Arc;
        use std::thread;

        let registry = Arc::new(Registry::new(16 * 1024));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                let mut ranges = Vec::new();
                for _ in 0..32 {
                    if let Some(index) = registry.find_free_range(96) {
                        ranges.push(index);
                    }
                }
                ranges
            }));
        }

        let all: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        // Claimed ranges never overlap.
        let mut sorted = all.clone();
        sorted.sort_unstable();
        for pair in sorted.windows(2) {
            assert!(pair[0] + 96 <= pair[1], "overlapping ranges claimed");
        }
    }
}
