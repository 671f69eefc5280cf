//! SlabAllocator: one-up allocations above the quantum ceiling.

use core::ptr;

use log::debug;

use crate::bits::{round_up, size_to_order, two_to_order};
use crate::constants::{ALL_ONES, LARGEST_SIZE_ORDER, MAX_ALLOCATION_SIZE};
use crate::registry::Registry;
use crate::roster::{AllocatorHeader, AllocatorKind};
use crate::space::Space;
use crate::system;

/// Minimum slab rounding, one megabyte.
const SLAB_QUANTUM: u64 = 1 << 20;

/// Slab alignment, the size of the largest quantum (64M).
const SLAB_ALIGNMENT: u64 = 1 << LARGEST_SIZE_ORDER;

/// Record of one outstanding large allocation.
///
/// Unlike the quantum tiers a slab has no enclosing region; each record
/// carries its own reservation bounds.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct Slab {
    space: Space,
}

impl Slab {
    fn new(base: u64, size: u64) -> Self {
        Slab {
            space: Space::new(base, size),
        }
    }

    #[inline(always)]
    fn base(&self) -> u64 {
        self.space.base()
    }

    #[inline(always)]
    fn size(&self) -> u64 {
        self.space.size()
    }

    #[inline(always)]
    fn contains(&self, address: u64) -> bool {
        self.space.contains(address)
    }
}

/// Allocator for blocks too large for the quantum tiers, up to the
/// maximum allocation size.
///
/// Keeps a fixed table of slab records and a registry of occupied slots.
/// Deallocation clears the slot's registry bit but keeps the OS
/// reservation in the slot: a later allocation reuses the footprint
/// as-is, trims its postfix, or finally replaces it.
#[repr(C)]
pub struct SlabAllocator {
    /// Common allocator header. A slab allocator owns no contiguous
    /// space of its own.
    header: AllocatorHeader,

    /// True when deallocations must zero.
    secure: bool,

    /// Capacity of the slab table.
    max_count: usize,

    /// Bytes of side data per slab.
    side_data_size: u32,

    /// Base of the slab side data block.
    side_data: u64,

    /// Slab record table.
    slabs: *mut Slab,

    /// Occupied slot registry.
    registry: Registry,
}

impl SlabAllocator {
    /// Construct a slab allocator.
    ///
    /// # Arguments
    /// * `secure` - True when deallocations must zero
    /// * `max_count` - Capacity of the slab table
    /// * `slabs` - Storage for the slab table
    /// * `side_data_size` - Bytes of side data per slab
    /// * `side_data` - Storage for slab side data
    pub fn new(
        secure: bool,
        max_count: usize,
        slabs: *mut Slab,
        side_data_size: u32,
        side_data: u64,
    ) -> Self {
        SlabAllocator {
            header: AllocatorHeader::new(
                AllocatorKind::Slab,
                Space::new(0, ALL_ONES),
                LARGEST_SIZE_ORDER + 1,
                crate::constants::MAX_ALLOCATION_ORDER,
            ),
            secure,
            max_count,
            side_data_size,
            side_data,
            slabs,
            registry: Registry::new(max_count),
        }
    }

    /// Header pointer for roster installation.
    #[inline(always)]
    pub fn header_ptr(&self) -> *mut AllocatorHeader {
        &self.header as *const AllocatorHeader as *mut AllocatorHeader
    }

    /// Slab record at `index`.
    #[inline(always)]
    fn slab(&self, index: usize) -> *mut Slab {
        debug_assert!(index < self.max_count, "slab index out of range");
        unsafe { self.slabs.add(index) }
    }

    /// Find the occupied slab containing `address`. Linear over the
    /// table; the table is small and large allocations are rare.
    fn find(&self, address: u64) -> Option<usize> {
        for index in 0..self.max_count {
            if unsafe { (*self.slab(index)).contains(address) } && self.registry.is_set(index) {
                return Some(index);
            }
        }

        None
    }

    /// Recycle a retained reservation or reserve fresh space for `size`
    /// bytes (already rounded). Returns the base address.
    fn reserve(&self, size: u64) -> Option<u64> {
        let index = self.registry.find_free()?;

        let slab = self.slab(index);
        let (base, slab_size) = unsafe { ((*slab).base(), (*slab).size()) };

        // Trim the postfix of an oversized retained slab.
        if slab_size > size {
            system::release(base + size, slab_size - size);
        }

        // A large enough footprint is reused in place.
        if slab_size >= size {
            if self.secure {
                // Recommit for fresh zero pages.
                system::commit(base, size);
            }

            unsafe {
                ptr::write(slab, Slab::new(base, size));
            }

            return Some(base);
        }

        // Too small. Discard any old reservation and take a new one.
        if slab_size != 0 {
            system::release(base, slab_size);
        }

        let base = match system::reserve_aligned(size, SLAB_ALIGNMENT) {
            Some(base) => base,
            None => {
                self.registry.free(index);
                return None;
            }
        };

        debug!("slab {}: reserved {} bytes at {:#x}", index, size, base);

        system::commit(base, size);

        unsafe {
            ptr::write(slab, Slab::new(base, size));
        }

        Some(base)
    }

    /// Allocate a block of at least `size` bytes, rounded up to a
    /// megabyte. Returns the address, or `None`.
    pub fn allocate(&self, size: u64) -> Option<u64> {
        debug_assert!(
            two_to_order(LARGEST_SIZE_ORDER) < size && size <= MAX_ALLOCATION_SIZE,
            "size not valid for slab allocator"
        );

        self.reserve(round_up(size, SLAB_QUANTUM))
    }

    /// Release the slab containing `address`. The OS reservation is
    /// retained in the slot for reuse; unknown addresses are ignored.
    pub fn deallocate(&self, address: u64) {
        if let Some(index) = self.find(address) {
            self.registry.free(index);
        }
    }

    /// Zero the slab containing `address`.
    pub fn clear(&self, address: u64) {
        if let Some(index) = self.find(address) {
            let slab = unsafe { &*self.slab(index) };
            system::clear(slab.base(), slab.size(), false);
        }
    }

    /// Allocate `count` blocks of `size` bytes as one aligned
    /// reservation. Returns the address of the first block.
    pub fn allocate_count(&self, size: u64, count: usize) -> Option<u64> {
        let total = size.checked_mul(count as u64)?;

        if total > MAX_ALLOCATION_SIZE {
            return None;
        }

        self.reserve(round_up(total, SLAB_ALIGNMENT))
    }

    /// Release blocks allocated with `allocate_count`. The reservation is
    /// returned to the OS outright.
    pub fn deallocate_count(&self, address: u64, _size: u64, _count: usize) {
        if let Some(index) = self.find(address) {
            let slab = unsafe { &*self.slab(index) };
            system::release(slab.base(), slab.size());

            unsafe {
                ptr::write(self.slab(index), Slab::new(0, 0));
            }

            self.registry.free(index);
        }
    }

    /// Allocate blocks in bulk from one fresh aligned reservation,
    /// recording a consecutive slab per block. The blocks are contiguous
    /// whether or not the caller asked for it.
    pub fn allocate_bulk(&self, size: u64, addresses: &mut [u64], _contiguous: bool) -> usize {
        let count = addresses.len();
        let rounded_size = round_up(size, SLAB_ALIGNMENT);
        let total = rounded_size * count as u64;

        let base = match system::reserve_aligned(total, SLAB_ALIGNMENT) {
            Some(base) => base,
            None => return 0,
        };

        system::commit(base, total);

        for (i, slot) in addresses.iter_mut().enumerate() {
            let address = base + i as u64 * rounded_size;

            let index = match self.registry.find_free() {
                Some(index) => index,
                None => {
                    // Table full. Return the unrecorded remainder.
                    system::release(address, (count - i) as u64 * rounded_size);
                    return i;
                }
            };

            unsafe {
                ptr::write(self.slab(index), Slab::new(address, rounded_size));
            }

            *slot = address;
        }

        count
    }

    /// Release a batch of slab addresses, stopping at the first null or
    /// foreign address. Returns the number released.
    pub fn deallocate_bulk(&self, addresses: &[u64]) -> usize {
        for (i, &address) in addresses.iter().enumerate() {
            match self.find(address) {
                Some(index) => self.registry.free(index),
                None => return i,
            }
        }

        addresses.len()
    }

    /// Allocated size at `address`, or zero when unknown.
    pub fn allocation_size(&self, address: u64) -> u64 {
        match self.find(address) {
            Some(index) => unsafe { (*self.slab(index)).size() },
            None => 0,
        }
    }

    /// Base of the slab containing `address`, or zero when unknown.
    pub fn allocation_base(&self, address: u64) -> u64 {
        match self.find(address) {
            Some(index) => unsafe { (*self.slab(index)).base() },
            None => 0,
        }
    }

    /// Side data address for the slab containing `address`, or zero.
    pub fn allocation_side_data(&self, address: u64) -> u64 {
        if self.side_data_size == 0 {
            return 0;
        }

        match self.find(address) {
            Some(index) => self.side_data + index as u64 * self.side_data_size as u64,
            None => 0,
        }
    }

    /// Next live slab allocation after `address`. Zero starts the walk;
    /// zero returned ends it.
    pub fn next_allocation(&self, address: u64) -> u64 {
        let from = if address != 0 {
            match self.find(address) {
                Some(index) => index + 1,
                None => return 0,
            }
        } else {
            0
        };

        match self.registry.next_set(from) {
            Some(index) => unsafe { (*self.slab(index)).base() },
            None => 0,
        }
    }

    /// Release every outstanding OS reservation. Used at destroy.
    pub fn release(&self) {
        for index in 0..self.max_count {
            let slab = unsafe { &*self.slab(index) };

            if slab.size() != 0 {
                system::release(slab.base(), slab.size());
            }
        }
    }

    /// Contribute the slab census and administrative footprint to the
    /// stats arrays.
    pub fn stats(&self, counts: &mut [u64], sizes: &mut [u64]) {
        sizes[1] += (core::mem::size_of::<SlabAllocator>()
            + self.max_count * core::mem::size_of::<Slab>()) as u64;

        for index in 0..self.max_count {
            if self.registry.is_set(index) {
                let size = unsafe { (*self.slab(index)).size() };
                let order = size_to_order(size) as usize;
                counts[order] += 1;
                sizes[order] += size;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Slab allocator over zeroed local storage.
    fn test_slabs(max_count: usize, secure: bool, side_data_size: u32) -> (SlabAllocator, Vec<Slab>, Vec<u8>) {
        let mut table = vec![Slab::new(0, 0); max_count];
        let side = vec![0u8; (max_count * side_data_size as usize).max(1)];

        let allocator = SlabAllocator::new(
            secure,
            max_count,
            table.as_mut_ptr(),
            side_data_size,
            side.as_ptr() as u64,
        );

        (allocator, table, side)
    }

    #[test]
    fn test_allocate_aligned_and_sized() {
        let (allocator, _table, _side) = test_slabs(4, false, 0);

        // 128M crosses the quantum ceiling.
        let size = 128 * 1024 * 1024;
        let a = allocator.allocate(size).unwrap();

        assert_eq!(a & (SLAB_ALIGNMENT - 1), 0);
        assert_eq!(allocator.allocation_size(a), size);
        assert_eq!(allocator.allocation_base(a + size - 1), a);

        // The block is writable.
        unsafe {
            *(a as *mut u64) = 42;
            *((a + size - 8) as *mut u64) = 43;
        }

        allocator.deallocate(a);
        allocator.release();
    }

    #[test]
    fn test_megabyte_rounding() {
        let (allocator, _table, _side) = test_slabs(4, false, 0);

        let a = allocator.allocate((1 << 26) + 1).unwrap();
        assert_eq!(allocator.allocation_size(a), (1 << 26) + (1 << 20));

        allocator.deallocate(a);
        allocator.release();
    }

    #[test]
    fn test_lazy_retention_reuse() {
        let (allocator, _table, _side) = test_slabs(2, false, 0);

        let size = 65 * 1024 * 1024;
        let a = allocator.allocate(size).unwrap();
        allocator.deallocate(a);

        // Same footprint comes back from the retained slot.
        let b = allocator.allocate(size).unwrap();
        assert_eq!(a, b);

        allocator.deallocate(b);
        allocator.release();
    }

    #[test]
    fn test_lazy_retention_trims_postfix() {
        let (allocator, _table, _side) = test_slabs(1, false, 0);

        let big = 80 * 1024 * 1024;
        let small = 66 * 1024 * 1024;

        let a = allocator.allocate(big).unwrap();
        allocator.deallocate(a);

        // Reuse keeps the prefix and releases the rest.
        let b = allocator.allocate(small).unwrap();
        assert_eq!(a, b);
        assert_eq!(allocator.allocation_size(b), small);

        allocator.deallocate(b);
        allocator.release();
    }

    #[test]
    fn test_capacity_exhausted() {
        let (allocator, _table, _side) = test_slabs(1, false, 0);

        let a = allocator.allocate(65 * 1024 * 1024).unwrap();
        assert_eq!(allocator.allocate(65 * 1024 * 1024), None);

        allocator.deallocate(a);
        allocator.release();
    }

    #[test]
    fn test_unknown_address_queries() {
        let (allocator, _table, _side) = test_slabs(2, false, 0);

        assert_eq!(allocator.allocation_size(0xDEAD_0000), 0);
        assert_eq!(allocator.allocation_base(0xDEAD_0000), 0);
        assert_eq!(allocator.allocation_side_data(0xDEAD_0000), 0);

        // Deallocate of an unknown address is a no-op.
        allocator.deallocate(0xDEAD_0000);
    }

    #[test]
    fn test_allocate_bulk_contiguous_records() {
        let (allocator, _table, _side) = test_slabs(8, false, 0);

        let size = 65 * 1024 * 1024;
        let mut addresses = [0u64; 3];
        let allocated = allocator.allocate_bulk(size, &mut addresses, true);
        assert_eq!(allocated, 3);

        let rounded = round_up(size, SLAB_ALIGNMENT);
        for pair in addresses.windows(2) {
            assert_eq!(pair[1] - pair[0], rounded);
        }

        // Each block is individually known.
        for &address in &addresses {
            assert_eq!(allocator.allocation_base(address), address);
        }

        assert_eq!(allocator.deallocate_bulk(&addresses), 3);
        allocator.release();
    }

    #[test]
    fn test_next_allocation_walk() {
        let (allocator, _table, _side) = test_slabs(4, false, 0);

        let a = allocator.allocate(65 * 1024 * 1024).unwrap();
        let b = allocator.allocate(65 * 1024 * 1024).unwrap();

        let first = allocator.next_allocation(0);
        assert_eq!(first, a);
        let second = allocator.next_allocation(first);
        assert_eq!(second, b);
        assert_eq!(allocator.next_allocation(second), 0);

        allocator.deallocate(a);
        allocator.deallocate(b);
        allocator.release();
    }

    #[test]
    fn test_side_data() {
        let (allocator, _table, side) = test_slabs(2, false, 8);

        let a = allocator.allocate(65 * 1024 * 1024).unwrap();
        let sa = allocator.allocation_side_data(a);
        assert_eq!(sa, side.as_ptr() as u64);

        allocator.deallocate(a);
        allocator.release();
    }

    #[test]
    fn test_stats_census() {
        let (allocator, _table, _side) = test_slabs(4, false, 0);

        let size = 128 * 1024 * 1024;
        let a = allocator.allocate(size).unwrap();

        let mut counts = [0u64; 64];
        let mut sizes = [0u64; 64];
        allocator.stats(&mut counts, &mut sizes);

        assert_eq!(counts[27], 1);
        assert_eq!(sizes[27], size);
        assert!(sizes[1] > 0);

        allocator.deallocate(a);
        allocator.release();
    }
}
