//! Partition: a one-order quantum pool over an aligned virtual region.

use crate::bits::{lo_mask, size_to_order, two_to_order};
use crate::quantum::QuantumAllocator;
use crate::registry::{BulkRelease, Registry};
use crate::roster::{AllocatorHeader, AllocatorKind};
use crate::space::Space;
use crate::system;

/// A power-of-two aligned region subdivided into equal power-of-two
/// quanta, with one registry bit per quantum.
///
/// Because the partition base is aligned and every quantum is the same
/// size, a quantum is recovered from any interior address by masking, and
/// its index by a subtract and shift. That indexability is where the
/// constant-time claims of the allocator come from.
///
/// A partition object persists for the life of its slot, but its assigned
/// order can change: an empty partition may be taken offline by its tier
/// and re-initialised in place for a different quantum size.
#[repr(C)]
pub struct Partition {
    /// Common allocator header; the space covers the partition range and
    /// both order fields carry the quantum order.
    header: AllocatorHeader,

    /// True when the backing region is a shared mapping.
    sharing: bool,

    /// Size order of every quantum in this partition.
    quantum_order: u32,

    /// Bytes of side data per quantum.
    side_data_size: u32,

    /// Base address of this partition's side data block, held on the
    /// sidelines in administrative memory.
    side_data: u64,

    /// Managing tier, used to fall back when this partition is full.
    quantum_allocator: *mut QuantumAllocator,

    /// In-use bit per quantum.
    registry: Registry,
}

impl Partition {
    /// Construct a partition for a specific quantum size.
    ///
    /// # Arguments
    /// * `sharing` - True when allocations are shared across processes
    /// * `quantum_allocator` - The managing tier
    /// * `base` - Partition base address, aligned to `partition_size`
    /// * `partition_size` - Partition bytes, a power of two
    /// * `quantum_size` - Quantum bytes, a power of two
    /// * `side_data_size` - Bytes of side data per quantum
    /// * `side_data` - Base of the partition's side data block
    pub fn new(
        sharing: bool,
        quantum_allocator: *mut QuantumAllocator,
        base: u64,
        partition_size: u64,
        quantum_size: u64,
        side_data_size: u32,
        side_data: u64,
    ) -> Self {
        let quantum_order = size_to_order(quantum_size);

        Partition {
            header: AllocatorHeader::new(
                AllocatorKind::Partition,
                Space::new(base, partition_size),
                quantum_order,
                quantum_order,
            ),
            sharing,
            quantum_order,
            side_data_size,
            side_data,
            quantum_allocator,
            registry: Registry::new((partition_size >> quantum_order) as usize),
        }
    }

    /// Header pointer for roster installation.
    #[inline(always)]
    pub fn header_ptr(&self) -> *mut AllocatorHeader {
        &self.header as *const AllocatorHeader as *mut AllocatorHeader
    }

    /// Managing tier.
    #[inline(always)]
    pub fn quantum_allocator(&self) -> *mut QuantumAllocator {
        self.quantum_allocator
    }

    /// Size order of the quanta in this partition.
    #[inline(always)]
    pub fn quantum_order(&self) -> u32 {
        self.quantum_order
    }

    /// Size in bytes of the quanta in this partition.
    #[inline(always)]
    pub fn quantum_size(&self) -> u64 {
        two_to_order(self.quantum_order)
    }

    /// Bounds of the partition.
    #[inline(always)]
    pub fn space(&self) -> &Space {
        self.header.space()
    }

    /// Test if `address` lies in this partition.
    #[inline(always)]
    pub fn contains(&self, address: u64) -> bool {
        self.space().contains(address)
    }

    /// Speculative emptiness probe. A hint only; see the tier's offline
    /// protocol for the accurate test.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Index of the quantum containing `address`.
    #[inline(always)]
    fn quantum_index(&self, address: u64) -> usize {
        self.space().index_of(address, self.quantum_order)
    }

    /// Address of the indexed quantum.
    #[inline(always)]
    fn quantum_address(&self, index: usize) -> u64 {
        self.space().base() + ((index as u64) << self.quantum_order)
    }

    /// Claim one quantum. Returns its address, or `None` when the
    /// partition is full or the request no longer fits its quantum (the
    /// partition may have been re-ordered since the caller found it).
    #[inline]
    pub fn allocate(&self, size: u64) -> Option<u64> {
        if size > self.quantum_size() {
            return None;
        }

        self.registry.find_free().map(|index| self.quantum_address(index))
    }

    /// Claim `count` consecutive quanta. Returns the address of the
    /// first, or `None`.
    pub fn allocate_count(&self, size: u64, count: usize) -> Option<u64> {
        if size > self.quantum_size() {
            return None;
        }

        // Impossible requests exit before touching the registry.
        if (self.space().size() >> self.quantum_order) < count as u64 {
            return None;
        }

        self.registry
            .find_free_range(count)
            .map(|index| self.quantum_address(index))
    }

    /// Claim quanta in bulk, pre-claiming whole registry words and
    /// releasing whatever the output cannot hold. Fills `addresses` from
    /// the front and returns the number actually claimed.
    pub fn allocate_bulk(&self, addresses: &mut [u64]) -> usize {
        let mut allocated = 0;

        self.registry.iterate_and_claim(|index| {
            if allocated < addresses.len() {
                addresses[allocated] = self.quantum_address(index);
                allocated += 1;
                true
            } else {
                false
            }
        });

        allocated
    }

    /// Claim `addresses.len()` consecutive quanta and synthesize their
    /// addresses. All or nothing; returns the number claimed.
    pub fn allocate_bulk_contiguous(&self, addresses: &mut [u64]) -> usize {
        let count = addresses.len();

        let index = match self.registry.find_free_range(count) {
            Some(index) => index,
            None => return 0,
        };

        for (i, slot) in addresses.iter_mut().enumerate() {
            *slot = self.quantum_address(index + i);
        }

        count
    }

    /// Release the quantum containing `address`.
    #[inline]
    pub fn deallocate(&self, address: u64) {
        debug_assert!(self.contains(address), "address not in partition");

        let index = self.quantum_index(address);
        debug_assert!(self.registry.is_set(index), "double deallocate");

        self.registry.free(index);
    }

    /// Release `count` consecutive quanta starting at `address`,
    /// optionally zeroing them first.
    pub fn deallocate_count(&self, address: u64, secure: bool, size: u64, count: usize) {
        debug_assert!(self.contains(address), "address not in partition");
        debug_assert!(size <= self.quantum_size(), "size not valid for partition");

        if secure {
            system::clear(address, (count as u64) << self.quantum_order, self.sharing);
        }

        let index = self.quantum_index(address);
        debug_assert!(self.registry.is_set(index), "double deallocate");

        self.registry.free_range(index, count);
    }

    /// Release a batch of addresses, stopping at the first one outside
    /// this partition. Clears registry bits one word at a time. Returns
    /// the number released.
    pub fn deallocate_bulk(&self, addresses: &[u64], secure: bool) -> usize {
        let mut release = BulkRelease::new(&self.registry);
        let mut deallocated = 0;

        for &address in addresses {
            if !self.contains(address) {
                break;
            }

            if secure {
                system::clear(address, self.quantum_size(), self.sharing);
            }

            release.clear(self.quantum_index(address));
            deallocated += 1;
        }

        deallocated
    }

    /// Zero the quantum containing `address`.
    pub fn clear(&self, address: u64) {
        system::clear(self.allocation_base(address), self.quantum_size(), self.sharing);
    }

    /// Allocated size at `address`: always the quantum size.
    #[inline(always)]
    pub fn allocation_size(&self, _address: u64) -> u64 {
        self.quantum_size()
    }

    /// Base of the quantum containing `address`, recovered by masking.
    #[inline(always)]
    pub fn allocation_base(&self, address: u64) -> u64 {
        debug_assert!(self.contains(address), "address not in partition");
        address & !lo_mask(self.quantum_order)
    }

    /// Side data address for the quantum containing `address`, or zero
    /// when the configuration carries no side data.
    pub fn allocation_side_data(&self, address: u64) -> u64 {
        debug_assert!(self.contains(address), "address not in partition");

        if self.side_data_size == 0 {
            return 0;
        }

        self.side_data + self.quantum_index(address) as u64 * self.side_data_size as u64
    }

    /// Next live allocation after `address`, or the first when `address`
    /// is zero. Returns zero when the partition holds no further
    /// allocations.
    pub fn next_allocation(&self, address: u64) -> u64 {
        let from = if address != 0 {
            self.quantum_index(address) + 1
        } else {
            0
        };

        match self.registry.next_set(from) {
            Some(index) => self.quantum_address(index),
            None => 0,
        }
    }

    /// Contribute this partition's live census to the stats arrays.
    pub fn stats(&self, counts: &mut [u64], sizes: &mut [u64]) {
        let count = self.registry.count() as u64;
        counts[self.quantum_order as usize] += count;
        sizes[self.quantum_order as usize] += count << self.quantum_order;
    }
}
