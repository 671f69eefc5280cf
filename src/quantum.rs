//! QuantumAllocator: a tier of partitions covering eight size orders.

use core::ptr;

use log::debug;

use crate::bits::{size_to_order, two_to_order};
use crate::constants::{MAX_PARTITION_QUANTUM, MAX_QUANTUM_ALLOCATOR_ORDERS};
use crate::partition::Partition;
use crate::registry::Registry;
use crate::roster::{AllocatorHeader, AllocatorKind, AllocatorRoster};
use crate::space::Space;
use crate::system;

/// Manages a span of memory subdivided into equal partitions, serving
/// eight consecutive size orders.
///
/// Multiple tiers exist so that the ratio of partition size to quantum
/// size stays low, which keeps every quantum registry small and fast.
///
/// Partition slots are committed and initialised lazily. Once a partition
/// is promoted for an order it is installed directly into the roster,
/// removing this tier from the fast path for that order; the tier is
/// re-entered only when the installed partition cannot satisfy a request.
#[repr(C)]
pub struct QuantumAllocator {
    /// Common allocator header; the space covers the whole tier span.
    header: AllocatorHeader,

    /// True when the backing region is a shared mapping.
    sharing: bool,

    /// Order of the partition size in this tier.
    partition_size_order: u32,

    /// Number of partition slots.
    partition_count: usize,

    /// Bytes of side data per quantum.
    side_data_size: u32,

    /// Base of this tier's side data block.
    side_data: u64,

    /// Roster owned by the director, needed to swap promoted partitions
    /// into the dispatch path.
    roster: *mut AllocatorRoster,

    /// Partition slot array, uninitialised until first use.
    partitions: *mut Partition,

    /// Tracks which partition slots are committed.
    partition_registry: Registry,

    /// One registry per covered order, tracking which partitions are
    /// currently serving that order.
    order_registries: [Registry; MAX_QUANTUM_ALLOCATOR_ORDERS as usize],
}

impl QuantumAllocator {
    /// Construct a tier.
    ///
    /// # Arguments
    /// * `sharing` - True when allocations are shared across processes
    /// * `roster` - Dispatch table owned by the director
    /// * `smallest_order` - Smallest quantum order served
    /// * `largest_order` - Largest quantum order served
    /// * `partition_size_order` - Order of the partition size
    /// * `partition_count` - Number of partition slots
    /// * `base` - Lower bound of the managed span
    /// * `partitions` - Storage for the partition slot array
    /// * `side_data_size` - Bytes of side data per quantum
    /// * `side_data` - Storage for this tier's side data
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sharing: bool,
        roster: *mut AllocatorRoster,
        smallest_order: u32,
        largest_order: u32,
        partition_size_order: u32,
        partition_count: usize,
        base: u64,
        partitions: *mut Partition,
        side_data_size: u32,
        side_data: u64,
    ) -> Self {
        QuantumAllocator {
            header: AllocatorHeader::new(
                AllocatorKind::Quantum,
                Space::new(base, two_to_order(partition_size_order) * partition_count as u64),
                smallest_order,
                largest_order,
            ),
            sharing,
            partition_size_order,
            partition_count,
            side_data_size,
            side_data,
            roster,
            partitions,
            partition_registry: Registry::new(partition_count),
            order_registries: core::array::from_fn(|_| Registry::new(partition_count)),
        }
    }

    /// Header pointer for roster installation.
    #[inline(always)]
    pub fn header_ptr(&self) -> *mut AllocatorHeader {
        &self.header as *const AllocatorHeader as *mut AllocatorHeader
    }

    /// Bounds of the tier span.
    #[inline(always)]
    pub fn space(&self) -> &Space {
        self.header.space()
    }

    /// Test if `address` lies in this tier.
    #[inline(always)]
    pub fn contains(&self, address: u64) -> bool {
        self.space().contains(address)
    }

    /// Smallest quantum order served.
    #[inline(always)]
    pub fn smallest_order(&self) -> u32 {
        self.header.smallest_order()
    }

    /// Largest quantum order served.
    #[inline(always)]
    pub fn largest_order(&self) -> u32 {
        self.header.largest_order()
    }

    /// Partition size in bytes.
    #[inline(always)]
    pub fn partition_size(&self) -> u64 {
        two_to_order(self.partition_size_order)
    }

    /// Partition slot at `partition_index`.
    #[inline(always)]
    fn partition(&self, partition_index: usize) -> *mut Partition {
        debug_assert!(partition_index < self.partition_count, "partition out of range");
        unsafe { self.partitions.add(partition_index) }
    }

    /// Base address of the indexed partition.
    #[inline(always)]
    fn partition_base(&self, partition_index: usize) -> u64 {
        self.space().base() + ((partition_index as u64) << self.partition_size_order)
    }

    /// Partition index owning `address`.
    #[inline(always)]
    fn partition_index(&self, address: u64) -> usize {
        self.space().index_of(address, self.partition_size_order)
    }

    /// Partition owning `address`.
    #[inline(always)]
    fn partition_from_address(&self, address: u64) -> &Partition {
        unsafe { &*self.partition(self.partition_index(address)) }
    }

    /// Order registry slot for an allocation of `size` bytes.
    #[inline(always)]
    fn order_index(&self, size: u64) -> usize {
        let order = size_to_order(size).max(self.smallest_order());
        debug_assert!(order <= self.largest_order(), "size not valid for tier");
        (order - self.smallest_order()) as usize
    }

    /// Initialise the partition slot at `partition_index` for quanta of
    /// `quantum_size` bytes.
    fn new_partition(&self, partition_index: usize, quantum_size: u64) -> *mut Partition {
        let slot = self.partition(partition_index);
        let side_data = self.side_data
            + self.side_data_size as u64
                * partition_index as u64
                * MAX_PARTITION_QUANTUM as u64;

        unsafe {
            ptr::write(
                slot,
                Partition::new(
                    self.sharing,
                    self as *const QuantumAllocator as *mut QuantumAllocator,
                    self.partition_base(partition_index),
                    self.partition_size(),
                    quantum_size,
                    self.side_data_size,
                    side_data,
                ),
            );
        }

        slot
    }

    /// Mark a partition as serving the indexed order.
    fn online_partition(&self, partition_index: usize, order_index: usize) {
        self.order_registries[order_index].set(partition_index);
    }

    /// Take a partition out of rotation for the indexed order and point
    /// the roster back at this tier. Returns true if the partition was
    /// actually online for that order.
    fn offline_partition(&self, partition_index: usize, order_index: usize) -> bool {
        let cleared = self.order_registries[order_index].clear(partition_index);
        unsafe {
            (*self.roster).set(
                self.header_ptr(),
                self.smallest_order() + order_index as u32,
            );
        }

        cleared
    }

    /// Put a partition online for an order and install it as the direct
    /// roster route for that order.
    ///
    /// The roster store is plain; a concurrent install for the same order
    /// may be overwritten. The losing partition stays reachable through
    /// the order registry, only its fast path is lost.
    fn add_to_order(&self, order_index: usize, partition: *mut Partition, partition_index: usize) {
        self.online_partition(partition_index, order_index);
        unsafe {
            (*self.roster).set(
                (*partition).header_ptr(),
                self.smallest_order() + order_index as u32,
            );
        }
    }

    /// Claim a fresh partition slot and commit its backing store. Returns
    /// the slot index, or `None` when the registry is exhausted.
    fn allocate_partition(&self) -> Option<usize> {
        let partition_index = self.partition_registry.find_free()?;

        if !self.sharing {
            system::commit(self.partition_base(partition_index), self.partition_size());
        }

        Some(partition_index)
    }

    /// Create a new partition for the indexed order and put it online.
    /// Returns `None` if no slot is available.
    fn new_order_partition(&self, order_index: usize) -> Option<*mut Partition> {
        let partition_index = self.allocate_partition()?;

        let quantum_size = two_to_order(order_index as u32 + self.smallest_order());
        let partition = self.new_partition(partition_index, quantum_size);

        debug!(
            "tier {}..{}: partition {} promoted to order {}",
            self.smallest_order(),
            self.largest_order(),
            partition_index,
            order_index as u32 + self.smallest_order()
        );

        self.add_to_order(order_index, partition, partition_index);

        Some(partition)
    }

    /// Scan from the top for an empty partition of any order, retire it
    /// from its current order and re-establish it for `order_index`.
    /// Returns the partition, or `None` when nothing is reclaimable.
    fn free_up_partition(&self, order_index: usize) -> Option<*mut Partition> {
        for partition_index in (0..self.partition_count).rev() {
            if !self.partition_registry.is_set(partition_index) {
                continue;
            }

            let partition = unsafe { &*self.partition(partition_index) };
            let current_order = partition.quantum_order();

            // A slot mid-construction reads an order outside the tier
            // range; skip it.
            if current_order < self.smallest_order() || current_order > self.largest_order() {
                continue;
            }

            let current_order_index = (current_order - self.smallest_order()) as usize;

            // Provisionally empty?
            if !partition.is_empty() {
                continue;
            }

            // Take it offline from its current order, then test for
            // absolute emptiness now that no new claims can route here.
            if !self.offline_partition(partition_index, current_order_index)
                || !partition.is_empty()
            {
                // Lost the retirement race or a straggler claimed a
                // quantum. Restore it under its original order.
                self.online_partition(partition_index, current_order_index);
                continue;
            }

            debug!(
                "tier {}..{}: partition {} reassigned from order {} to order {}",
                self.smallest_order(),
                self.largest_order(),
                partition_index,
                current_order,
                order_index as u32 + self.smallest_order()
            );

            let quantum_size = two_to_order(order_index as u32 + self.smallest_order());
            let partition = self.new_partition(partition_index, quantum_size);
            self.add_to_order(order_index, partition, partition_index);

            return Some(partition);
        }

        None
    }

    /// Create a new partition for the indexed order, falling back to
    /// retiring an empty one.
    fn get_free_partition(&self, order_index: usize) -> Option<*mut Partition> {
        self.new_order_partition(order_index)
            .or_else(|| self.free_up_partition(order_index))
    }

    /// Claim one quantum of at least `size` bytes. Returns the address,
    /// or `None` when the tier is exhausted.
    pub fn allocate(&self, size: u64) -> Option<u64> {
        let mut iter = PartitionIter::new(self, size, true, true);

        while let Some(partition) = iter.next() {
            if let Some(address) = partition.allocate(size) {
                return Some(address);
            }
        }

        None
    }

    /// Release the quantum containing `address`.
    pub fn deallocate(&self, address: u64) {
        debug_assert!(self.contains(address), "address not in tier");
        self.partition_from_address(address).deallocate(address);
    }

    /// Claim `count` consecutive quanta of at least `size` bytes each.
    pub fn allocate_count(&self, size: u64, count: usize) -> Option<u64> {
        // A run longer than a partition can never succeed.
        if (self.partition_size() >> size_to_order(size)) < count as u64 {
            return None;
        }

        let mut iter = PartitionIter::new(self, size, true, true);

        while let Some(partition) = iter.next() {
            if let Some(address) = partition.allocate_count(size, count) {
                return Some(address);
            }
        }

        None
    }

    /// Release `count` consecutive quanta starting at `address`.
    pub fn deallocate_count(&self, address: u64, secure: bool, size: u64, count: usize) {
        debug_assert!(self.contains(address), "address not in tier");
        self.partition_from_address(address)
            .deallocate_count(address, secure, size, count);
    }

    /// Claim quanta in bulk. Fills `addresses` from the front and returns
    /// the number claimed, which may fall short of the request.
    pub fn allocate_bulk(&self, size: u64, addresses: &mut [u64], contiguous: bool) -> usize {
        let count = addresses.len();
        let mut iter = PartitionIter::new(self, size, true, false);
        let mut allocated = 0;

        if contiguous {
            // All blocks from one partition or none at all.
            if (count as u64) <= (self.partition_size() >> size_to_order(size)) {
                while allocated < count {
                    match iter.next() {
                        Some(partition) => {
                            allocated += partition.allocate_bulk_contiguous(addresses);
                        }
                        None => break,
                    }
                }
            }
        } else {
            while allocated < count {
                match iter.next() {
                    Some(partition) => {
                        allocated += partition.allocate_bulk(&mut addresses[allocated..]);
                    }
                    None => break,
                }
            }
        }

        allocated
    }

    /// Release a batch of addresses, stopping at the first one outside
    /// this tier. Returns the number released.
    pub fn deallocate_bulk(&self, addresses: &[u64], secure: bool) -> usize {
        let mut deallocated = 0;

        while deallocated < addresses.len() {
            let address = addresses[deallocated];

            if !self.contains(address) {
                break;
            }

            let partition = self.partition_from_address(address);
            deallocated += partition.deallocate_bulk(&addresses[deallocated..], secure);
        }

        deallocated
    }

    /// Zero the quantum containing `address`.
    pub fn clear(&self, address: u64) {
        debug_assert!(self.contains(address), "address not in tier");
        self.partition_from_address(address).clear(address);
    }

    /// Allocated size at `address`.
    pub fn allocation_size(&self, address: u64) -> u64 {
        self.partition_from_address(address).allocation_size(address)
    }

    /// Base of the allocation containing `address`.
    pub fn allocation_base(&self, address: u64) -> u64 {
        self.partition_from_address(address).allocation_base(address)
    }

    /// Side data address for the allocation containing `address`.
    pub fn allocation_side_data(&self, address: u64) -> u64 {
        self.partition_from_address(address).allocation_side_data(address)
    }

    /// Next live allocation after `address`, walking committed partitions
    /// in address order. Zero starts the walk; zero returned ends it.
    pub fn next_allocation(&self, address: u64) -> u64 {
        let mut address = address;
        let mut index = if address != 0 && self.contains(address) {
            self.partition_index(address)
        } else {
            0
        };

        while index < self.partition_count {
            if self.partition_registry.is_set(index) {
                let partition = unsafe { &*self.partition(index) };
                let next = partition.next_allocation(address);

                if next != 0 {
                    return next;
                }
            }

            index += 1;
            address = 0;
        }

        0
    }

    /// Contribute this tier's census and administrative footprint to the
    /// stats arrays.
    pub fn stats(&self, counts: &mut [u64], sizes: &mut [u64]) {
        sizes[1] += (core::mem::size_of::<QuantumAllocator>()
            + self.partition_count * core::mem::size_of::<Partition>()) as u64;

        for index in 0..self.partition_count {
            if self.partition_registry.is_set(index) {
                unsafe { &*self.partition(index) }.stats(counts, sizes);
            }
        }
    }
}

/// Walks the partitions currently online for one order, optionally
/// extending the rotation with fresh partitions when the walk runs dry.
struct PartitionIter<'a> {
    /// Owning tier.
    quantum_allocator: &'a QuantumAllocator,

    /// Order registry slot being walked.
    order_index: usize,

    /// Next partition index to consider.
    cursor: usize,

    /// Promote a new partition when the registry is exhausted.
    allocate_new: bool,

    /// Keep promoting on every subsequent exhaustion, not just the first.
    continuous: bool,
}

impl<'a> PartitionIter<'a> {
    fn new(
        quantum_allocator: &'a QuantumAllocator,
        size: u64,
        allocate_new: bool,
        continuous: bool,
    ) -> Self {
        debug_assert!(!continuous || allocate_new, "continuous only if allocate_new");

        PartitionIter {
            quantum_allocator,
            order_index: quantum_allocator.order_index(size),
            cursor: 0,
            allocate_new,
            continuous,
        }
    }

    /// Next online partition, or a freshly promoted one, or `None`.
    fn next(&mut self) -> Option<&'a Partition> {
        let registry = &self.quantum_allocator.order_registries[self.order_index];

        if let Some(partition_index) = registry.next_set(self.cursor) {
            self.cursor = partition_index + 1;
            return Some(unsafe { &*self.quantum_allocator.partition(partition_index) });
        }

        if self.allocate_new {
            if !self.continuous {
                self.allocate_new = false;
            }

            return self
                .quantum_allocator
                .get_free_partition(self.order_index)
                .map(|partition| unsafe { &*partition });
        }

        None
    }
}
