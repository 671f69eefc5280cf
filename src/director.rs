//! Director: creation, wiring and top-level dispatch.

use core::ptr;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};
use std::ffi::CStr;

use log::debug;
use thiserror::Error;

use crate::bits::{round_up, round_up_power_of_two, size_to_order, two_to_order};
use crate::constants::{
    LARGEST_SIZE_ORDER, MAX_ALLOCATION_ORDER, MAX_ALLOCATION_SIZE, MAX_LINK_NAME, MAX_ORDER,
    MAX_PARTITION_QUANTUM, MAX_QUANTUM_ALLOCATORS, MAX_QUANTUM_ALLOCATOR_ORDERS,
    MAX_SIDE_DATA_SIZE, PAGE_SIZE, SMALLEST_SIZE_ORDER, STATS_SIZE,
};
use crate::fit::FitSize;
use crate::partition::Partition;
use crate::quantum::QuantumAllocator;
use crate::roster::{AllocatorKind, AllocatorRoster, NullAllocator};
use crate::slab::{Slab, SlabAllocator};
use crate::space::{Arena, Space};
use crate::system;

/// Failures surfaced by [`Director::create`]. Everything after creation
/// signals by null results, never by error values.
#[derive(Debug, Error)]
pub enum CreateError {
    #[error("invalid configuration: {0}")]
    Config(&'static str),

    #[error("virtual reservation of {0} bytes failed")]
    Reserve(u64),

    #[error("shared link could not be created or opened")]
    SharedLink,

    #[error("shared mapping at {0:#x} failed")]
    MapShared(u64),
}

/// Creation parameters, validated once up front.
struct Config {
    sharing: bool,
    secure: bool,
    partition_counts: [usize; MAX_QUANTUM_ALLOCATORS],
    max_slab_count: usize,
    side_data_size: u32,
}

/// Coordinates the quantum tiers, the slab allocator and the null
/// allocator behind one reserved region and one dispatch roster.
///
/// The director and every administrative structure it wires live inside
/// the reservation itself, placed by a bump arena. The identical arena
/// walk runs once to size the reservation and once to populate it, and a
/// process attaching to an existing shared region runs the walk a third
/// time with construction disabled to recover the same addresses.
#[repr(C)]
pub struct Director {
    /// Bounds of the whole reservation.
    space: Space,

    /// True when backed by a shared link.
    sharing: bool,

    /// True when deallocation zeroes.
    secure: bool,

    /// Dispatch table mapping size order to allocator.
    roster: *mut AllocatorRoster,

    /// The three quantum tiers, smallest orders first.
    quantum_allocators: [*mut QuantumAllocator; MAX_QUANTUM_ALLOCATORS],

    /// Allocator for blocks above the quantum ceiling.
    slab_allocator: *mut SlabAllocator,

    /// Sink for orders nothing serves.
    null_allocator: NullAllocator,

    /// User reference word. Opaque to the allocator; gives clients a
    /// lock-free root slot for locating their own data, in particular
    /// inside a shared region.
    reference: AtomicU64,

    /// Shared link name, NUL terminated, all zeroes when not sharing.
    link_name: [u8; MAX_LINK_NAME],
}

impl Director {
    /// Walk the administrative layout. With `creating` the structures are
    /// constructed in place; without it only the addresses are computed.
    /// Returns the director's address within the arena.
    fn build(arena: &mut Arena, creating: bool, config: &Config, link_name: &[u8]) -> *mut Director {
        let mut bases = [0u64; MAX_QUANTUM_ALLOCATORS];

        // Carve the tier regions largest partitions first so every
        // region stays aligned for its partition size.
        for tier in (0..MAX_QUANTUM_ALLOCATORS).rev() {
            let smallest_order =
                SMALLEST_SIZE_ORDER + tier as u32 * MAX_QUANTUM_ALLOCATOR_ORDERS;
            let partition_size = (MAX_PARTITION_QUANTUM as u64) << smallest_order;
            let region_size = partition_size * config.partition_counts[tier] as u64;

            bases[tier] = arena.allocate(region_size);
        }

        // The rest of the reservation is administrative memory; commit
        // it in one stroke. Shared mappings are already read/write.
        if creating && !config.sharing {
            let tail = arena.size() - arena.allocated();
            if tail != 0 {
                system::commit(arena.next(), tail);
            }
        }

        let roster = arena.allocate_struct::<AllocatorRoster>();

        if creating {
            unsafe {
                ptr::write(roster, AllocatorRoster::new());
            }
        }

        // Tiers, smallest orders first.
        let mut quantum_allocators = [ptr::null_mut::<QuantumAllocator>(); MAX_QUANTUM_ALLOCATORS];

        for tier in 0..MAX_QUANTUM_ALLOCATORS {
            let smallest_order =
                SMALLEST_SIZE_ORDER + tier as u32 * MAX_QUANTUM_ALLOCATOR_ORDERS;
            let largest_order = smallest_order + MAX_QUANTUM_ALLOCATOR_ORDERS - 1;
            let partition_size = (MAX_PARTITION_QUANTUM as u64) << smallest_order;
            let partition_count = config.partition_counts[tier];

            let side_data = arena.allocate(
                partition_count as u64
                    * config.side_data_size as u64
                    * MAX_PARTITION_QUANTUM as u64,
            );

            let partitions = arena.allocate_array::<Partition>(partition_count);
            let allocator = arena.allocate_struct::<QuantumAllocator>();

            if creating {
                unsafe {
                    ptr::write(
                        allocator,
                        QuantumAllocator::new(
                            config.sharing,
                            roster,
                            smallest_order,
                            largest_order,
                            size_to_order(partition_size),
                            partition_count,
                            bases[tier],
                            partitions,
                            config.side_data_size,
                            side_data,
                        ),
                    );
                }
            }

            quantum_allocators[tier] = allocator;
        }

        // Slab allocator. The freshly committed table reads as empty
        // slabs, which is exactly the initial state.
        let slabs = arena.allocate_array::<Slab>(config.max_slab_count);
        let slab_side_data =
            arena.allocate(config.max_slab_count as u64 * config.side_data_size as u64);
        let slab_allocator = arena.allocate_struct::<SlabAllocator>();

        if creating {
            unsafe {
                ptr::write(
                    slab_allocator,
                    SlabAllocator::new(
                        config.secure,
                        config.max_slab_count,
                        slabs,
                        config.side_data_size,
                        slab_side_data,
                    ),
                );
            }
        }

        let director = arena.allocate_struct::<Director>();

        if creating {
            let mut name = [0u8; MAX_LINK_NAME];
            name[..link_name.len()].copy_from_slice(link_name);

            unsafe {
                ptr::write(
                    director,
                    Director {
                        space: Space::new(arena.base(), arena.size()),
                        sharing: config.sharing,
                        secure: config.secure,
                        roster,
                        quantum_allocators,
                        slab_allocator,
                        null_allocator: NullAllocator::new(),
                        reference: AtomicU64::new(0),
                        link_name: name,
                    },
                );

                // Roster pointers must target the placed director, so
                // population happens after the write above.
                (*director).populate_roster();
            }
        }

        director
    }

    /// Fill the roster: null below the smallest order and at or above
    /// the maximum allocation order, the tiers and the slab allocator in
    /// between.
    unsafe fn populate_roster(&self) {
        let roster = &*self.roster;

        roster.set_range(self.null_allocator.header_ptr(), 0, SMALLEST_SIZE_ORDER);

        for allocator in self.quantum_allocators {
            let allocator = &*allocator;
            roster.set_range(
                allocator.header_ptr(),
                allocator.smallest_order(),
                allocator.largest_order() + 1,
            );
        }

        roster.set_range(
            (*self.slab_allocator).header_ptr(),
            LARGEST_SIZE_ORDER + 1,
            MAX_ALLOCATION_ORDER,
        );

        roster.set_range(
            self.null_allocator.header_ptr(),
            MAX_ALLOCATION_ORDER,
            MAX_ORDER,
        );
    }

    /// Create a director.
    ///
    /// # Arguments
    /// * `address` - Fixed base for the reservation, aligned to the
    ///   largest quantum size, or zero for a floating reserve
    /// * `link_name` - Shared link name; together with a fixed address
    ///   this backs the region with a named shared memory object
    /// * `secure` - Zero blocks on deallocation
    /// * `small_partition_count` - Partition count for the small tier
    /// * `medium_partition_count` - Partition count for the medium tier
    /// * `large_partition_count` - Partition count for the large tier
    /// * `max_slab_count` - Capacity of the slab table
    /// * `side_data_size` - Bytes of side data per allocation, 0 to 8
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        address: u64,
        link_name: Option<&CStr>,
        secure: bool,
        small_partition_count: usize,
        medium_partition_count: usize,
        large_partition_count: usize,
        max_slab_count: usize,
        side_data_size: u32,
    ) -> Result<NonNull<Director>, CreateError> {
        if side_data_size as usize > MAX_SIDE_DATA_SIZE {
            return Err(CreateError::Config("side data size out of range"));
        }

        if address & (two_to_order(LARGEST_SIZE_ORDER) - 1) != 0 {
            return Err(CreateError::Config(
                "address must be a multiple of the largest quantum size",
            ));
        }

        let name_bytes = link_name.map(|name| name.to_bytes()).unwrap_or(&[]);

        if name_bytes.len() >= MAX_LINK_NAME {
            return Err(CreateError::Config("link name too long"));
        }

        let sharing = address != 0 && !name_bytes.is_empty();

        if sharing && max_slab_count != 0 {
            return Err(CreateError::Config("cannot share slabs"));
        }

        let config = Config {
            sharing,
            secure,
            partition_counts: [
                small_partition_count,
                medium_partition_count,
                large_partition_count,
            ],
            max_slab_count,
            side_data_size,
        };

        // Dry run to size the reservation.
        let mut sizing = Arena::sizing();
        Self::build(&mut sizing, false, &config, name_bytes);
        let size = round_up(sizing.allocated(), PAGE_SIZE);

        debug!(
            "creating director: {} bytes, sharing {}, secure {}",
            size, sharing, secure
        );

        if sharing {
            let name = link_name.unwrap();

            let fd = match system::create_link(name) {
                Some(fd) => {
                    if !system::truncate_link(fd, size) {
                        system::close_link(fd);
                        system::unlink(name);
                        return Err(CreateError::SharedLink);
                    }

                    fd
                }
                None => {
                    // Lost the creation race. Attach to the existing
                    // region and overlay its structures.
                    let fd = system::open_link(name).ok_or(CreateError::SharedLink)?;

                    let share = match system::map_shared(size, address, fd) {
                        Some(share) => share,
                        None => {
                            system::close_link(fd);
                            return Err(CreateError::MapShared(address));
                        }
                    };

                    system::close_link(fd);

                    let mut mapping = Arena::new(share, size);
                    let director = Self::build(&mut mapping, false, &config, name_bytes);

                    return NonNull::new(director).ok_or(CreateError::MapShared(address));
                }
            };

            let base = reserve_or_fail(size, address, Some(fd))?;
            system::close_link(fd);

            let mut creating = Arena::new(base, size);
            let director = Self::build(&mut creating, true, &config, name_bytes);

            return NonNull::new(director).ok_or(CreateError::Reserve(size));
        }

        let base = if address == 0 {
            system::reserve_aligned(size, two_to_order(LARGEST_SIZE_ORDER))
                .ok_or(CreateError::Reserve(size))?
        } else {
            reserve_or_fail(size, address, None)?
        };

        let mut creating = Arena::new(base, size);
        let director = Self::build(&mut creating, true, &config, name_bytes);

        NonNull::new(director).ok_or(CreateError::Reserve(size))
    }

    /// Bytes required to create a director with the given configuration.
    pub fn create_size(
        secure: bool,
        small_partition_count: usize,
        medium_partition_count: usize,
        large_partition_count: usize,
        max_slab_count: usize,
        side_data_size: u32,
    ) -> u64 {
        let config = Config {
            sharing: false,
            secure,
            partition_counts: [
                small_partition_count,
                medium_partition_count,
                large_partition_count,
            ],
            max_slab_count,
            side_data_size,
        };

        let mut sizing = Arena::sizing();
        Self::build(&mut sizing, false, &config, &[]);

        round_up(sizing.allocated(), PAGE_SIZE)
    }

    /// Tear a director down: release every slab reservation, optionally
    /// remove the shared link, and return the whole region.
    ///
    /// # Safety
    /// `director` must have come from [`Director::create`] and must not
    /// be used afterwards by any thread or process mapping.
    pub unsafe fn destroy(director: *mut Director, unlink: bool) {
        let this = &*director;

        (*this.slab_allocator).release();

        if unlink && this.link_name[0] != 0 {
            if let Ok(name) = CStr::from_bytes_until_nul(&this.link_name) {
                system::unlink(name);
            }
        }

        debug!("destroying director at {:#x}", this.space.base());

        system::release(this.space.base(), this.space.size());
    }

    /// The three quantum tiers.
    #[inline(always)]
    fn tiers(&self) -> impl Iterator<Item = &QuantumAllocator> {
        self.quantum_allocators
            .iter()
            .map(|&allocator| unsafe { &*allocator })
    }

    /// The slab allocator.
    #[inline(always)]
    fn slab(&self) -> &SlabAllocator {
        unsafe { &*self.slab_allocator }
    }

    /// Current value of the user reference word.
    pub fn get_reference(&self) -> u64 {
        self.reference.load(Ordering::Acquire)
    }

    /// Conditionally replace the user reference word. Returns true when
    /// the previous value was `old_value` and the swap took effect.
    pub fn set_reference(&self, old_value: u64, new_value: u64) -> bool {
        self.reference
            .compare_exchange(old_value, new_value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Allocate a block of at least `size` bytes. Returns the address,
    /// or `None` when the size is out of range or capacity is exhausted.
    pub fn allocate(&self, size: u64) -> Option<u64> {
        if size > MAX_ALLOCATION_SIZE {
            return None;
        }

        let aligned_size = round_up_power_of_two(size);
        let mut header = unsafe { (*self.roster).get(size_to_order(aligned_size)) };

        unsafe {
            // A promoted partition owns the fast path for its order; on
            // failure fall back through its managing tier.
            if (*header).kind() == AllocatorKind::Partition {
                let partition = &*(header as *const Partition);

                if let Some(address) = partition.allocate(aligned_size) {
                    return Some(address);
                }

                header = (*partition.quantum_allocator()).header_ptr();
            }

            match (*header).kind() {
                AllocatorKind::Quantum => {
                    (*(header as *const QuantumAllocator)).allocate(aligned_size)
                }
                AllocatorKind::Slab => (*(header as *const SlabAllocator)).allocate(aligned_size),
                _ => None,
            }
        }
    }

    /// Release the block containing `address`. Null and foreign
    /// addresses are ignored.
    pub fn deallocate(&self, address: u64) {
        if address == 0 {
            return;
        }

        for allocator in self.tiers() {
            if allocator.contains(address) {
                if self.secure {
                    allocator.clear(address);
                }

                allocator.deallocate(address);
                return;
            }
        }

        self.slab().deallocate(address);
    }

    /// Resize a block. Returns the old address when it already fits and
    /// is not a significant shrink; otherwise allocates anew, copies and
    /// releases the old block. A null old address is a plain allocate.
    /// Returns `None` when a needed allocation fails, leaving the old
    /// block intact.
    pub fn reallocate(&self, old_address: u64, new_size: u64) -> Option<u64> {
        if new_size > MAX_ALLOCATION_SIZE {
            return None;
        }

        if old_address == 0 {
            return self.allocate(new_size);
        }

        let old_size = self.allocation_size(old_address);

        if old_size < round_up_power_of_two(new_size)
            || size_to_order(new_size) < size_to_order(old_size)
        {
            let new_address = self.allocate(new_size)?;

            if old_size != 0 {
                let copy_size = old_size.min(self.allocation_size(new_address));
                system::copy(old_address, new_address, copy_size);
                self.deallocate(old_address);
            }

            return Some(new_address);
        }

        Some(old_address)
    }

    /// Zero the block containing `address` in place.
    pub fn clear(&self, address: u64) {
        if address == 0 {
            return;
        }

        for allocator in self.tiers() {
            if allocator.contains(address) {
                allocator.clear(address);
                return;
            }
        }

        self.slab().clear(address);
    }

    /// Allocate `count` consecutive blocks of at least `size` bytes
    /// each. Must be paired with [`Director::deallocate_count`].
    pub fn allocate_count(&self, size: u64, count: usize) -> Option<u64> {
        if size > MAX_ALLOCATION_SIZE || count == 0 {
            return None;
        }

        let aligned_size = round_up_power_of_two(size);
        let mut header = unsafe { (*self.roster).get(size_to_order(aligned_size)) };

        unsafe {
            if (*header).kind() == AllocatorKind::Partition {
                let partition = &*(header as *const Partition);

                if let Some(address) = partition.allocate_count(aligned_size, count) {
                    return Some(address);
                }

                header = (*partition.quantum_allocator()).header_ptr();
            }

            match (*header).kind() {
                AllocatorKind::Quantum => {
                    (*(header as *const QuantumAllocator)).allocate_count(aligned_size, count)
                }
                AllocatorKind::Slab => {
                    (*(header as *const SlabAllocator)).allocate_count(aligned_size, count)
                }
                _ => None,
            }
        }
    }

    /// Release blocks allocated with [`Director::allocate_count`].
    pub fn deallocate_count(&self, address: u64, size: u64, count: usize) {
        if address == 0 {
            return;
        }

        for allocator in self.tiers() {
            if allocator.contains(address) {
                allocator.deallocate_count(address, self.secure, size, count);
                return;
            }
        }

        self.slab().deallocate_count(address, size, count);
    }

    /// Allocate blocks in bulk into `addresses`. Returns the number
    /// actually allocated, which may be zero or short of the request.
    pub fn allocate_bulk(&self, size: u64, addresses: &mut [u64], contiguous: bool) -> usize {
        if size > MAX_ALLOCATION_SIZE {
            return 0;
        }

        let order = size_to_order(size);

        for allocator in self.tiers() {
            if order <= allocator.largest_order() {
                return allocator.allocate_bulk(size, addresses, contiguous);
            }
        }

        self.slab().allocate_bulk(size, addresses, contiguous)
    }

    /// Release a batch of addresses of mixed provenance. Null and
    /// foreign entries are skipped.
    pub fn deallocate_bulk(&self, addresses: &[u64]) {
        let mut deallocated = 0;

        while deallocated < addresses.len() {
            let first = addresses[deallocated];
            let mut found = false;

            for allocator in self.tiers() {
                if allocator.contains(first) {
                    deallocated +=
                        allocator.deallocate_bulk(&addresses[deallocated..], self.secure);
                    found = true;
                    break;
                }
            }

            if !found {
                let slabs = self.slab().deallocate_bulk(&addresses[deallocated..]);
                deallocated += if slabs != 0 { slabs } else { 1 };
            }
        }
    }

    /// Allocate with bounded internal fragmentation (see [`FitSize`]).
    /// Must be paired with [`Director::deallocate_fit`] using the same
    /// size and degree.
    pub fn allocate_fit(&self, size: u64, degree: u32) -> Option<u64> {
        if size > MAX_ALLOCATION_SIZE {
            return None;
        }

        let fit = FitSize::new(size, degree);
        self.allocate_count(fit.size(), fit.count())
    }

    /// Release a block allocated with [`Director::allocate_fit`].
    pub fn deallocate_fit(&self, address: u64, size: u64, degree: u32) {
        if size > MAX_ALLOCATION_SIZE {
            return;
        }

        let fit = FitSize::new(size, degree);
        self.deallocate_count(address, fit.size(), fit.count());
    }

    /// Allocated size at `address`, zero when unknown.
    pub fn allocation_size(&self, address: u64) -> u64 {
        if address == 0 {
            return 0;
        }

        for allocator in self.tiers() {
            if allocator.contains(address) {
                return allocator.allocation_size(address);
            }
        }

        self.slab().allocation_size(address)
    }

    /// Base of the block containing `address`, zero when unknown.
    pub fn allocation_base(&self, address: u64) -> u64 {
        if address == 0 {
            return 0;
        }

        for allocator in self.tiers() {
            if allocator.contains(address) {
                return allocator.allocation_base(address);
            }
        }

        self.slab().allocation_base(address)
    }

    /// Side data address for the block containing `address`, zero when
    /// unknown or when the configuration carries no side data.
    pub fn allocation_side_data(&self, address: u64) -> u64 {
        if address == 0 {
            return 0;
        }

        for allocator in self.tiers() {
            if allocator.contains(address) {
                return allocator.allocation_side_data(address);
            }
        }

        self.slab().allocation_side_data(address)
    }

    /// Walk the live allocations. Start with zero; each call returns the
    /// next allocation base, and zero ends the walk. Best effort during
    /// concurrent churn, exact under quiescence.
    pub fn next_allocation(&self, address: u64) -> u64 {
        let mut address = address;

        for allocator in self.tiers() {
            if address == 0 || allocator.contains(address) {
                let next = allocator.next_allocation(address);

                if next != 0 {
                    return next;
                }

                address = 0;
            }
        }

        self.slab().next_allocation(address)
    }

    /// Sample the live allocation census.
    ///
    /// Slot 0 sums all other slots. Slot 1 carries the administrative
    /// footprint. Slots 3 to 52 carry totals for blocks of that size
    /// order. Remaining slots are unused.
    pub fn stats(&self, counts: &mut [u64; STATS_SIZE], sizes: &mut [u64; STATS_SIZE]) {
        counts.fill(0);
        sizes.fill(0);

        counts[1] += 1;
        sizes[1] += core::mem::size_of::<Director>() as u64;

        for allocator in self.tiers() {
            allocator.stats(counts, sizes);
        }

        self.slab().stats(counts, sizes);

        let mut count = 0;
        let mut size = 0;

        for slot in 1..STATS_SIZE {
            count += counts[slot];
            size += sizes[slot];
        }

        counts[0] = count;
        sizes[0] = size;
    }
}

/// Fixed-location reserve with error mapping.
fn reserve_or_fail(size: u64, address: u64, fd: Option<i32>) -> Result<u64, CreateError> {
    system::reserve(size, address, fd).ok_or(CreateError::Reserve(size))
}
