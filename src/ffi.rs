//! C ABI entry points.
//!
//! Thin translation from the `qba_*` symbols to [`Director`] operations.
//! Error signalling is by null or zero returns; there is no errno-style
//! side channel. Every function takes the opaque handle returned by
//! [`qba_create`].

use core::ffi::{c_char, c_int, c_void};
use core::slice;
use std::ffi::CStr;

use crate::constants::STATS_SIZE;
use crate::director::Director;

/// Release number of this build.
const RELEASE: i32 = 0;

/// Major version of this build.
const MAJOR: i32 = 1;

/// Minor version of this build.
const MINOR: i32 = 0;

/// Version string handed out by [`qba_version_string`].
const VERSION_STRING: &CStr = c"QBA 0.1.0 Experimental";

/// Version encoded as an integer.
///
/// Bits 23-16 carry the release number, bits 15-8 the major number and
/// bits 7-0 the minor number.
#[no_mangle]
pub extern "C" fn qba_version() -> c_int {
    (RELEASE << 16) | (MAJOR << 8) | MINOR
}

/// Version information as an informative C string.
#[no_mangle]
pub extern "C" fn qba_version_string() -> *const c_char {
    VERSION_STRING.as_ptr()
}

/// Create an allocator instance. Returns an opaque handle, or null when
/// the configuration is invalid or the reservation fails.
///
/// A zero `address` floats the reservation; a non-zero address must be a
/// multiple of the largest quantum size. A non-empty `link_name` with a
/// fixed address backs the region with a named shared memory object: the
/// first creator initialises it, later creators overlay it.
///
/// # Safety
/// `link_name` must be null or a valid NUL terminated string.
#[no_mangle]
pub unsafe extern "C" fn qba_create(
    address: usize,
    link_name: *const c_char,
    secure: bool,
    small_partition_count: c_int,
    medium_partition_count: c_int,
    large_partition_count: c_int,
    max_slab_count: c_int,
    side_data_size: c_int,
) -> *mut Director {
    if small_partition_count < 0
        || medium_partition_count < 0
        || large_partition_count < 0
        || max_slab_count < 0
        || side_data_size < 0
    {
        return core::ptr::null_mut();
    }

    let link_name = if link_name.is_null() {
        None
    } else {
        Some(CStr::from_ptr(link_name))
    };

    match Director::create(
        address as u64,
        link_name,
        secure,
        small_partition_count as usize,
        medium_partition_count as usize,
        large_partition_count as usize,
        max_slab_count as usize,
        side_data_size as u32,
    ) {
        Ok(director) => director.as_ptr(),
        Err(error) => {
            log::debug!("create failed: {}", error);
            core::ptr::null_mut()
        }
    }
}

/// Bytes required to create an instance with the given configuration.
#[no_mangle]
pub extern "C" fn qba_create_size(
    secure: bool,
    small_partition_count: c_int,
    medium_partition_count: c_int,
    large_partition_count: c_int,
    max_slab_count: c_int,
    side_data_size: c_int,
) -> usize {
    Director::create_size(
        secure,
        small_partition_count.max(0) as usize,
        medium_partition_count.max(0) as usize,
        large_partition_count.max(0) as usize,
        max_slab_count.max(0) as usize,
        side_data_size.max(0) as u32,
    ) as usize
}

/// Return an instance's memory to the system, optionally removing the
/// shared link.
///
/// # Safety
/// `qba` must be a live handle from [`qba_create`]; it is dead after.
#[no_mangle]
pub unsafe extern "C" fn qba_destroy(qba: *mut Director, unlink: bool) {
    if !qba.is_null() {
        Director::destroy(qba, unlink);
    }
}

/// Current value of the user reference.
///
/// # Safety
/// `qba` must be a live handle from [`qba_create`].
#[no_mangle]
pub unsafe extern "C" fn qba_get_reference(qba: *mut Director) -> *mut c_void {
    (*qba).get_reference() as *mut c_void
}

/// Conditionally set the user reference. Returns true if the previous
/// value was `old_value` and the swap took effect.
///
/// # Safety
/// `qba` must be a live handle from [`qba_create`].
#[no_mangle]
pub unsafe extern "C" fn qba_set_reference(
    qba: *mut Director,
    old_value: *mut c_void,
    new_value: *mut c_void,
) -> bool {
    (*qba).set_reference(old_value as u64, new_value as u64)
}

/// Allocate a block of at least `size` bytes. Returns null when the
/// request cannot be satisfied.
///
/// # Safety
/// `qba` must be a live handle from [`qba_create`].
#[no_mangle]
pub unsafe extern "C" fn qba_allocate(qba: *mut Director, size: u64) -> *mut c_void {
    (*qba).allocate(size).unwrap_or(0) as *mut c_void
}

/// Recycle a block from [`qba_allocate`] or [`qba_reallocate`]. Null and
/// foreign addresses are ignored.
///
/// # Safety
/// `qba` must be a live handle from [`qba_create`].
#[no_mangle]
pub unsafe extern "C" fn qba_deallocate(qba: *mut Director, address: *mut c_void) {
    (*qba).deallocate(address as u64);
}

/// Resize a block, reallocating and copying when it no longer fits.
/// Returns null when a needed allocation fails (old block kept).
///
/// # Safety
/// `qba` must be a live handle from [`qba_create`].
#[no_mangle]
pub unsafe extern "C" fn qba_reallocate(
    qba: *mut Director,
    address: *mut c_void,
    size: u64,
) -> *mut c_void {
    (*qba).reallocate(address as u64, size).unwrap_or(0) as *mut c_void
}

/// Zero a block in place.
///
/// # Safety
/// `qba` must be a live handle from [`qba_create`].
#[no_mangle]
pub unsafe extern "C" fn qba_clear(qba: *mut Director, address: *mut c_void) {
    (*qba).clear(address as u64);
}

/// Allocated size of a block, possibly larger than requested. Zero for
/// null or unmanaged addresses.
///
/// # Safety
/// `qba` must be a live handle from [`qba_create`].
#[no_mangle]
pub unsafe extern "C" fn qba_size(qba: *mut Director, address: *mut c_void) -> usize {
    (*qba).allocation_size(address as u64) as usize
}

/// Base allocation address recovered from any interior address. Null
/// for null or unmanaged addresses.
///
/// # Safety
/// `qba` must be a live handle from [`qba_create`].
#[no_mangle]
pub unsafe extern "C" fn qba_base(qba: *mut Director, address: *mut c_void) -> *mut c_void {
    (*qba).allocation_base(address as u64) as *mut c_void
}

/// Side data address for an allocated block. Null when the configured
/// side data size is zero or the address is unknown.
///
/// # Safety
/// `qba` must be a live handle from [`qba_create`].
#[no_mangle]
pub unsafe extern "C" fn qba_side_data(qba: *mut Director, address: *mut c_void) -> *mut c_void {
    (*qba).allocation_side_data(address as u64) as *mut c_void
}

/// Walk the live allocations: start with null, feed each result back,
/// null ends the walk. Results may be stale under concurrent churn and
/// must not be dereferenced, only passed to the query functions.
///
/// # Safety
/// `qba` must be a live handle from [`qba_create`].
#[no_mangle]
pub unsafe extern "C" fn qba_next(qba: *mut Director, address: *mut c_void) -> *mut c_void {
    (*qba).next_allocation(address as u64) as *mut c_void
}

/// Sample the allocation census into two arrays of 64 slots. Slot 0
/// sums the rest, slot 1 is administrative overhead, slots 3 to 52
/// carry per-order totals.
///
/// # Safety
/// `qba` must be a live handle; `counts` and `sizes` must point at 64
/// writable `u64` slots each.
#[no_mangle]
pub unsafe extern "C" fn qba_stats(qba: *mut Director, counts: *mut u64, sizes: *mut u64) {
    let counts = &mut *(counts as *mut [u64; STATS_SIZE]);
    let sizes = &mut *(sizes as *mut [u64; STATS_SIZE]);
    (*qba).stats(counts, sizes);
}

/// Allocate `count` blocks of `size` bytes into `addresses`. Returns
/// the number actually allocated, possibly zero or short. Contiguous
/// requests are faster but risk external fragmentation or falling
/// short.
///
/// # Safety
/// `qba` must be a live handle; `addresses` must point at `count`
/// writable slots.
#[no_mangle]
pub unsafe extern "C" fn qba_allocate_bulk(
    qba: *mut Director,
    size: u64,
    count: c_int,
    addresses: *mut *mut c_void,
    contiguous: bool,
) -> c_int {
    if count <= 0 || addresses.is_null() {
        return 0;
    }

    let addresses = slice::from_raw_parts_mut(addresses as *mut u64, count as usize);
    (*qba).allocate_bulk(size, addresses, contiguous) as c_int
}

/// Recycle multiple blocks at once.
///
/// # Safety
/// `qba` must be a live handle; `addresses` must point at `count`
/// readable slots.
#[no_mangle]
pub unsafe extern "C" fn qba_deallocate_bulk(
    qba: *mut Director,
    count: c_int,
    addresses: *mut *mut c_void,
) {
    if count <= 0 || addresses.is_null() {
        return;
    }

    let addresses = slice::from_raw_parts(addresses as *const u64, count as usize);
    (*qba).deallocate_bulk(addresses);
}

/// Allocate `count` consecutive blocks of `size` bytes. Only
/// [`qba_deallocate_count`] and [`qba_side_data`] may be used with the
/// result.
///
/// # Safety
/// `qba` must be a live handle from [`qba_create`].
#[no_mangle]
pub unsafe extern "C" fn qba_allocate_count(
    qba: *mut Director,
    size: u64,
    count: c_int,
) -> *mut c_void {
    if count <= 0 {
        return core::ptr::null_mut();
    }

    (*qba).allocate_count(size, count as usize).unwrap_or(0) as *mut c_void
}

/// Recycle blocks allocated with [`qba_allocate_count`].
///
/// # Safety
/// `qba` must be a live handle from [`qba_create`].
#[no_mangle]
pub unsafe extern "C" fn qba_deallocate_count(
    qba: *mut Director,
    address: *mut c_void,
    size: u64,
    count: c_int,
) {
    if count > 0 {
        (*qba).deallocate_count(address as u64, size, count as usize);
    }
}

/// Allocate with internal fragmentation bounded by `degree` (1 to 4).
/// Only [`qba_deallocate_fit`] and [`qba_side_data`] may be used with
/// the result.
///
/// # Safety
/// `qba` must be a live handle from [`qba_create`].
#[no_mangle]
pub unsafe extern "C" fn qba_allocate_fit(
    qba: *mut Director,
    size: u64,
    degree: c_int,
) -> *mut c_void {
    if !(1..=crate::constants::MAX_FIT_DEGREE as c_int).contains(&degree) {
        return core::ptr::null_mut();
    }

    (*qba).allocate_fit(size, degree as u32).unwrap_or(0) as *mut c_void
}

/// Recycle a block allocated with [`qba_allocate_fit`], using the same
/// size and degree.
///
/// # Safety
/// `qba` must be a live handle from [`qba_create`].
#[no_mangle]
pub unsafe extern "C" fn qba_deallocate_fit(
    qba: *mut Director,
    address: *mut c_void,
    size: u64,
    degree: c_int,
) {
    if (1..=crate::constants::MAX_FIT_DEGREE as c_int).contains(&degree) {
        (*qba).deallocate_fit(address as u64, size, degree as u32);
    }
}
