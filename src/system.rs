//! Thin wrappers over the OS virtual memory and shared memory primitives.
//!
//! Reservation is separated from commitment: a reserve only claims address
//! space (no TLBs, no backing store), a commit makes a reserved range
//! usable, an uncommit drops it back to reserved. All sizes are multiples
//! of the page size.

use std::ffi::CStr;
use std::os::unix::io::RawFd;
use std::ptr;

use log::debug;

use crate::bits::{is_power_of_two, round_up};
use crate::constants::PAGE_SIZE;

/// Page-size mask.
const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Threshold below which clearing writes in place rather than recommitting.
const CLEAR_RECOMMIT_THRESHOLD: u64 = 32 * 1024;

#[inline]
fn page_aligned(size: u64) -> bool {
    size & PAGE_MASK == 0
}

/// Reserve an address range for future use. Returns the reserve address,
/// or `None` if the request cannot be satisfied.
///
/// No backing store is attached by this call unless a shared file
/// descriptor is supplied, in which case the mapping is shared and
/// immediately read/write.
///
/// # Arguments
/// * `size` - Bytes to reserve, a multiple of the page size
/// * `location` - Fixed memory location, or zero for floating
/// * `fd` - File descriptor of a shared link, or `None`
pub fn reserve(size: u64, location: u64, fd: Option<RawFd>) -> Option<u64> {
    debug_assert!(page_aligned(size), "size must be page aligned");

    let mut flags = if location != 0 { libc::MAP_FIXED } else { 0 };
    let protection;

    match fd {
        Some(_) => {
            protection = libc::PROT_READ | libc::PROT_WRITE;
            flags |= libc::MAP_SHARED;
        }
        None => {
            protection = libc::PROT_NONE;
            flags |= libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
        }
    }

    let address = unsafe {
        libc::mmap(
            location as *mut libc::c_void,
            size as libc::size_t,
            protection,
            flags,
            fd.unwrap_or(-1),
            0,
        )
    };

    if address == libc::MAP_FAILED {
        None
    } else {
        Some(address as u64)
    }
}

/// Reserve an address range with the given power-of-two alignment.
///
/// Over-reserves by the alignment, excises the aligned middle and returns
/// the excess prefix and postfix to the system. Returns the aligned base,
/// or `None` if the reservation fails.
pub fn reserve_aligned(size: u64, alignment: u64) -> Option<u64> {
    debug_assert!(page_aligned(size), "size must be page aligned");
    debug_assert!(
        alignment != 0 && is_power_of_two(alignment) && page_aligned(alignment),
        "alignment must be a page aligned power of two"
    );

    let reserve_size = size + alignment - PAGE_SIZE;
    let allocation = reserve(reserve_size, 0, None)?;

    let base = round_up(allocation, alignment);
    let prefix_size = base - allocation;
    let postfix_size = reserve_size - size - prefix_size;

    if prefix_size != 0 {
        release(allocation, prefix_size);
    }

    if postfix_size != 0 {
        release(base + size, postfix_size);
    }

    Some(base)
}

/// Map a shared link at a fixed address. Returns the address, or `None`.
pub fn map_shared(size: u64, location: u64, fd: RawFd) -> Option<u64> {
    let address = unsafe {
        libc::mmap(
            location as *mut libc::c_void,
            size as libc::size_t,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            fd,
            0,
        )
    };

    if address == libc::MAP_FAILED {
        None
    } else {
        Some(address as u64)
    }
}

/// Release reserved memory back to the system.
pub fn release(address: u64, size: u64) {
    debug_assert!(address != 0, "address is invalid");
    debug_assert!(page_aligned(size), "size must be page aligned");

    unsafe {
        libc::munmap(address as *mut libc::c_void, size as libc::size_t);
    }
}

/// Commit reserved memory, attaching TLBs and backing store on first
/// touch. Fresh pages arrive zeroed. Committed ranges can span many
/// gigabytes of mostly untouched partition space, so swap accounting is
/// suppressed.
pub fn commit(address: u64, size: u64) {
    debug_assert!(address != 0, "address is invalid");
    debug_assert!(page_aligned(size), "size must be page aligned");

    unsafe {
        libc::mmap(
            address as *mut libc::c_void,
            size as libc::size_t,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_FIXED | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        );
    }
}

/// Return committed memory to the just-reserved state, dropping TLBs and
/// backing store.
pub fn uncommit(address: u64, size: u64) {
    debug_assert!(address != 0, "address is invalid");
    debug_assert!(page_aligned(size), "size must be page aligned");

    unsafe {
        libc::mmap(
            address as *mut libc::c_void,
            size as libc::size_t,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED | libc::MAP_NORESERVE,
            -1,
            0,
        );
    }
}

/// Zero a memory range.
///
/// Small ranges are written in place. Large private ranges are recommitted
/// instead, trading the writes for fresh zero pages and copy-on-write.
/// Shared ranges must always be written since a recommit would tear the
/// mapping away from the link.
pub fn clear(address: u64, size: u64, sharing: bool) {
    debug_assert!(address != 0, "address is invalid");
    debug_assert!(size & 7 == 0, "size must align on 8 bytes");

    if size <= CLEAR_RECOMMIT_THRESHOLD || sharing {
        unsafe {
            ptr::write_bytes(address as *mut u8, 0, size as usize);
        }
    } else {
        commit(address, size);
    }
}

/// Copy a memory range. Only used by reallocate.
///
/// Small copies loop over words, larger ones defer to the optimized
/// system copy.
pub fn copy(src: u64, dst: u64, size: u64) {
    debug_assert!(src != 0, "source must not be null");
    debug_assert!(dst != 0, "destination must not be null");
    debug_assert!(size & 7 == 0, "size must align on 8 bytes");

    unsafe {
        if size < PAGE_SIZE {
            let mut s = src as *const u64;
            let mut d = dst as *mut u64;
            let mut remaining = size;
            while remaining > 0 {
                *d = *s;
                s = s.add(1);
                d = d.add(1);
                remaining -= 8;
            }
        } else {
            ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, size as usize);
        }
    }
}

/// Create a shared link exclusively. Returns the descriptor, or `None`
/// when the link already exists (or creation fails outright).
pub fn create_link(name: &CStr) -> Option<RawFd> {
    let fd = unsafe {
        libc::shm_open(
            name.as_ptr(),
            libc::O_EXCL | libc::O_CREAT | libc::O_RDWR,
            0o600,
        )
    };

    if fd == -1 {
        None
    } else {
        debug!("created shared link {:?}", name);
        Some(fd)
    }
}

/// Open an existing shared link. Returns the descriptor, or `None`.
pub fn open_link(name: &CStr) -> Option<RawFd> {
    let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_RDWR, 0o600) };

    if fd == -1 {
        None
    } else {
        Some(fd)
    }
}

/// Resize a freshly created shared link to `size` bytes.
pub fn truncate_link(fd: RawFd, size: u64) -> bool {
    unsafe { libc::ftruncate(fd, size as libc::off_t) == 0 }
}

/// Remove a shared link by name.
pub fn unlink(name: &CStr) {
    debug!("unlinking shared link {:?}", name);
    unsafe {
        libc::shm_unlink(name.as_ptr());
    }
}

/// Close a shared link descriptor once the mapping holds its own
/// reference.
pub fn close_link(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_commit_release() {
        let size = 16 * PAGE_SIZE;
        let base = reserve(size, 0, None).expect("reserve failed");
        assert_ne!(base, 0);
        assert_eq!(base & PAGE_MASK, 0);

        // Committed memory is writable and zeroed.
        commit(base, size);
        unsafe {
            let p = base as *mut u64;
            assert_eq!(*p, 0);
            *p = 0xDEAD_BEEF;
            assert_eq!(*p, 0xDEAD_BEEF);
        }

        release(base, size);
    }

    #[test]
    fn test_reserve_aligned() {
        let alignment = 1 << 26;
        let size = 4 * PAGE_SIZE;
        let base = reserve_aligned(size, alignment).expect("reserve failed");
        assert_eq!(base & (alignment - 1), 0);
        release(base, size);
    }

    #[test]
    fn test_uncommit_returns_zero_pages() {
        let size = 8 * PAGE_SIZE;
        let base = reserve(size, 0, None).unwrap();
        commit(base, size);

        unsafe {
            *(base as *mut u64) = 0x1234;
        }

        // Uncommit drops the contents; a fresh commit reads zero.
        uncommit(base, size);
        commit(base, size);
        unsafe {
            assert_eq!(*(base as *const u64), 0);
        }

        release(base, size);
    }

    #[test]
    fn test_clear_small_and_large() {
        let size = 64 * PAGE_SIZE;
        let base = reserve(size, 0, None).unwrap();
        commit(base, size);

        unsafe {
            ptr::write_bytes(base as *mut u8, 0xAB, size as usize);
        }

        // Small range takes the in-place path.
        clear(base, 64, false);
        unsafe {
            assert_eq!(*(base as *const u64), 0);
            assert_eq!(*((base + 64) as *const u8), 0xAB);
        }

        // Large range takes the recommit path.
        clear(base, size, false);
        unsafe {
            assert_eq!(*((base + size - 8) as *const u64), 0);
        }

        release(base, size);
    }

    #[test]
    fn test_copy() {
        let size = 4 * PAGE_SIZE;
        let base = reserve(size, 0, None).unwrap();
        commit(base, size);

        let src = base;
        let dst = base + 2 * PAGE_SIZE;
        unsafe {
            for i in 0..32u64 {
                *((src + i * 8) as *mut u64) = i;
            }
        }

        // Word-loop path.
        copy(src, dst, 256);
        unsafe {
            for i in 0..32u64 {
                assert_eq!(*((dst + i * 8) as *const u64), i);
            }
        }

        // System copy path.
        copy(src, dst, PAGE_SIZE);
        unsafe {
            assert_eq!(*((dst + 248) as *const u64), 31);
        }

        release(base, size);
    }
}
