//! Shared-link creation and overlay.

use std::ffi::CString;

use quantum_alloc::Director;

/// A fixed base well clear of the usual heap and library mappings.
const SHARED_BASE: u64 = 0x6000_0000_0000;

#[test]
fn shared_create_and_overlay() {
    let link = CString::new(format!("/quantum-alloc-test-{}", std::process::id())).unwrap();

    // First creator initialises the region behind the link.
    let first = Director::create(SHARED_BASE, Some(&link), false, 2, 1, 0, 0, 8)
        .expect("shared create failed");
    let creator = unsafe { first.as_ref() };

    let block = creator.allocate(100).expect("allocate failed");
    assert_eq!(creator.allocation_size(block), 128);
    unsafe {
        *(block as *mut u64) = 0xC0FF_EE00;
    }

    assert!(creator.set_reference(0, block));

    // A second creation against the existing link loses the exclusive
    // race and overlays the live structures without reinitialising.
    let second = Director::create(SHARED_BASE, Some(&link), false, 2, 1, 0, 0, 8)
        .expect("shared overlay failed");

    // The administrative layout is position identical, so both handles
    // resolve to the same director inside the mapped region.
    assert_eq!(first.as_ptr(), second.as_ptr());

    let attached = unsafe { second.as_ref() };

    // State established by the creator is visible through the overlay.
    assert_eq!(attached.get_reference(), block);
    assert_eq!(attached.allocation_size(block), 128);
    unsafe {
        assert_eq!(*(block as *const u64), 0xC0FF_EE00);
    }

    // Allocations through the overlay share the registries: the new
    // block must not collide with the creator's.
    let other = attached.allocate(100).expect("overlay allocate failed");
    assert_ne!(other, block);
    assert_eq!(creator.allocation_size(other), 128);

    attached.deallocate(other);
    creator.deallocate(block);

    unsafe { Director::destroy(first.as_ptr(), true) };
}

#[test]
fn shared_rejects_slabs() {
    let link = CString::new(format!("/quantum-alloc-slabs-{}", std::process::id())).unwrap();

    assert!(Director::create(SHARED_BASE, Some(&link), false, 1, 0, 0, 4, 0).is_err());
}
