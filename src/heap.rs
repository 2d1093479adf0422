//! Kernel heap.
//!
//! Backs `alloc` with a `linked_list_allocator` heap carved out of a
//! static region in the kernel image. Window back-buffers and the
//! compositor front-buffer are the main consumers, so the region is
//! sized generously.

use linked_list_allocator::LockedHeap;

/// 16 MiB heap: front buffer (800*600*4 ≈ 1.9 MiB) plus per-window
/// back-buffers and filesystem scratch.
const HEAP_SIZE: usize = 16 * 1024 * 1024;

#[repr(align(4096))]
struct HeapRegion([u8; HEAP_SIZE]);

static mut HEAP_REGION: HeapRegion = HeapRegion([0; HEAP_SIZE]);

#[cfg_attr(not(test), global_allocator)]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Initialize the global heap allocator.
///
/// # Safety
/// Must be called exactly once, before any allocation.
pub unsafe fn init() -> Result<(), &'static str> {
    let start = core::ptr::addr_of_mut!(HEAP_REGION).cast::<u8>();
    ALLOCATOR.lock().init(start, HEAP_SIZE);
    Ok(())
}

/// Smoke-test the allocator right after init.
pub fn self_test() -> Result<(), &'static str> {
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    let probe = Box::new(0xA5A5_5A5Au32);
    if *probe != 0xA5A5_5A5A {
        return Err("heap probe mismatch");
    }

    let mut v: Vec<u8> = Vec::with_capacity(4096);
    v.resize(4096, 0x5A);
    if v[0] != 0x5A || v[4095] != 0x5A {
        return Err("heap vec mismatch");
    }

    Ok(())
}
