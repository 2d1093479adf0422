/// Memory management subsystem
///
/// - Bitmap page-frame allocator with DMA/Normal zones (`pmm`)
/// - 4-level translation tables and MMU bring-up (`vmm`)
/// - Block buffer cache with LRU and dirty flush (`buffer`)

pub mod buffer;
pub mod pmm;
pub mod vmm;

/// Physical address type
pub type PhysAddr = u64;

/// Page frame number
pub type Pfn = usize;

/// Page size (4 KiB)
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// Convert physical address to page frame number
#[inline]
pub const fn pa_to_pfn(pa: PhysAddr) -> Pfn {
    (pa as usize) >> PAGE_SHIFT
}

/// Convert page frame number to physical address
#[inline]
pub const fn pfn_to_pa(pfn: Pfn) -> PhysAddr {
    (pfn << PAGE_SHIFT) as PhysAddr
}

/// Round physical address down to a page boundary
#[inline]
pub const fn page_align_down(pa: PhysAddr) -> PhysAddr {
    pa & !(PAGE_SIZE as u64 - 1)
}

/// Round physical address up to a page boundary
#[inline]
pub const fn page_align_up(pa: PhysAddr) -> PhysAddr {
    (pa + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}
