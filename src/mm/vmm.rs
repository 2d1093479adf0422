//! Translation-table manager.
//!
//! AArch64 4-level tables (9 index bits per level, 4 KiB leaves). All
//! table memory is identity-mapped DRAM, so a physical table address
//! is also a valid pointer.
//!
//! Address-space layout: everything lives in TTBR0. The kernel half
//! (DRAM identity map + device aperture) is built once at boot; user
//! address spaces deep-copy the interior levels and share the kernel's
//! leaf tables, so the in-kernel mappings are identical in every
//! space.

#![allow(dead_code)]

use core::sync::atomic::{AtomicU64, Ordering};

use super::{pmm, PAGE_SIZE};
use crate::lib::error::KernelError;

/// Table geometry
const ENTRIES_PER_TABLE: usize = 512;
const LEVELS: usize = 4;

/// Physical address field of a descriptor, bits [47:12].
const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

bitflags::bitflags! {
    /// Translation descriptor flags (AArch64 stage-1 format).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        /// Descriptor is valid
        const VALID = 1 << 0;
        /// Table descriptor (levels 0-2) or page descriptor (level 3)
        const TABLE = 1 << 1;
        /// MAIR attribute index 1 = Device-nGnRE (index 0 = Normal WBWA)
        const ATTR_DEVICE = 1 << 2;
        /// Unprivileged (EL0) access allowed
        const AP_EL0 = 1 << 6;
        /// Read-only
        const AP_RO = 1 << 7;
        /// Inner shareable
        const SH_INNER = 0b11 << 8;
        /// Access flag (must be set; no AF faults handled)
        const AF = 1 << 10;
        /// Not global (per-ASID); set on user leaves
        const NOT_GLOBAL = 1 << 11;
        /// Privileged execute-never
        const PXN = 1 << 53;
        /// Unprivileged execute-never
        const UXN = 1 << 54;
    }
}

impl PteFlags {
    /// Kernel RAM: writable, cacheable, executable at EL1 only.
    pub fn kernel_normal() -> Self {
        Self::VALID | Self::TABLE | Self::AF | Self::SH_INNER | Self::UXN
    }

    /// Device MMIO: non-cacheable, never executable.
    pub fn kernel_device() -> Self {
        Self::VALID | Self::TABLE | Self::AF | Self::ATTR_DEVICE | Self::PXN | Self::UXN
    }

    /// User data (read-write, no execute).
    pub fn user_rw() -> Self {
        Self::VALID
            | Self::TABLE
            | Self::AF
            | Self::SH_INNER
            | Self::AP_EL0
            | Self::NOT_GLOBAL
            | Self::PXN
            | Self::UXN
    }

    /// User read-only data.
    pub fn user_ro() -> Self {
        Self::user_rw() | Self::AP_RO
    }

    /// User text (read-only, executable at EL0).
    pub fn user_rx() -> Self {
        Self::VALID
            | Self::TABLE
            | Self::AF
            | Self::SH_INNER
            | Self::AP_EL0
            | Self::NOT_GLOBAL
            | Self::AP_RO
            | Self::PXN
    }

    /// Interior table descriptor.
    fn table() -> Self {
        Self::VALID | Self::TABLE
    }
}

/// Index into the table at `level` (0 = root) for a virtual address.
#[inline]
pub fn table_index(virt: u64, level: usize) -> usize {
    ((virt >> (39 - 9 * level)) & 0x1FF) as usize
}

#[inline]
unsafe fn entry_ptr(table: u64, index: usize) -> *mut u64 {
    (table as *mut u64).add(index)
}

/// Descend one level. When `alloc` is provided, missing interior
/// tables are created as zeroed frames marked `valid | table`.
unsafe fn next_table(
    table: u64,
    index: usize,
    alloc: Option<&mut dyn FnMut() -> Option<u64>>,
) -> Option<u64> {
    let slot = entry_ptr(table, index);
    let entry = core::ptr::read_volatile(slot);

    if entry & PteFlags::VALID.bits() != 0 {
        return Some(entry & ADDR_MASK);
    }

    let alloc = alloc?;
    let page = alloc()?;
    core::ptr::write_volatile(slot, page | PteFlags::table().bits());
    Some(page)
}

/// Core of `map_page` with an injectable table allocator.
unsafe fn map_in(
    root: u64,
    virt: u64,
    phys: u64,
    flags: PteFlags,
    alloc: &mut dyn FnMut() -> Option<u64>,
) -> Result<(), KernelError> {
    let mut table = root;
    for level in 0..LEVELS - 1 {
        table = next_table(table, table_index(virt, level), Some(&mut *alloc))
            .ok_or(KernelError::OutOfMemory)?;
    }

    let slot = entry_ptr(table, table_index(virt, 3));
    core::ptr::write_volatile(slot, (phys & ADDR_MASK) | flags.bits());
    Ok(())
}

/// Map one 4 KiB page into the tree rooted at `root` (physical).
/// Missing interior tables come from the frame allocator.
pub fn map_page(root: u64, virt: u64, phys: u64, flags: PteFlags) -> Result<(), KernelError> {
    unsafe { map_in(root, virt, phys, flags, &mut pmm::alloc_page) }
}

/// Remove the leaf for `virt` and invalidate its TLB entry on all
/// inner-shareable CPUs. Walks without creating tables.
pub fn unmap_page(root: u64, virt: u64) {
    unsafe {
        let mut table = root;
        for level in 0..LEVELS - 1 {
            match next_table(table, table_index(virt, level), None) {
                Some(next) => table = next,
                None => return,
            }
        }
        core::ptr::write_volatile(entry_ptr(table, table_index(virt, 3)), 0);
    }
    crate::arch::cpu::tlb_invalidate_page(virt);
}

/// Software walk, for diagnostics and tests: the physical address and
/// flags the hardware would resolve for `virt`, or None.
pub fn translate(root: u64, virt: u64) -> Option<(u64, PteFlags)> {
    unsafe {
        let mut table = root;
        for level in 0..LEVELS - 1 {
            table = next_table(table, table_index(virt, level), None)?;
        }
        let entry = core::ptr::read_volatile(entry_ptr(table, table_index(virt, 3)));
        if entry & PteFlags::VALID.bits() == 0 {
            return None;
        }
        Some((entry & ADDR_MASK, PteFlags::from_bits_truncate(entry)))
    }
}

/// Kernel root table (physical address of level 0).
static KERNEL_ROOT: AtomicU64 = AtomicU64::new(0);

pub fn kernel_root() -> u64 {
    KERNEL_ROOT.load(Ordering::Relaxed)
}

/// Build the boot address space and enable the MMU with instruction
/// and data caches.
///
/// # Safety
/// Must run once on the boot CPU, before any other CPU touches
/// translated memory.
pub unsafe fn init() -> Result<(), KernelError> {
    let root = pmm::alloc_page().ok_or(KernelError::OutOfMemory)?;

    let plat = crate::platform::active();

    // Identity map DRAM as normal write-back memory
    let ram = plat.ram();
    let mut addr = ram.start;
    while addr < ram.start + ram.size {
        map_page(root, addr, addr, PteFlags::kernel_normal())?;
        addr += PAGE_SIZE as u64;
    }

    // Identity map the device aperture
    let mmio = plat.mmio();
    let mut addr = mmio.start;
    while addr < mmio.start + mmio.size {
        map_page(root, addr, addr, PteFlags::kernel_device())?;
        addr += PAGE_SIZE as u64;
    }

    KERNEL_ROOT.store(root, Ordering::Relaxed);

    enable_mmu(root);
    Ok(())
}

#[cfg(all(target_arch = "aarch64", not(test)))]
unsafe fn enable_mmu(root: u64) {
    use core::arch::asm;

    // MAIR: index 0 = Normal WBWA (0xFF), index 1 = Device-nGnRE (0x04)
    let mair: u64 = 0xFF | (0x04 << 8);
    asm!("msr mair_el1, {}", in(reg) mair);

    // TCR: 4 KiB granule, 48-bit VA (T0SZ=16), inner-shareable,
    // write-back walks, 40-bit PA
    let tcr: u64 = 16 | (1 << 8) | (1 << 10) | (0b11 << 12) | (2u64 << 32);
    asm!("msr tcr_el1, {}", in(reg) tcr);

    asm!("msr ttbr0_el1, {}", in(reg) root);
    asm!("dsb ish", "isb");

    // SCTLR: MMU + data cache + instruction cache
    let mut sctlr: u64;
    asm!("mrs {}, sctlr_el1", out(reg) sctlr);
    sctlr |= (1 << 0) | (1 << 2) | (1 << 12);
    asm!("msr sctlr_el1, {}", in(reg) sctlr);
    asm!("isb");
}

#[cfg(not(all(target_arch = "aarch64", not(test))))]
unsafe fn enable_mmu(_root: u64) {}

/// Create a user address space.
///
/// Interior levels (0-2) of the kernel space are deep-copied so user
/// mappings stay private to the new space; level-3 leaf tables are
/// shared, which keeps the kernel half identical everywhere.
pub fn create_address_space() -> Option<u64> {
    let kroot = kernel_root();
    if kroot == 0 {
        return None;
    }
    unsafe { clone_interior(kroot, 0) }
}

unsafe fn clone_interior(src: u64, level: usize) -> Option<u64> {
    let copy = pmm::alloc_page()?;

    for i in 0..ENTRIES_PER_TABLE {
        let entry = core::ptr::read_volatile(entry_ptr(src, i));
        if entry & PteFlags::VALID.bits() == 0 {
            continue;
        }

        let new_entry = if level < 2 {
            // Interior table: copy the subtree
            let child = clone_interior(entry & ADDR_MASK, level + 1)?;
            child | (entry & !ADDR_MASK)
        } else {
            // Level 2 entries point at leaf tables, which are shared
            entry
        };
        core::ptr::write_volatile(entry_ptr(copy, i), new_entry);
    }

    Some(copy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    /// Table allocator backed by leaked boxes; "physical" addresses
    /// are host pointers, which matches the identity-map assumption.
    /// Tables are 4 KiB-aligned, matching the real frame allocator, so
    /// that masking with `ADDR_MASK` round-trips correctly.
    #[repr(align(4096))]
    struct AlignedTable([u64; 512]);

    fn test_alloc() -> impl FnMut() -> Option<u64> {
        || {
            let table: Box<AlignedTable> = Box::new(AlignedTable([0; 512]));
            Some(Box::leak(table).0.as_mut_ptr() as u64)
        }
    }

    fn new_root(alloc: &mut dyn FnMut() -> Option<u64>) -> u64 {
        alloc().unwrap()
    }

    #[test]
    fn map_then_walk_yields_mapping() {
        let mut alloc = test_alloc();
        let root = new_root(&mut alloc);

        let virt = 0x0040_2000u64;
        let phys = 0x8_0000_3000u64 & ADDR_MASK;
        let flags = PteFlags::user_rx();

        unsafe { map_in(root, virt, phys, flags, &mut alloc).unwrap() };

        let (got_phys, got_flags) = translate(root, virt).expect("mapping must resolve");
        assert_eq!(got_phys, phys);
        assert_eq!(got_flags, flags);
    }

    #[test]
    fn unmap_removes_leaf() {
        let mut alloc = test_alloc();
        let root = new_root(&mut alloc);

        let virt = 0xC000_0000u64;
        unsafe { map_in(root, virt, 0x4000_0000, PteFlags::user_rw(), &mut alloc).unwrap() };
        assert!(translate(root, virt).is_some());

        unmap_page(root, virt);
        assert!(translate(root, virt).is_none());
    }

    #[test]
    fn interior_tables_created_by_map_are_reachable() {
        let mut alloc = test_alloc();
        let root = new_root(&mut alloc);

        // Two pages in the same leaf table, one in a different L1 range
        let flags = PteFlags::user_rw();
        unsafe {
            map_in(root, 0x0040_0000, 0x5000_0000, flags, &mut alloc).unwrap();
            map_in(root, 0x0040_1000, 0x5000_1000, flags, &mut alloc).unwrap();
            map_in(root, 0xC000_0000, 0x5000_2000, flags, &mut alloc).unwrap();
        }

        assert_eq!(translate(root, 0x0040_0000).unwrap().0, 0x5000_0000);
        assert_eq!(translate(root, 0x0040_1000).unwrap().0, 0x5000_1000);
        assert_eq!(translate(root, 0xC000_0000).unwrap().0, 0x5000_2000);
        // Unmapped neighbours stay unmapped
        assert!(translate(root, 0x0040_2000).is_none());
        assert!(translate(root, 0xC000_1000).is_none());
    }

    #[test]
    fn cloned_space_shares_leaf_tables_but_not_interior() {
        let mut alloc = test_alloc();
        let root = new_root(&mut alloc);

        // A "kernel" mapping present before cloning
        unsafe {
            map_in(root, 0x4000_0000, 0x4000_0000, PteFlags::kernel_normal(), &mut alloc).unwrap()
        };

        let copy = unsafe { clone_interior_with(root, 0, &mut alloc).unwrap() };
        assert_ne!(copy, root);

        // The pre-existing mapping resolves identically in both spaces
        assert_eq!(
            translate(root, 0x4000_0000).unwrap().0,
            translate(copy, 0x4000_0000).unwrap().0
        );

        // A user mapping added to the copy must not appear in the original
        unsafe { map_in(copy, 0x0040_0000, 0x5555_5000, PteFlags::user_rw(), &mut alloc).unwrap() };
        assert!(translate(copy, 0x0040_0000).is_some());
        assert!(translate(root, 0x0040_0000).is_none());
    }

    /// Test-only variant of `clone_interior` with an injectable
    /// allocator.
    unsafe fn clone_interior_with(
        src: u64,
        level: usize,
        alloc: &mut dyn FnMut() -> Option<u64>,
    ) -> Option<u64> {
        let copy = alloc()?;
        for i in 0..ENTRIES_PER_TABLE {
            let entry = core::ptr::read_volatile(entry_ptr(src, i));
            if entry & PteFlags::VALID.bits() == 0 {
                continue;
            }
            let new_entry = if level < 2 {
                let child = clone_interior_with(entry & ADDR_MASK, level + 1, &mut *alloc)?;
                child | (entry & !ADDR_MASK)
            } else {
                entry
            };
            core::ptr::write_volatile(entry_ptr(copy, i), new_entry);
        }
        Some(copy)
    }

    #[test]
    fn table_indices_cover_nine_bits_per_level() {
        let virt = 0x0000_7FC0_3020_1000u64;
        let reconstructed: Vec<usize> = (0..4).map(|l| table_index(virt, l)).collect();
        let back = ((reconstructed[0] as u64) << 39)
            | ((reconstructed[1] as u64) << 30)
            | ((reconstructed[2] as u64) << 21)
            | ((reconstructed[3] as u64) << 12);
        assert_eq!(back, virt & !0xFFF);
    }
}
