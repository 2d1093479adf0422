//! CPU intrinsics: exception masking, barriers, cache maintenance.
//!
//! Every inline-asm helper carries a non-aarch64 fallback so the pure
//! logic above this layer also compiles for host-side unit tests.

#![allow(dead_code)]

#[cfg(target_arch = "aarch64")]
use core::arch::asm;

/// Current exception level (0..3).
#[inline]
pub fn current_el() -> u64 {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        let el: u64;
        asm!("mrs {}, CurrentEL", out(reg) el);
        (el >> 2) & 0x3
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        1
    }
}

/// Core number from MPIDR_EL1 affinity 0.
#[inline]
pub fn cpu_id() -> u32 {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        let mpidr: u64;
        asm!("mrs {}, mpidr_el1", out(reg) mpidr);
        (mpidr & 0xFF) as u32
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        0
    }
}

/// Unmask IRQs (clear the I bit; SError stays masked).
#[inline]
pub unsafe fn irq_enable() {
    #[cfg(target_arch = "aarch64")]
    asm!("msr daifclr, #2", options(nomem, nostack));
}

/// Mask IRQs.
#[inline]
pub fn irq_disable() {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("msr daifset, #2", options(nomem, nostack));
    }
}

/// Save DAIF and mask IRQs. Pair with `irq_restore`.
#[inline]
pub fn irq_save() -> u64 {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        let flags: u64;
        asm!(
            "mrs {}, daif",
            "msr daifset, #2",
            out(reg) flags,
            options(nomem, nostack)
        );
        flags
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        0
    }
}

/// Restore a DAIF state saved by `irq_save`.
#[inline]
pub fn irq_restore(flags: u64) {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("msr daif, {}", in(reg) flags, options(nomem, nostack));
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = flags;
    }
}

/// Wait for interrupt (idle).
#[inline]
pub fn wait_for_interrupt() {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("wfi", options(nomem, nostack));
    }
}

/// Wait for event (suspension points and the panic halt loop).
#[inline]
pub fn wait_for_event() {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("wfe", options(nomem, nostack));
    }
}

/// Full-system data memory barrier. VirtIO ring publish/consume order
/// depends on these.
#[inline]
pub fn dmb_sy() {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("dmb sy", options(nostack));
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}

/// Inner-shareable data synchronization barrier.
#[inline]
pub fn dsb_ish() {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("dsb ish", options(nostack));
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}

/// Instruction synchronization barrier.
#[inline]
pub fn isb() {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("isb", options(nostack));
    }
}

/// Clean the data cache to the point of unification for `len` bytes at
/// `addr`. Required before executing freshly written code. Only valid
/// on identity-mapped memory.
pub fn dcache_clean_pou(addr: u64, len: u64) {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        const LINE: u64 = 64;
        let start = addr & !(LINE - 1);
        let end = addr + len;
        let mut line = start;
        while line < end {
            asm!("dc cvau, {}", in(reg) line, options(nostack));
            line += LINE;
        }
        asm!("dsb ish", options(nostack));
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = (addr, len);
    }
}

/// Invalidate the entire instruction cache and synchronize.
pub fn icache_invalidate_all() {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("dsb ish", "ic iallu", "dsb ish", "isb", options(nostack));
    }
}

/// Read the exception syndrome register.
#[inline]
pub fn read_esr_el1() -> u64 {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        let esr: u64;
        asm!("mrs {}, esr_el1", out(reg) esr);
        esr
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        0
    }
}

/// Read the fault address register.
#[inline]
pub fn read_far_el1() -> u64 {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        let far: u64;
        asm!("mrs {}, far_el1", out(reg) far);
        far
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        0
    }
}

/// Read the exception link register.
#[inline]
pub fn read_elr_el1() -> u64 {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        let elr: u64;
        asm!("mrs {}, elr_el1", out(reg) elr);
        elr
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        0
    }
}

/// Load a new user-space translation root and invalidate the
/// inner-shareable TLB.
#[inline]
pub unsafe fn switch_ttbr0(root: u64) {
    #[cfg(target_arch = "aarch64")]
    {
        asm!(
            "msr ttbr0_el1, {}",
            "tlbi vmalle1is",
            "dsb ish",
            "isb",
            in(reg) root,
            options(nostack)
        );
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = root;
    }
}

/// Invalidate the inner-shareable TLB entry for one virtual address.
#[inline]
pub fn tlb_invalidate_page(virt: u64) {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!(
            "dsb ishst",
            "tlbi vaae1is, {}",
            "dsb ish",
            "isb",
            in(reg) virt >> 12,
            options(nostack)
        );
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = virt;
    }
}
