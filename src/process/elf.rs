//! ELF64 loader.
//!
//! Parses the header, maps each loadable segment into the target
//! address space with permissions derived from the segment flags,
//! copies file contents, performs data-cache maintenance for
//! executable pages, then maps the user stack and initializes the
//! process's trap frame.

#![allow(dead_code)]

use super::Process;
use crate::arch::cpu;
use crate::fs::ext4;
use crate::lib::error::{Errno, Result};
use crate::mm::vmm::PteFlags;
use crate::mm::{pmm, vmm, PAGE_SIZE};

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const EM_AARCH64: u16 = 183;

const PT_LOAD: u32 = 1;

const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

/// User stack: 1 MiB at a fixed high address.
const USER_STACK_BASE: u64 = 0xC000_0000;
const USER_STACK_SIZE: u64 = 0x10_0000;

/// Loadable virtual addresses must stay in the canonical low half.
const USER_VADDR_LIMIT: u64 = 0x8000_0000_0000_0000;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Elf64Ehdr {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

/// Validate and decode the ELF header.
fn parse_ehdr(bytes: &[u8]) -> Result<Elf64Ehdr> {
    if bytes.len() < core::mem::size_of::<Elf64Ehdr>() {
        return Err(Errno::EINVAL);
    }

    let ehdr = unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const Elf64Ehdr) };

    if ehdr.e_ident[0..4] != ELF_MAGIC {
        return Err(Errno::EINVAL);
    }
    if ehdr.e_ident[4] != ELFCLASS64 {
        return Err(Errno::EINVAL);
    }
    if ehdr.e_machine != EM_AARCH64 {
        return Err(Errno::EINVAL);
    }
    if ehdr.e_entry >= USER_VADDR_LIMIT {
        return Err(Errno::EINVAL);
    }

    Ok(ehdr)
}

/// Page-aligned virtual range covering a segment.
#[inline]
fn segment_page_range(vaddr: u64, memsz: u64) -> (u64, u64) {
    let start = vaddr & !(PAGE_SIZE as u64 - 1);
    let end = (vaddr + memsz + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);
    (start, end)
}

/// Translation flags for a loadable segment.
fn segment_flags(p_flags: u32) -> PteFlags {
    let mut flags = PteFlags::VALID
        | PteFlags::TABLE
        | PteFlags::AF
        | PteFlags::SH_INNER
        | PteFlags::AP_EL0
        | PteFlags::NOT_GLOBAL
        | PteFlags::PXN;

    if p_flags & PF_W == 0 {
        flags |= PteFlags::AP_RO;
    }
    if p_flags & PF_X == 0 {
        flags |= PteFlags::UXN;
    }

    flags
}

/// Load `path` into the address space of `proc` and prepare its
/// initial trap frame.
pub fn load(proc: &mut Process, path: &str) -> Result<()> {
    let ino = ext4::find_inode(path)?;

    let mut ehdr_buf = [0u8; core::mem::size_of::<Elf64Ehdr>()];
    if ext4::read_inode(ino, 0, &mut ehdr_buf)? != ehdr_buf.len() {
        return Err(Errno::EINVAL);
    }
    let ehdr = parse_ehdr(&ehdr_buf)?;

    for i in 0..ehdr.e_phnum {
        let ph_off = ehdr.e_phoff + (i as u64) * (ehdr.e_phentsize as u64);

        let mut phdr_buf = [0u8; core::mem::size_of::<Elf64Phdr>()];
        if ext4::read_inode(ino, ph_off as u32, &mut phdr_buf)? != phdr_buf.len() {
            return Err(Errno::EINVAL);
        }
        let phdr = unsafe { core::ptr::read_unaligned(phdr_buf.as_ptr() as *const Elf64Phdr) };

        if phdr.p_type != PT_LOAD {
            continue;
        }
        if phdr.p_vaddr >= USER_VADDR_LIMIT {
            return Err(Errno::EINVAL);
        }

        load_segment(proc, ino, &phdr)?;
    }

    map_user_stack(proc)?;

    proc.user_entry = ehdr.e_entry;
    proc.user_stack = USER_STACK_BASE + USER_STACK_SIZE;

    // Initial frame: ELF entry as return address, stack top as user
    // SP, EL0t with interrupts unmasked.
    unsafe {
        let frame = &mut *proc.context;
        *frame = crate::arch::trap::TrapFrame::new_zeroed();
        frame.elr = proc.user_entry;
        frame.sp_el0 = proc.user_stack;
        frame.spsr = 0;
    }

    // Make sure the instruction fetcher sees the fresh code
    cpu::icache_invalidate_all();

    info!(
        "elf: loaded {} entry={:#x} stack={:#x}",
        path, proc.user_entry, proc.user_stack
    );
    Ok(())
}

fn load_segment(proc: &mut Process, ino: u32, phdr: &Elf64Phdr) -> Result<()> {
    let flags = segment_flags(phdr.p_flags);
    let executable = phdr.p_flags & PF_X != 0;
    let (start, end) = segment_page_range(phdr.p_vaddr, phdr.p_memsz);

    debug!(
        "elf: segment at {:#x} (filesz {:#x}, memsz {:#x})",
        { phdr.p_vaddr },
        { phdr.p_filesz },
        { phdr.p_memsz }
    );

    let mut vaddr = start;
    while vaddr < end {
        let page = pmm::alloc_page().ok_or(Errno::ENOMEM)?;

        vmm::map_page(proc.page_table, vaddr, page, flags).map_err(|_| Errno::ENOMEM)?;

        // Copy the slice of file content overlapping this page. The
        // page is already zero-filled by the allocator.
        let seg_file_end = phdr.p_vaddr + phdr.p_filesz;
        let copy_start = vaddr.max(phdr.p_vaddr);
        let copy_end = (vaddr + PAGE_SIZE as u64).min(seg_file_end);

        if copy_start < copy_end {
            let len = (copy_end - copy_start) as usize;
            let page_off = (copy_start - vaddr) as usize;
            let file_off = phdr.p_offset + (copy_start - phdr.p_vaddr);

            let dst =
                unsafe { core::slice::from_raw_parts_mut((page + page_off as u64) as *mut u8, len) };
            if ext4::read_inode(ino, file_off as u32, dst)? != len {
                return Err(Errno::EIO);
            }
        }

        // Executable pages: clean the data cache to the point of
        // unification so instruction fetches observe the copy
        if executable {
            cpu::dcache_clean_pou(page, PAGE_SIZE as u64);
        }

        vaddr += PAGE_SIZE as u64;
    }

    Ok(())
}

fn map_user_stack(proc: &mut Process) -> Result<()> {
    let flags = PteFlags::user_rw();

    let mut vaddr = USER_STACK_BASE;
    while vaddr < USER_STACK_BASE + USER_STACK_SIZE {
        let page = pmm::alloc_page().ok_or(Errno::ENOMEM)?;
        vmm::map_page(proc.page_table, vaddr, page, flags).map_err(|_| Errno::ENOMEM)?;
        vaddr += PAGE_SIZE as u64;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_header() -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[0..4].copy_from_slice(&ELF_MAGIC);
        bytes[4] = ELFCLASS64;
        bytes[18..20].copy_from_slice(&EM_AARCH64.to_le_bytes()); // e_machine
        bytes[24..32].copy_from_slice(&0x40_0000u64.to_le_bytes()); // e_entry
        bytes[32..40].copy_from_slice(&64u64.to_le_bytes()); // e_phoff
        bytes[54..56].copy_from_slice(&56u16.to_le_bytes()); // e_phentsize
        bytes[56..58].copy_from_slice(&2u16.to_le_bytes()); // e_phnum
        bytes
    }

    #[test]
    fn valid_header_parses() {
        let ehdr = parse_ehdr(&valid_header()).unwrap();
        assert_eq!(ehdr.e_entry, 0x40_0000);
        assert_eq!(ehdr.e_phnum, 2);
        assert_eq!(ehdr.e_phentsize, 56);
    }

    #[test]
    fn wrong_magic_rejected() {
        let mut bytes = valid_header();
        bytes[0] = 0x7E;
        assert!(parse_ehdr(&bytes).is_err());
    }

    #[test]
    fn elf32_rejected() {
        let mut bytes = valid_header();
        bytes[4] = 1;
        assert!(parse_ehdr(&bytes).is_err());
    }

    #[test]
    fn foreign_machine_rejected() {
        let mut bytes = valid_header();
        bytes[18..20].copy_from_slice(&62u16.to_le_bytes()); // x86_64
        assert!(parse_ehdr(&bytes).is_err());
    }

    #[test]
    fn high_half_entry_rejected() {
        let mut bytes = valid_header();
        bytes[24..32].copy_from_slice(&0x8000_0000_0000_0000u64.to_le_bytes());
        assert!(parse_ehdr(&bytes).is_err());
    }

    #[test]
    fn segment_ranges_round_to_pages() {
        assert_eq!(segment_page_range(0x40_0123, 0x100), (0x40_0000, 0x40_1000));
        assert_eq!(segment_page_range(0x40_0000, 0x1000), (0x40_0000, 0x40_1000));
        assert_eq!(segment_page_range(0x40_0FFF, 0x2), (0x40_0000, 0x40_2000));
    }

    #[test]
    fn segment_flags_follow_phdr_permissions() {
        // rx text: read-only, executable at EL0
        let text = segment_flags(PF_R | PF_X);
        assert!(text.contains(PteFlags::AP_RO));
        assert!(!text.contains(PteFlags::UXN));
        assert!(text.contains(PteFlags::PXN));

        // rw data: writable, never executable
        let data = segment_flags(PF_R | PF_W);
        assert!(!data.contains(PteFlags::AP_RO));
        assert!(data.contains(PteFlags::UXN));

        // ro data
        let ro = segment_flags(PF_R);
        assert!(ro.contains(PteFlags::AP_RO));
        assert!(ro.contains(PteFlags::UXN));
    }
}
