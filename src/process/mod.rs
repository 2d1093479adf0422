//! Process model.
//!
//! Minimal by design: a process is a user address space, a kernel
//! stack with a saved trap frame, and a slot in the round-robin
//! scheduler. Processes never exit in-scope, so there is no
//! reclamation path.

#![allow(dead_code)]

pub mod elf;
pub mod scheduler;

use heapless::String;

use crate::arch::trap::TrapFrame;
use crate::lib::error::{Errno, Result};
use crate::mm::{pmm, vmm, PAGE_SIZE};

pub type Pid = u32;

pub const MAX_PROCESSES: usize = 16;

/// Kernel stack: 4 pages (16 KiB).
const KSTACK_PAGES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// PCB allocated, address space prepared, not yet dispatched
    Created,
    /// Dispatched at least once
    Running,
    /// Exited; the slot is never reclaimed in-scope
    Zombie,
}

/// Process control block.
pub struct Process {
    pub pid: Pid,
    pub name: String<32>,
    /// Physical address of the root translation table (TTBR0)
    pub page_table: u64,
    /// Top of the kernel stack
    pub kstack_top: u64,
    /// Saved trap frame at the moment of the last preemption
    pub context: *mut TrapFrame,
    /// Initial user entry point and stack (from the loader)
    pub user_entry: u64,
    pub user_stack: u64,
    pub state: ProcessState,
}

// The context pointer targets the process's own kernel stack, which
// lives for the lifetime of the kernel.
unsafe impl Send for Process {}

impl Process {
    /// Allocate a PCB with a fresh address space and kernel stack. The
    /// initial trap frame sits at the top of the kernel stack, zeroed;
    /// the loader fills in entry and stack pointer.
    pub fn create(pid: Pid, name: &str) -> Result<Self> {
        let page_table = vmm::create_address_space().ok_or(Errno::ENOMEM)?;
        let kstack = pmm::alloc_pages(KSTACK_PAGES).ok_or(Errno::ENOMEM)?;
        let kstack_top = kstack + (KSTACK_PAGES * PAGE_SIZE) as u64;

        let context = (kstack_top - core::mem::size_of::<TrapFrame>() as u64) as *mut TrapFrame;
        unsafe {
            core::ptr::write(context, TrapFrame::new_zeroed());
        }

        let mut name_owned = String::new();
        let _ = name_owned.push_str(&name[..name.len().min(32)]);

        Ok(Self {
            pid,
            name: name_owned,
            page_table,
            kstack_top,
            context,
            user_entry: 0,
            user_stack: 0,
            state: ProcessState::Created,
        })
    }
}

/// Load and register the initial user processes from the userland
/// filesystem, then transfer control to the first of them. Returns
/// normally only when nothing could be loaded.
pub fn spawn_initial_processes() {
    let programs: [(&str, &str); 3] = [("init", "/init"), ("shell1", "/shell"), ("shell2", "/shell")];

    for (name, path) in programs {
        match spawn(name, path) {
            Ok(pid) => info!("process: loaded {} as pid {}", path, pid),
            Err(e) => warn!("process: loading {} failed: {:?}", path, e),
        }
    }

    scheduler::start_first_process();
}

/// Create a process and load `path` into its address space.
pub fn spawn(name: &str, path: &str) -> Result<Pid> {
    let pid = scheduler::allocate_pid()?;
    let mut proc = Process::create(pid, name)?;
    elf::load(&mut proc, path)?;
    scheduler::register(proc)?;
    Ok(pid)
}

/// Pid of the process currently executing (0 when the kernel is still
/// in bootstrap).
pub fn current_pid() -> Pid {
    scheduler::current_pid()
}
