// AArch64 exception handling and trap dispatch
//
// The vector stubs in vectors.S save a TrapFrame on the current kernel
// stack and call one of the typed handlers below with the frame
// pointer. Handlers return the frame pointer to restore from; the
// scheduler exploits this to switch contexts on timer IRQs.

use super::cpu;

/// Saved register state on exception entry. Layout must match the
/// save/restore sequence in vectors.S exactly.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    /// General purpose registers x0-x30 (x30 = LR)
    pub regs: [u64; 31],
    /// Alignment pad: x30 is stored paired with xzr
    _unused: u64,
    /// Exception link register (return address)
    pub elr: u64,
    /// Saved processor state
    pub spsr: u64,
    /// User stack pointer (SP_EL0)
    pub sp_el0: u64,
    /// Keeps the frame a multiple of 16 bytes on the stack
    _pad: u64,
}

impl TrapFrame {
    pub const fn new_zeroed() -> Self {
        Self {
            regs: [0; 31],
            _unused: 0,
            elr: 0,
            spsr: 0,
            sp_el0: 0,
            _pad: 0,
        }
    }
}

impl Default for TrapFrame {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

// ESR_EL1 exception class field
const ESR_EC_SHIFT: u64 = 26;
const ESR_EC_MASK: u64 = 0x3F;

const EC_UNKNOWN: u64 = 0x00;
const EC_SVC_AARCH64: u64 = 0x15;
const EC_INST_ABORT_LOWER: u64 = 0x20;
const EC_INST_ABORT_SAME: u64 = 0x21;
const EC_DATA_ABORT_LOWER: u64 = 0x24;
const EC_DATA_ABORT_SAME: u64 = 0x25;
const EC_SP_ALIGNMENT: u64 = 0x26;

#[inline]
fn exception_class(esr: u64) -> u64 {
    (esr >> ESR_EC_SHIFT) & ESR_EC_MASK
}

/// Synchronous exception from EL0.
///
/// SVC routes to the syscall dispatcher; everything else is a user
/// fault and terminates the process via the exit path.
#[no_mangle]
pub extern "C" fn handle_sync_el0(frame: *mut TrapFrame) -> *mut TrapFrame {
    let esr = cpu::read_esr_el1();
    let ec = exception_class(esr);

    if ec == EC_SVC_AARCH64 {
        return crate::syscall::handle(frame);
    }

    let far = cpu::read_far_el1();
    let frame_ref = unsafe { &*frame };
    error!(
        "USER FAULT: ESR={:#x} (EC={:#x}) FAR={:#x} ELR={:#x}",
        esr, ec, far, frame_ref.elr
    );
    crate::syscall::exit_current(-1);
}

/// Synchronous exception in kernel mode. Always fatal.
#[no_mangle]
pub extern "C" fn handle_sync_el1(frame: *mut TrapFrame) -> *mut TrapFrame {
    let esr = cpu::read_esr_el1();
    let far = cpu::read_far_el1();
    let ec = exception_class(esr);
    let elr = unsafe { (*frame).elr };

    match ec {
        EC_UNKNOWN => error!("Unknown exception at {:#018x}", elr),
        EC_INST_ABORT_LOWER | EC_INST_ABORT_SAME => {
            error!("Instruction abort at {:#018x}, FAR={:#018x}", elr, far)
        }
        EC_DATA_ABORT_LOWER | EC_DATA_ABORT_SAME => {
            error!("Data abort at {:#018x}, FAR={:#018x}", elr, far)
        }
        EC_SP_ALIGNMENT => error!("SP alignment fault at {:#018x}", elr),
        _ => error!("Unhandled exception EC={:#x} at {:#018x}", ec, elr),
    }

    panic!("Unrecoverable kernel exception: ESR={:#018x}", esr);
}

/// IRQ from any origin: drain the GIC.
#[no_mangle]
pub extern "C" fn handle_irq_exception(frame: *mut TrapFrame) -> *mut TrapFrame {
    super::gic::irq_handler(frame)
}

/// FIQ is never configured; treat as fatal.
#[no_mangle]
pub extern "C" fn handle_fiq(_frame: *mut TrapFrame) -> *mut TrapFrame {
    panic!("Unexpected FIQ");
}

/// SError is fatal.
#[no_mangle]
pub extern "C" fn handle_serror(frame: *mut TrapFrame) -> *mut TrapFrame {
    let esr = cpu::read_esr_el1();
    let elr = unsafe { (*frame).elr };
    error!("SError at ELR={:#018x} ESR={:#018x}", elr, esr);
    panic!("SError exception");
}

/// AArch32 execution state is not supported; terminate the process.
#[no_mangle]
pub extern "C" fn handle_aarch32(_frame: *mut TrapFrame) -> *mut TrapFrame {
    error!("Trap from AArch32 execution state");
    crate::syscall::exit_current(-1);
}

/// Install the exception vector table into VBAR_EL1.
///
/// Must run before interrupts are enabled and before the first chance
/// of a fault.
pub fn init_exception_vectors() {
    #[cfg(all(target_arch = "aarch64", not(test)))]
    unsafe {
        extern "C" {
            static exception_vector_table: u64;
        }

        let vbar = &exception_vector_table as *const _ as u64;
        core::arch::asm!("msr vbar_el1, {}", in(reg) vbar);
        cpu::isb();

        info!("VBAR_EL1 set to {:#x}", vbar);
    }
}

/// First transition to EL0. Installs the user translation root, then
/// mirrors the vector restore sequence with a fresh state.
///
/// # Safety
/// `entry` and `user_sp` must be mapped in `ttbr0`; `kstack_top` must
/// be the top of a valid kernel stack for the process.
pub unsafe fn enter_user(entry: u64, user_sp: u64, kstack_top: u64, ttbr0: u64) -> ! {
    cpu::switch_ttbr0(ttbr0);

    #[cfg(all(target_arch = "aarch64", not(test)))]
    {
        extern "C" {
            fn enter_user_mode(entry: u64, user_sp: u64, kstack_top: u64) -> !;
        }
        enter_user_mode(entry, user_sp, kstack_top);
    }
    #[cfg(not(all(target_arch = "aarch64", not(test))))]
    {
        let _ = (entry, user_sp, kstack_top);
        unreachable!("enter_user is only meaningful on the target");
    }
}
