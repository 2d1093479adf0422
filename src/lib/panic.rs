// Kernel panic handler
//
// Masks interrupts, dumps the panic location, syndrome and fault
// address registers plus the recent log ring, then parks the CPU on a
// wait-for-event loop.

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, Ordering};

/// Guards against recursive panics (e.g. a fault inside the dump).
static PANICKING: AtomicBool = AtomicBool::new(false);

pub fn panic_handler(info: &PanicInfo) -> ! {
    crate::arch::cpu::irq_disable();

    if PANICKING.swap(true, Ordering::SeqCst) {
        crate::uart::write_bytes(b"\n!!! RECURSIVE PANIC !!!\n");
        halt();
    }

    crate::uart::write_bytes(b"\n==================== KERNEL PANIC ====================\n");

    print_panic_info(info);
    print_fault_registers();

    crate::uart::write_bytes(b"Recent log entries:\n");
    crate::lib::printk::dump_recent();

    crate::uart::write_bytes(b"======================================================\n");

    halt();
}

fn print_panic_info(info: &PanicInfo) {
    use core::fmt::Write;

    struct UartWriter;
    impl Write for UartWriter {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            crate::uart::write_bytes(s.as_bytes());
            Ok(())
        }
    }

    let mut w = UartWriter;
    if let Some(location) = info.location() {
        let _ = write!(
            w,
            "at {}:{}:{}\n",
            location.file(),
            location.line(),
            location.column()
        );
    }
    let _ = write!(w, "{}\n", info.message());
}

fn print_fault_registers() {
    use core::fmt::Write;

    struct UartWriter;
    impl Write for UartWriter {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            crate::uart::write_bytes(s.as_bytes());
            Ok(())
        }
    }

    let mut w = UartWriter;
    let esr = crate::arch::cpu::read_esr_el1();
    let far = crate::arch::cpu::read_far_el1();
    let elr = crate::arch::cpu::read_elr_el1();
    let _ = write!(w, "ESR={:#018x} FAR={:#018x} ELR={:#018x}\n", esr, far, elr);
}

fn halt() -> ! {
    loop {
        crate::arch::cpu::wait_for_event();
    }
}
