use super::error::{InitError, InitResult};

/// Early bootstrap: exception level check, console, physical memory,
/// translation tables + MMU, kernel heap.
///
/// # Safety
/// Must be called exactly once, with the boot stack installed and the
/// exception vectors already live.
pub unsafe fn early_init() -> InitResult<()> {
    // The kernel runs at EL1; anything else means the loader protocol
    // was violated.
    let el = crate::arch::cpu::current_el();
    if el != 1 {
        return Err(InitError::InvalidExceptionLevel(el as u8));
    }
    #[cfg(feature = "bringup")]
    crate::uart_print(b"EL1 OK\n");

    crate::uart::init();
    crate::uart_print(b"UART: READY\n");

    // The heap is a static region inside the image, so it comes up
    // before the frame allocator (whose metadata lives on the heap).
    crate::heap::init().map_err(InitError::Early)?;
    crate::heap::self_test().map_err(InitError::Early)?;
    crate::uart_print(b"HEAP: READY\n");

    crate::mm::pmm::init();
    crate::uart_print(b"PMM: READY\n");

    crate::mm::vmm::init().map_err(|_| InitError::Early("mmu bring-up failed"))?;
    crate::uart_print(b"MMU: ON\n");

    Ok(())
}

/// Memory subsystem: the block buffer cache.
pub unsafe fn memory_init() -> InitResult<()> {
    crate::mm::buffer::init();
    Ok(())
}

/// Interrupt controller and VirtIO devices.
///
/// The GIC comes first so the input driver can register its lines.
pub unsafe fn driver_init() -> InitResult<()> {
    crate::arch::gic::init();
    crate::arch::gic::init_percpu();
    #[cfg(feature = "bringup")]
    crate::uart_print(b"GIC OK\n");

    // Block device is required for the filesystem; GPU and input are
    // required for the compositor. All probe the same MMIO bank.
    crate::drivers::virtio_blk::init().map_err(|_| InitError::Driver("no virtio block device"))?;
    crate::drivers::virtio_gpu::init().map_err(|_| InitError::Driver("no virtio gpu device"))?;
    crate::drivers::virtio_input::init();
    crate::drivers::keyboard::init();

    Ok(())
}

/// Disk layout, filesystem and compositor.
pub unsafe fn subsystem_init() -> InitResult<()> {
    crate::fs::gpt::init().map_err(|_| InitError::Subsystem("gpt parse failed"))?;
    crate::fs::ext4::init().map_err(|_| InitError::Subsystem("ext4 mount failed"))?;

    crate::compositor::init();

    Ok(())
}

/// Timer, interrupts and the first user processes.
///
/// Does not return when a user process was loaded: control transfers
/// to EL0 and only comes back through the vector table.
pub unsafe fn late_init() -> InitResult<()> {
    crate::arch::timer::init();
    crate::arch::timer::init_percpu();

    // IRQs stay masked until the first eret into EL0: the initial
    // trap frame unmasks them, and only then may the scheduler swap
    // contexts. Unmasking earlier would let a tick preempt away from
    // the boot stack while processes are still being loaded.
    crate::process::spawn_initial_processes();

    // Only reached when nothing was loadable from disk; unmask for
    // the idle loop, which still wants timer ticks.
    crate::arch::cpu::irq_enable();
    Ok(())
}
