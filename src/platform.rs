//! Platform layer for the QEMU `virt` machine.
//!
//! Central place for the fixed MMIO apertures, IRQ numbers and memory
//! layout the rest of the kernel consumes. Everything here is known at
//! boot; there is no device-tree parsing in scope.

#![allow(dead_code)]

/// A physical address range.
#[derive(Debug, Clone, Copy)]
pub struct Range {
    pub start: u64,
    pub size: u64,
}

/// UART descriptor (PL011).
#[derive(Debug, Clone, Copy)]
pub struct UartDesc {
    pub base: u64,
    pub irq: u32,
}

/// GIC descriptor (GICv2: distributor + CPU interface).
#[derive(Debug, Clone, Copy)]
pub struct GicDesc {
    pub gicd: u64,
    pub gicc: u64,
}

/// VirtIO MMIO bank descriptor.
#[derive(Debug, Clone, Copy)]
pub struct VirtioDesc {
    pub base: u64,
    pub stride: u64,
    pub slots: usize,
    pub irq_base: u32,
}

/// Platform descriptor for the active machine.
#[derive(Debug, Clone, Copy)]
pub struct Platform {
    uart: UartDesc,
    gic: GicDesc,
    virtio: VirtioDesc,
    ram: Range,
    mmio: Range,
}

/// QEMU `virt` machine layout.
static QEMU_VIRT: Platform = Platform {
    uart: UartDesc { base: 0x0900_0000, irq: 33 },
    gic: GicDesc { gicd: 0x0800_0000, gicc: 0x0801_0000 },
    virtio: VirtioDesc {
        base: 0x0A00_0000,
        stride: 0x200,
        slots: 32,
        irq_base: 48,
    },
    ram: Range { start: 0x4000_0000, size: 1 << 30 },
    mmio: Range { start: 0x0800_0000, size: 0x0280_0000 },
};

/// EL1 virtual timer PPI.
pub const IRQ_TIMER_VIRT: u32 = 27;

impl Platform {
    pub fn uart(&self) -> UartDesc {
        self.uart
    }

    pub fn gic(&self) -> GicDesc {
        self.gic
    }

    pub fn virtio(&self) -> VirtioDesc {
        self.virtio
    }

    /// DRAM identity-mapped at boot.
    pub fn ram(&self) -> Range {
        self.ram
    }

    /// Device aperture covering GIC, UART and the virtio-mmio bank.
    pub fn mmio(&self) -> Range {
        self.mmio
    }
}

/// The active platform descriptor.
pub fn active() -> &'static Platform {
    &QEMU_VIRT
}
