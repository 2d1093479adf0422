//! VirtIO MMIO transport layer.
//!
//! Device discovery and status negotiation for the QEMU virt machine's
//! bank of 32 virtio-mmio slots. Handles both the legacy (version 1)
//! and modern (version 2+) queue programming interfaces.

#![allow(dead_code)]

pub mod virtqueue;

use core::ptr;

use crate::lib::error::{Errno, Result};
use virtqueue::VirtQueue;

/// VirtIO MMIO register offsets
#[repr(u32)]
#[derive(Debug, Clone, Copy)]
pub enum MmioReg {
    MagicValue = 0x000,        // 0x74726976 "virt"
    Version = 0x004,           // 1 = legacy, 2+ = VirtIO 1.0
    DeviceId = 0x008,          // Device type identifier
    VendorId = 0x00C,          // 0x554D4551 for QEMU
    DeviceFeatures = 0x010,    // Device feature bits 31:0
    DeviceFeaturesSel = 0x014, // Device feature selection
    DriverFeatures = 0x020,    // Driver feature bits 31:0
    DriverFeaturesSel = 0x024, // Driver feature selection
    GuestPageSize = 0x028,     // Legacy only
    QueueSel = 0x030,          // Queue selection
    QueueNumMax = 0x034,       // Maximum queue size
    QueueNum = 0x038,          // Actual queue size
    QueueAlign = 0x03C,        // Legacy only
    QueuePfn = 0x040,          // Legacy queue address (page number)
    QueueReady = 0x044,        // Modern queue ready
    QueueNotify = 0x050,       // Queue notification
    InterruptStatus = 0x060,   // Interrupt status
    InterruptAck = 0x064,      // Interrupt acknowledge
    Status = 0x070,            // Device status
    QueueDescLow = 0x080,      // Modern: descriptor area
    QueueDescHigh = 0x084,
    QueueDriverLow = 0x090,    // Modern: available ring
    QueueDriverHigh = 0x094,
    QueueDeviceLow = 0x0A0,    // Modern: used ring
    QueueDeviceHigh = 0x0A4,
    Config = 0x100,            // Device-specific configuration
}

/// Device status bits
pub const STATUS_ACKNOWLEDGE: u32 = 1;
pub const STATUS_DRIVER: u32 = 2;
pub const STATUS_DRIVER_OK: u32 = 4;
pub const STATUS_FEATURES_OK: u32 = 8;
pub const STATUS_DEVICE_NEEDS_RESET: u32 = 64;
pub const STATUS_FAILED: u32 = 128;

/// Device type ids we drive
pub const DEV_ID_BLOCK: u32 = 2;
pub const DEV_ID_GPU: u32 = 16;
pub const DEV_ID_INPUT: u32 = 18;

const MAGIC_VIRT: u32 = 0x7472_6976;

/// One probed virtio-mmio slot.
#[derive(Debug, Clone, Copy)]
pub struct MmioTransport {
    base: u64,
    irq: u32,
    version: u32,
    device_id: u32,
}

impl MmioTransport {
    /// Probe a slot: verify the magic, version and a non-placeholder
    /// device id.
    pub fn probe(base: u64, irq: u32) -> Result<Self> {
        let magic = unsafe { ptr::read_volatile((base + MmioReg::MagicValue as u64) as *const u32) };
        if magic != MAGIC_VIRT {
            return Err(Errno::ENODEV);
        }

        let version = unsafe { ptr::read_volatile((base + MmioReg::Version as u64) as *const u32) };
        if version < 1 {
            return Err(Errno::ENODEV);
        }

        let device_id = unsafe { ptr::read_volatile((base + MmioReg::DeviceId as u64) as *const u32) };
        if device_id == 0 {
            return Err(Errno::ENODEV);
        }

        Ok(Self {
            base,
            irq,
            version,
            device_id,
        })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    #[inline]
    pub fn read_reg(&self, reg: MmioReg) -> u32 {
        unsafe { ptr::read_volatile((self.base + reg as u64) as *const u32) }
    }

    #[inline]
    pub fn write_reg(&self, reg: MmioReg, value: u32) {
        unsafe { ptr::write_volatile((self.base + reg as u64) as *mut u32, value) }
    }

    /// Read a 32-bit word from the device configuration space.
    pub fn read_config_u32(&self, offset: u64) -> u32 {
        unsafe { ptr::read_volatile((self.base + MmioReg::Config as u64 + offset) as *const u32) }
    }

    /// Status negotiation: reset, acknowledge, driver, echo the device
    /// feature bits, then FEATURES_OK (verified by read-back on
    /// version 2+; version 1 devices ignore the bit).
    pub fn negotiate(&self) -> Result<()> {
        self.write_reg(MmioReg::Status, 0);

        let mut status = STATUS_ACKNOWLEDGE | STATUS_DRIVER;
        self.write_reg(MmioReg::Status, status);

        let features = self.read_reg(MmioReg::DeviceFeatures);
        self.write_reg(MmioReg::DriverFeatures, features);

        if self.version >= 2 {
            status |= STATUS_FEATURES_OK;
            self.write_reg(MmioReg::Status, status);
            if self.read_reg(MmioReg::Status) & STATUS_FEATURES_OK == 0 {
                warn!("virtio: feature negotiation failed at {:#x}", self.base);
                return Err(Errno::EIO);
            }
        }

        Ok(())
    }

    /// Select queue 0 and pick min(device max, requested); the caller
    /// builds the queue with the returned size.
    pub fn queue_max(&self, requested: u16) -> Result<u16> {
        self.write_reg(MmioReg::QueueSel, 0);
        let max = self.read_reg(MmioReg::QueueNumMax);
        if max == 0 {
            return Err(Errno::ENODEV);
        }
        Ok(core::cmp::min(max as u16, requested))
    }

    /// Install the ring addresses for queue 0.
    pub fn setup_queue(&self, queue: &VirtQueue) {
        self.write_reg(MmioReg::QueueSel, 0);
        self.write_reg(MmioReg::QueueNum, queue.size() as u32);

        if self.version == 1 {
            // Legacy: page size + ring PFN
            self.write_reg(MmioReg::GuestPageSize, 4096);
            self.write_reg(MmioReg::QueuePfn, queue.pfn());
        } else {
            // Modern: three 64-bit region bases + ready
            let desc = queue.desc_addr();
            let avail = queue.avail_addr();
            let used = queue.used_addr();

            self.write_reg(MmioReg::QueueDescLow, desc as u32);
            self.write_reg(MmioReg::QueueDescHigh, (desc >> 32) as u32);
            self.write_reg(MmioReg::QueueDriverLow, avail as u32);
            self.write_reg(MmioReg::QueueDriverHigh, (avail >> 32) as u32);
            self.write_reg(MmioReg::QueueDeviceLow, used as u32);
            self.write_reg(MmioReg::QueueDeviceHigh, (used >> 32) as u32);
            self.write_reg(MmioReg::QueueReady, 1);
        }
    }

    /// Complete initialization.
    pub fn driver_ok(&self) {
        let status = self.read_reg(MmioReg::Status);
        self.write_reg(MmioReg::Status, status | STATUS_DRIVER_OK);
    }

    /// Ring the doorbell for queue 0.
    #[inline]
    pub fn notify(&self) {
        self.write_reg(MmioReg::QueueNotify, 0);
    }

    /// Read-and-acknowledge the interrupt status.
    pub fn ack_interrupt(&self) -> u32 {
        let status = self.read_reg(MmioReg::InterruptStatus);
        if status != 0 {
            self.write_reg(MmioReg::InterruptAck, status);
        }
        status
    }
}

/// Scan the MMIO bank for devices of `device_id`. Returns up to 8
/// matches (QEMU instantiates at most a few of each type).
pub fn discover(device_id: u32) -> heapless::Vec<MmioTransport, 8> {
    let mut found = heapless::Vec::new();
    let desc = crate::platform::active().virtio();

    for slot in 0..desc.slots {
        let base = desc.base + (slot as u64) * desc.stride;
        let irq = desc.irq_base + slot as u32;

        if let Ok(transport) = MmioTransport::probe(base, irq) {
            if transport.device_id() == device_id {
                info!(
                    "virtio: device type {} at slot {} ({:#x}, irq {})",
                    device_id, slot, base, irq
                );
                if found.push(transport).is_err() {
                    break;
                }
            }
        }
    }

    found
}
