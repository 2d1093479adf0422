//! VirtIO block device driver (device id 2).
//!
//! Synchronous sector I/O through a single virtqueue. Each request is
//! a three-descriptor chain: header (device-read), data, status byte
//! (device-write). The driver busy-waits on the used ring; block I/O
//! only happens at boot and from the compositor scroll path.

#![allow(dead_code)]

use crate::lib::error::{Errno, Result};
use crate::sync::IrqSpinLock;
use crate::virtio::virtqueue::VirtQueue;
use crate::virtio::{self, MmioTransport};

// Request types
const VIRTIO_BLK_T_IN: u32 = 0; // Read
const VIRTIO_BLK_T_OUT: u32 = 1; // Write
const VIRTIO_BLK_T_FLUSH: u32 = 4;

// Request status byte
const VIRTIO_BLK_S_OK: u8 = 0;
const VIRTIO_BLK_S_IOERR: u8 = 1;
const VIRTIO_BLK_S_UNSUPP: u8 = 2;

/// Sector size of the device.
pub const SECTOR_SIZE: usize = 512;

/// Queue depth: min(device max, 16).
const QUEUE_SIZE: u16 = 16;

/// Request header preceding every data payload.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct VirtioBlkReq {
    req_type: u32,
    reserved: u32,
    sector: u64,
}

struct VirtioBlk {
    transport: MmioTransport,
    queue: VirtQueue,
    capacity_sectors: u64,
}

impl VirtioBlk {
    /// One synchronous request. `data` is (address, length); the
    /// device writes the payload on reads and reads it on writes.
    fn submit(&mut self, req_type: u32, sector: u64, data: Option<(u64, u32)>) -> Result<()> {
        let mut header = VirtioBlkReq {
            req_type,
            reserved: 0,
            sector,
        };
        let mut status: u8 = 0xFF;

        let header_addr = &mut header as *mut VirtioBlkReq as u64;
        let status_addr = &mut status as *mut u8 as u64;
        let header_len = core::mem::size_of::<VirtioBlkReq>() as u32;

        let device_writes_data = req_type == VIRTIO_BLK_T_IN;

        let transport = self.transport;
        match data {
            // Flush carries no payload
            None => {
                self.queue.submit_sync(
                    &[(header_addr, header_len, false), (status_addr, 1, true)],
                    || transport.notify(),
                )?;
            }
            Some((addr, len)) => {
                self.queue.submit_sync(
                    &[
                        (header_addr, header_len, false),
                        (addr, len, device_writes_data),
                        (status_addr, 1, true),
                    ],
                    || transport.notify(),
                )?;
            }
        }

        match status {
            VIRTIO_BLK_S_OK => Ok(()),
            VIRTIO_BLK_S_UNSUPP => {
                warn!("virtio-blk: unsupported request type {}", req_type);
                Err(Errno::EIO)
            }
            _ => {
                warn!("virtio-blk: I/O error (status={})", status);
                Err(Errno::EIO)
            }
        }
    }
}

static DEVICE: IrqSpinLock<Option<VirtioBlk>> = IrqSpinLock::new(None);

/// Probe and initialize the first virtio block device.
pub fn init() -> Result<()> {
    let transports = virtio::discover(virtio::DEV_ID_BLOCK);
    let transport = *transports.first().ok_or(Errno::ENODEV)?;

    transport.negotiate()?;

    let qsize = transport.queue_max(QUEUE_SIZE)?;
    let queue = VirtQueue::new(qsize)?;
    transport.setup_queue(&queue);
    transport.driver_ok();

    // Capacity lives in the first 8 bytes of config space
    let cap_lo = transport.read_config_u32(0) as u64;
    let cap_hi = transport.read_config_u32(4) as u64;
    let capacity_sectors = (cap_hi << 32) | cap_lo;

    info!(
        "virtio-blk: {} sectors ({} MB), queue size {}",
        capacity_sectors,
        capacity_sectors / 2048,
        qsize
    );

    *DEVICE.lock() = Some(VirtioBlk {
        transport,
        queue,
        capacity_sectors,
    });

    Ok(())
}

/// Read whole sectors starting at `sector` into `buf` (length must be
/// a multiple of the sector size).
pub fn read_sectors(sector: u64, buf: &mut [u8]) -> Result<()> {
    if buf.is_empty() || buf.len() % SECTOR_SIZE != 0 {
        return Err(Errno::EINVAL);
    }
    let mut device = DEVICE.lock();
    let device = device.as_mut().ok_or(Errno::ENODEV)?;
    if sector + (buf.len() / SECTOR_SIZE) as u64 > device.capacity_sectors {
        return Err(Errno::EINVAL);
    }
    device.submit(
        VIRTIO_BLK_T_IN,
        sector,
        Some((buf.as_mut_ptr() as u64, buf.len() as u32)),
    )
}

/// Write whole sectors starting at `sector`.
pub fn write_sectors(sector: u64, buf: &[u8]) -> Result<()> {
    if buf.is_empty() || buf.len() % SECTOR_SIZE != 0 {
        return Err(Errno::EINVAL);
    }
    let mut device = DEVICE.lock();
    let device = device.as_mut().ok_or(Errno::ENODEV)?;
    if sector + (buf.len() / SECTOR_SIZE) as u64 > device.capacity_sectors {
        return Err(Errno::EINVAL);
    }

    device.submit(
        VIRTIO_BLK_T_OUT,
        sector,
        Some((buf.as_ptr() as u64, buf.len() as u32)),
    )
}

/// Issue a cache flush to the device.
pub fn flush() -> Result<()> {
    let mut device = DEVICE.lock();
    let device = device.as_mut().ok_or(Errno::ENODEV)?;
    device.submit(VIRTIO_BLK_T_FLUSH, 0, None)
}

/// Device capacity in sectors.
pub fn capacity_sectors() -> u64 {
    let device = DEVICE.lock();
    device.as_ref().map(|d| d.capacity_sectors).unwrap_or(0)
}
