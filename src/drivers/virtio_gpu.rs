//! VirtIO GPU driver (device id 16).
//!
//! Brings up a single 2D scanout: create a host resource, attach a
//! guest backing store, set the scanout, then push pixels with
//! transfer-to-host + resource-flush. All control-queue commands are
//! synchronous two-descriptor submissions (command out, response in).

#![allow(dead_code)]

use crate::lib::error::{Errno, Result};
use crate::mm::{pmm, PAGE_SIZE};
use crate::sync::IrqSpinLock;
use crate::virtio::virtqueue::VirtQueue;
use crate::virtio::{self, MmioTransport};

// Control queue command types
const VIRTIO_GPU_CMD_GET_DISPLAY_INFO: u32 = 0x0100;
const VIRTIO_GPU_CMD_RESOURCE_CREATE_2D: u32 = 0x0101;
const VIRTIO_GPU_CMD_RESOURCE_UNREF: u32 = 0x0102;
const VIRTIO_GPU_CMD_SET_SCANOUT: u32 = 0x0103;
const VIRTIO_GPU_CMD_RESOURCE_FLUSH: u32 = 0x0104;
const VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D: u32 = 0x0105;
const VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING: u32 = 0x0106;

// Response types
const VIRTIO_GPU_RESP_OK_NODATA: u32 = 0x1100;
const VIRTIO_GPU_RESP_OK_DISPLAY_INFO: u32 = 0x1101;

/// B8G8R8A8: byte order B,G,R,A in memory, which is exactly a
/// little-endian ARGB u32.
const VIRTIO_GPU_FORMAT_B8G8R8A8_UNORM: u32 = 1;

const VIRTIO_GPU_MAX_SCANOUTS: usize = 16;

/// Initial mode; renegotiable through `set_mode`.
pub const DEFAULT_WIDTH: u32 = 800;
pub const DEFAULT_HEIGHT: u32 = 600;

const QUEUE_SIZE: u16 = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct CtrlHeader {
    cmd_type: u32,
    flags: u32,
    fence_id: u64,
    ctx_id: u32,
    padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GpuRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct DisplayOne {
    r: GpuRect,
    enabled: u32,
    flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct RespDisplayInfo {
    hdr: CtrlHeader,
    pmodes: [DisplayOne; VIRTIO_GPU_MAX_SCANOUTS],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct ResourceCreate2d {
    hdr: CtrlHeader,
    resource_id: u32,
    format: u32,
    width: u32,
    height: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct ResourceAttachBacking {
    hdr: CtrlHeader,
    resource_id: u32,
    nr_entries: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct MemEntry {
    addr: u64,
    length: u32,
    padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct SetScanout {
    hdr: CtrlHeader,
    r: GpuRect,
    scanout_id: u32,
    resource_id: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct ResourceFlush {
    hdr: CtrlHeader,
    r: GpuRect,
    resource_id: u32,
    padding: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct TransferToHost2d {
    hdr: CtrlHeader,
    r: GpuRect,
    offset: u64,
    resource_id: u32,
    padding: u32,
}

struct VirtioGpu {
    transport: MmioTransport,
    queue: VirtQueue,
    /// One page each for the in-flight command and its response
    cmd_page: u64,
    resp_page: u64,
    /// Device-visible framebuffer backing store
    fb_base: u64,
    fb_pages: usize,
    width: u32,
    height: u32,
    resource_id: u32,
}

impl VirtioGpu {
    /// Send one command and wait for the response header. Returns the
    /// response type.
    fn send<C: Copy>(&mut self, cmd: &C, extra: &[u8], resp_len: usize) -> Result<u32> {
        let cmd_len = core::mem::size_of::<C>() + extra.len();
        if cmd_len > PAGE_SIZE || resp_len > PAGE_SIZE {
            return Err(Errno::EINVAL);
        }

        unsafe {
            core::ptr::write_bytes(self.cmd_page as *mut u8, 0, PAGE_SIZE);
            core::ptr::write_bytes(self.resp_page as *mut u8, 0, PAGE_SIZE);
            core::ptr::copy_nonoverlapping(
                cmd as *const C as *const u8,
                self.cmd_page as *mut u8,
                core::mem::size_of::<C>(),
            );
            core::ptr::copy_nonoverlapping(
                extra.as_ptr(),
                (self.cmd_page as *mut u8).add(core::mem::size_of::<C>()),
                extra.len(),
            );
        }

        let transport = self.transport;
        self.queue.submit_sync(
            &[
                (self.cmd_page, cmd_len as u32, false),
                (self.resp_page, resp_len as u32, true),
            ],
            || transport.notify(),
        )?;

        let resp_type = unsafe { core::ptr::read_volatile(self.resp_page as *const u32) };
        Ok(resp_type)
    }

    fn expect_ok(&mut self, resp_type: u32, what: &str) -> Result<()> {
        if resp_type != VIRTIO_GPU_RESP_OK_NODATA {
            warn!("virtio-gpu: {} failed (resp {:#x})", what, resp_type);
            return Err(Errno::EIO);
        }
        Ok(())
    }

    /// Create the resource, attach the backing store and point the
    /// scanout at it.
    fn setup_scanout(&mut self, width: u32, height: u32) -> Result<()> {
        let size = (width as usize) * (height as usize) * 4;
        let pages = (size + PAGE_SIZE - 1) / PAGE_SIZE;

        let backing = pmm::alloc_pages(pages).ok_or(Errno::ENOMEM)?;
        self.fb_base = backing;
        self.fb_pages = pages;
        self.width = width;
        self.height = height;

        let create = ResourceCreate2d {
            hdr: CtrlHeader {
                cmd_type: VIRTIO_GPU_CMD_RESOURCE_CREATE_2D,
                ..Default::default()
            },
            resource_id: self.resource_id,
            format: VIRTIO_GPU_FORMAT_B8G8R8A8_UNORM,
            width,
            height,
        };
        let resp = self.send(&create, &[], core::mem::size_of::<CtrlHeader>())?;
        self.expect_ok(resp, "resource-create-2d")?;

        let attach = ResourceAttachBacking {
            hdr: CtrlHeader {
                cmd_type: VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING,
                ..Default::default()
            },
            resource_id: self.resource_id,
            nr_entries: 1,
        };
        let entry = MemEntry {
            addr: backing,
            length: size as u32,
            padding: 0,
        };
        let entry_bytes = unsafe {
            core::slice::from_raw_parts(
                &entry as *const MemEntry as *const u8,
                core::mem::size_of::<MemEntry>(),
            )
        };
        let resp = self.send(&attach, entry_bytes, core::mem::size_of::<CtrlHeader>())?;
        self.expect_ok(resp, "resource-attach-backing")?;

        let scanout = SetScanout {
            hdr: CtrlHeader {
                cmd_type: VIRTIO_GPU_CMD_SET_SCANOUT,
                ..Default::default()
            },
            r: GpuRect {
                x: 0,
                y: 0,
                width,
                height,
            },
            scanout_id: 0,
            resource_id: self.resource_id,
        };
        let resp = self.send(&scanout, &[], core::mem::size_of::<CtrlHeader>())?;
        self.expect_ok(resp, "set-scanout")?;

        Ok(())
    }

    /// Push a rectangle of the backing store to the host and flush it
    /// to the display.
    fn flush_rect(&mut self, x: u32, y: u32, w: u32, h: u32) -> Result<()> {
        let transfer = TransferToHost2d {
            hdr: CtrlHeader {
                cmd_type: VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D,
                ..Default::default()
            },
            r: GpuRect {
                x,
                y,
                width: w,
                height: h,
            },
            offset: ((y as u64) * (self.width as u64) + x as u64) * 4,
            resource_id: self.resource_id,
            padding: 0,
        };
        let resp = self.send(&transfer, &[], core::mem::size_of::<CtrlHeader>())?;
        self.expect_ok(resp, "transfer-to-host-2d")?;

        let flush = ResourceFlush {
            hdr: CtrlHeader {
                cmd_type: VIRTIO_GPU_CMD_RESOURCE_FLUSH,
                ..Default::default()
            },
            r: GpuRect {
                x,
                y,
                width: w,
                height: h,
            },
            resource_id: self.resource_id,
            padding: 0,
        };
        let resp = self.send(&flush, &[], core::mem::size_of::<CtrlHeader>())?;
        self.expect_ok(resp, "resource-flush")
    }
}

static DEVICE: IrqSpinLock<Option<VirtioGpu>> = IrqSpinLock::new(None);

/// Probe and initialize the GPU, bringing the scanout up at the
/// default resolution.
pub fn init() -> Result<()> {
    let transports = virtio::discover(virtio::DEV_ID_GPU);
    let transport = *transports.first().ok_or(Errno::ENODEV)?;

    transport.negotiate()?;

    let qsize = transport.queue_max(QUEUE_SIZE)?;
    let queue = VirtQueue::new(qsize)?;
    transport.setup_queue(&queue);
    transport.driver_ok();

    let cmd_page = pmm::alloc_page().ok_or(Errno::ENOMEM)?;
    let resp_page = pmm::alloc_page().ok_or(Errno::ENOMEM)?;

    let mut gpu = VirtioGpu {
        transport,
        queue,
        cmd_page,
        resp_page,
        fb_base: 0,
        fb_pages: 0,
        width: 0,
        height: 0,
        resource_id: 1,
    };

    // Display info is informational; the fixed default mode is used
    // regardless.
    let info_cmd = CtrlHeader {
        cmd_type: VIRTIO_GPU_CMD_GET_DISPLAY_INFO,
        ..Default::default()
    };
    let resp = gpu.send(&info_cmd, &[], core::mem::size_of::<RespDisplayInfo>())?;
    if resp == VIRTIO_GPU_RESP_OK_DISPLAY_INFO {
        let pmode = unsafe {
            core::ptr::read_volatile(
                (gpu.resp_page + core::mem::size_of::<CtrlHeader>() as u64) as *const DisplayOne,
            )
        };
        info!(
            "virtio-gpu: display 0: {}x{} enabled={}",
            pmode.r.width, pmode.r.height, pmode.enabled
        );
    }

    gpu.setup_scanout(DEFAULT_WIDTH, DEFAULT_HEIGHT)?;
    gpu.flush_rect(0, 0, DEFAULT_WIDTH, DEFAULT_HEIGHT)?;

    info!("virtio-gpu: scanout {}x{} ready", DEFAULT_WIDTH, DEFAULT_HEIGHT);

    *DEVICE.lock() = Some(gpu);
    Ok(())
}

/// Current scanout resolution.
pub fn resolution() -> (u32, u32) {
    let device = DEVICE.lock();
    match device.as_ref() {
        Some(gpu) => (gpu.width, gpu.height),
        None => (DEFAULT_WIDTH, DEFAULT_HEIGHT),
    }
}

/// Copy a full frame into the backing store and flush the whole
/// scanout. `front` must hold `width * height` pixels.
pub fn present(front: &[u32]) -> Result<()> {
    let mut device = DEVICE.lock();
    let gpu = device.as_mut().ok_or(Errno::ENODEV)?;

    let count = (gpu.width as usize) * (gpu.height as usize);
    if front.len() < count {
        return Err(Errno::EINVAL);
    }

    unsafe {
        core::ptr::copy_nonoverlapping(front.as_ptr(), gpu.fb_base as *mut u32, count);
    }
    let (w, h) = (gpu.width, gpu.height);
    gpu.flush_rect(0, 0, w, h)
}

/// Run `f` directly on the device-visible framebuffer, then flush.
/// Used by the splash path for processes without a window.
pub fn with_framebuffer<R>(f: impl FnOnce(&mut [u32], u32, u32) -> R) -> Result<R> {
    let mut device = DEVICE.lock();
    let gpu = device.as_mut().ok_or(Errno::ENODEV)?;

    let count = (gpu.width as usize) * (gpu.height as usize);
    let fb = unsafe { core::slice::from_raw_parts_mut(gpu.fb_base as *mut u32, count) };
    let result = f(fb, gpu.width, gpu.height);

    let (w, h) = (gpu.width, gpu.height);
    gpu.flush_rect(0, 0, w, h)?;
    Ok(result)
}

/// Renegotiate the scanout at a new resolution: drop the old resource,
/// create a new one over a fresh backing store.
pub fn set_mode(width: u32, height: u32) -> Result<()> {
    let mut device = DEVICE.lock();
    let gpu = device.as_mut().ok_or(Errno::ENODEV)?;

    let unref = [gpu.resource_id, 0u32];
    let unref_cmd = CtrlHeader {
        cmd_type: VIRTIO_GPU_CMD_RESOURCE_UNREF,
        ..Default::default()
    };
    let unref_bytes = unsafe {
        core::slice::from_raw_parts(unref.as_ptr() as *const u8, core::mem::size_of_val(&unref))
    };
    let resp = gpu.send(&unref_cmd, unref_bytes, core::mem::size_of::<CtrlHeader>())?;
    gpu.expect_ok(resp, "resource-unref")?;

    if gpu.fb_base != 0 {
        pmm::free_pages(gpu.fb_base, gpu.fb_pages);
    }

    gpu.resource_id += 1;
    gpu.setup_scanout(width, height)?;
    gpu.flush_rect(0, 0, width, height)?;

    info!("virtio-gpu: mode set {}x{}", width, height);
    Ok(())
}
