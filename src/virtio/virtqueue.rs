//! Split virtqueue (descriptor table, available ring, used ring).
//!
//! Legacy two-page layout: descriptor table and available ring share
//! the first page, the used ring starts on the second page boundary,
//! as required when the queue address is programmed as a PFN. Both
//! rings are circular with a free-running 16-bit index; the driver
//! tracks the device's progress with a private `last_used` cursor.

#![allow(dead_code)]

use core::ptr;

use crate::arch::cpu;
use crate::lib::error::{Errno, Result};
use crate::mm::{pmm, PAGE_SIZE};

/// Descriptor flags
pub const VIRTQ_DESC_F_NEXT: u16 = 1; // Chain continues via `next`
pub const VIRTQ_DESC_F_WRITE: u16 = 2; // Device writes (vs reads)
pub const VIRTQ_DESC_F_INDIRECT: u16 = 4; // Indirect descriptor list

/// Virtqueue descriptor
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VirtqDesc {
    /// Buffer address (guest physical)
    pub addr: u64,
    /// Buffer length
    pub len: u32,
    /// Descriptor flags
    pub flags: u16,
    /// Next descriptor index (if flags & VIRTQ_DESC_F_NEXT)
    pub next: u16,
}

/// One buffer in a chain: (address, length, device-writable).
pub type ChainEntry = (u64, u32, bool);

pub struct VirtQueue {
    size: u16,
    /// Two-page region backing the rings (physical == virtual)
    mem_base: u64,
    desc: *mut VirtqDesc,
    avail_base: u64,
    used_base: u64,
    last_used: u16,
}

unsafe impl Send for VirtQueue {}

impl VirtQueue {
    /// Allocate rings from the frame allocator. `size` must be a
    /// power of two small enough for the legacy layout (descriptors +
    /// available ring within one page).
    pub fn new(size: u16) -> Result<Self> {
        let mem = pmm::alloc_pages(2).ok_or(Errno::ENOMEM)?;
        Self::with_region(mem, size)
    }

    /// Lay a queue over caller-provided memory (two zeroed pages).
    pub fn with_region(mem_base: u64, size: u16) -> Result<Self> {
        if !size.is_power_of_two() || size == 0 {
            return Err(Errno::EINVAL);
        }
        // Descriptor table + available ring must fit the first page
        if size as usize * 16 + 6 + 2 * size as usize > PAGE_SIZE {
            return Err(Errno::EINVAL);
        }

        Ok(Self {
            size,
            mem_base,
            desc: mem_base as *mut VirtqDesc,
            avail_base: mem_base + (size as u64) * 16,
            used_base: mem_base + PAGE_SIZE as u64,
            last_used: 0,
        })
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    /// Physical frame number of the ring region (legacy interface).
    pub fn pfn(&self) -> u32 {
        (self.mem_base >> 12) as u32
    }

    /// Region bases for the modern interface.
    pub fn desc_addr(&self) -> u64 {
        self.mem_base
    }

    pub fn avail_addr(&self) -> u64 {
        self.avail_base
    }

    pub fn used_addr(&self) -> u64 {
        self.used_base
    }

    pub fn last_used(&self) -> u16 {
        self.last_used
    }

    /// Program descriptor `index`.
    pub fn write_desc(&mut self, index: u16, addr: u64, len: u32, flags: u16, next: u16) {
        unsafe {
            ptr::write_volatile(
                self.desc.add(index as usize),
                VirtqDesc {
                    addr,
                    len,
                    flags,
                    next,
                },
            );
        }
    }

    /// Lay a chain over descriptors `0..bufs.len()` and return the
    /// head index (always 0: one-shot submissions reuse the fixed
    /// head).
    pub fn write_chain(&mut self, bufs: &[ChainEntry]) -> Result<u16> {
        if bufs.is_empty() || bufs.len() > self.size as usize {
            return Err(Errno::EINVAL);
        }

        for (i, &(addr, len, device_writes)) in bufs.iter().enumerate() {
            let mut flags = if device_writes { VIRTQ_DESC_F_WRITE } else { 0 };
            let mut next = 0;
            if i + 1 < bufs.len() {
                flags |= VIRTQ_DESC_F_NEXT;
                next = (i + 1) as u16;
            }
            self.write_desc(i as u16, addr, len, flags, next);
        }

        Ok(0)
    }

    #[inline]
    fn avail_idx_ptr(&self) -> *mut u16 {
        (self.avail_base + 2) as *mut u16
    }

    #[inline]
    fn avail_ring_ptr(&self, slot: u16) -> *mut u16 {
        (self.avail_base + 4 + 2 * (slot as u64)) as *mut u16
    }

    #[inline]
    fn used_idx_ptr(&self) -> *const u16 {
        (self.used_base + 2) as *const u16
    }

    #[inline]
    fn used_elem_ptr(&self, slot: u16) -> *const u32 {
        (self.used_base + 4 + 8 * (slot as u64)) as *const u32
    }

    /// Publish a head descriptor into the available ring. Barriers on
    /// both sides of the index store: descriptors must be visible
    /// before the index moves, and the index must be visible before
    /// the caller notifies the device.
    pub fn publish(&mut self, head: u16) {
        unsafe {
            let idx = ptr::read_volatile(self.avail_idx_ptr());
            ptr::write_volatile(self.avail_ring_ptr(idx % self.size), head);

            cpu::dmb_sy();
            ptr::write_volatile(self.avail_idx_ptr(), idx.wrapping_add(1));
            cpu::dmb_sy();
        }
    }

    /// Device-published used index.
    #[inline]
    pub fn used_idx(&self) -> u16 {
        unsafe { ptr::read_volatile(self.used_idx_ptr()) }
    }

    /// True when the device has returned entries we have not seen.
    #[inline]
    pub fn has_used(&self) -> bool {
        self.used_idx() != self.last_used
    }

    /// Consume the next used-ring entry: (head descriptor id, written
    /// length). Issues a read barrier before touching the payload.
    pub fn pop_used(&mut self) -> Option<(u32, u32)> {
        if !self.has_used() {
            return None;
        }
        cpu::dmb_sy();

        let slot = self.last_used % self.size;
        let (id, len) = unsafe {
            let p = self.used_elem_ptr(slot);
            (ptr::read_volatile(p), ptr::read_volatile(p.add(1)))
        };
        self.last_used = self.last_used.wrapping_add(1);
        Some((id, len))
    }

    /// Synchronous one-shot submission: lay the chain, publish head 0,
    /// notify, busy-wait for exactly one used entry, return its
    /// written length. Only used at boot and from the compositor
    /// paths; there is no async completion in scope.
    pub fn submit_sync(&mut self, bufs: &[ChainEntry], notify: impl FnOnce()) -> Result<u32> {
        let head = self.write_chain(bufs)?;
        self.publish(head);
        notify();

        loop {
            if let Some((_id, len)) = self.pop_used() {
                return Ok(len);
            }
            core::hint::spin_loop();
        }
    }

    /// Pre-populate every descriptor with a device-writable buffer and
    /// publish all of them, for drivers (input) that keep the device
    /// permanently supplied.
    pub fn fill_device_writable(&mut self, base_addr: u64, elem_len: u32) {
        for i in 0..self.size {
            self.write_desc(
                i,
                base_addr + (i as u64) * (elem_len as u64),
                elem_len,
                VIRTQ_DESC_F_WRITE,
                0,
            );
            unsafe {
                ptr::write_volatile(self.avail_ring_ptr(i), i);
            }
        }
        cpu::dmb_sy();
        unsafe {
            ptr::write_volatile(self.avail_idx_ptr(), self.size);
        }
        cpu::dmb_sy();
    }

    /// Hand a descriptor back to the device after its event was
    /// consumed.
    pub fn recycle(&mut self, id: u16) {
        self.publish(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    /// A fake device over raw ring memory: completes every published
    /// chain by appending a used element referencing its head.
    struct FakeDevice {
        used_base: u64,
        avail_base: u64,
        qsize: u16,
        seen_avail: u16,
    }

    impl FakeDevice {
        fn poll(&mut self) -> usize {
            let mut completed = 0;
            unsafe {
                let avail_idx = ptr::read_volatile((self.avail_base + 2) as *const u16);
                while self.seen_avail != avail_idx {
                    let slot = self.seen_avail % self.qsize;
                    let head =
                        ptr::read_volatile((self.avail_base + 4 + 2 * slot as u64) as *const u16);

                    let used_idx = ptr::read_volatile((self.used_base + 2) as *const u16);
                    let elem = (self.used_base + 4 + 8 * (used_idx % self.qsize) as u64) as *mut u32;
                    ptr::write_volatile(elem, head as u32);
                    ptr::write_volatile(elem.add(1), 512);
                    ptr::write_volatile((self.used_base + 2) as *mut u16, used_idx.wrapping_add(1));

                    self.seen_avail = self.seen_avail.wrapping_add(1);
                    completed += 1;
                }
            }
            completed
        }
    }

    fn ring_fixture(qsize: u16) -> (VirtQueue, FakeDevice, vec::Vec<u8>) {
        // Two "pages" of ring memory; the Vec address stands in for a
        // physical address, matching the identity-map assumption.
        let mut mem = vec![0u8; 2 * PAGE_SIZE + PAGE_SIZE];
        // Align to a page boundary inside the allocation
        let base = {
            let addr = mem.as_mut_ptr() as u64;
            (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
        };

        let queue = VirtQueue::with_region(base, qsize).unwrap();
        let device = FakeDevice {
            used_base: queue.used_addr(),
            avail_base: queue.avail_addr(),
            qsize,
            seen_avail: 0,
        };
        (queue, device, mem)
    }

    #[test]
    fn rejects_non_power_of_two_sizes() {
        assert!(VirtQueue::with_region(0x10000, 12).is_err());
        assert!(VirtQueue::with_region(0x10000, 0).is_err());
        // 256 descriptors no longer fit the legacy first page
        assert!(VirtQueue::with_region(0x10000, 256).is_err());
    }

    #[test]
    fn k_submissions_yield_k_used_entries() {
        let (mut queue, mut device, _mem) = ring_fixture(16);

        let payload = [0u8; 64];
        let addr = payload.as_ptr() as u64;

        const K: usize = 5;
        for i in 0..K {
            let head = queue
                .write_chain(&[(addr, 16, false), (addr + 16, 32, true)])
                .unwrap();
            queue.publish(head);
            assert_eq!(device.poll(), 1);

            let (id, len) = queue.pop_used().expect("one completion per submission");
            assert_eq!(id, head as u32);
            assert_eq!(len, 512);
            assert_eq!(queue.last_used(), (i + 1) as u16);
        }

        // Cursor caught up with the device-published index
        assert_eq!(queue.last_used(), queue.used_idx());
        assert!(queue.pop_used().is_none());
    }

    #[test]
    fn submit_sync_round_trip() {
        let (mut queue, device, _mem) = ring_fixture(8);

        // Complete the request from "the device" inside the notify
        // hook, before the busy-wait starts.
        let device_cell = core::cell::RefCell::new(device);
        let payload = [0u8; 32];
        let len = queue
            .submit_sync(&[(payload.as_ptr() as u64, 32, true)], || {
                device_cell.borrow_mut().poll();
            })
            .unwrap();

        assert_eq!(len, 512);
        assert_eq!(queue.last_used(), 1);
    }

    #[test]
    fn chain_descriptors_link_in_order() {
        let (mut queue, _device, _mem) = ring_fixture(8);

        let bufs = [(0x1000u64, 16u32, false), (0x2000, 64, false), (0x3000, 1, true)];
        let head = queue.write_chain(&bufs).unwrap();
        assert_eq!(head, 0);

        unsafe {
            let d0 = ptr::read_volatile(queue.desc);
            let d1 = ptr::read_volatile(queue.desc.add(1));
            let d2 = ptr::read_volatile(queue.desc.add(2));

            assert_eq!(d0.addr, 0x1000);
            assert_eq!(d0.flags, VIRTQ_DESC_F_NEXT);
            assert_eq!(d0.next, 1);

            assert_eq!(d1.flags, VIRTQ_DESC_F_NEXT);
            assert_eq!(d1.next, 2);

            assert_eq!(d2.flags, VIRTQ_DESC_F_WRITE);
        }
    }

    #[test]
    fn fill_device_writable_publishes_every_descriptor() {
        let (mut queue, _device, _mem) = ring_fixture(16);

        queue.fill_device_writable(0x9000, 8);

        unsafe {
            let avail_idx = ptr::read_volatile((queue.avail_addr() + 2) as *const u16);
            assert_eq!(avail_idx, 16);

            for i in 0..16u16 {
                let d = ptr::read_volatile(queue.desc.add(i as usize));
                assert_eq!(d.addr, 0x9000 + i as u64 * 8);
                assert_eq!(d.flags, VIRTQ_DESC_F_WRITE);
                let slot =
                    ptr::read_volatile((queue.avail_addr() + 4 + 2 * i as u64) as *const u16);
                assert_eq!(slot, i);
            }
        }
    }
}
