//! VirtIO input driver (device id 18).
//!
//! Each device keeps its event queue permanently supplied: all
//! descriptors point at device-writable event buffers and live in the
//! available ring. The interrupt path drains the used ring, returns
//! each descriptor, classifies the events (pointer motion, pointer
//! button, key) and coalesces at most one compositor render per batch.

#![allow(dead_code)]

use alloc::vec::Vec;

use crate::compositor::{self, PointerMove};
use crate::lib::error::{Errno, Result};
use crate::lib::ringbuf::RingBuffer;
use crate::mm::pmm;
use crate::sync::IrqSpinLock;
use crate::virtio::virtqueue::VirtQueue;
use crate::virtio::{self, MmioTransport};

// Linux evdev event types
pub const EV_SYN: u16 = 0;
pub const EV_KEY: u16 = 1;
pub const EV_REL: u16 = 2;
pub const EV_ABS: u16 = 3;

// Axis codes
pub const REL_X: u16 = 0;
pub const REL_Y: u16 = 1;
pub const ABS_X: u16 = 0;
pub const ABS_Y: u16 = 1;

/// Left mouse button key code
pub const BTN_LEFT: u16 = 272;

/// Event queue depth per device.
const QUEUE_SIZE: u16 = 16;

const MAX_DEVICES: usize = 2;

/// Wire format of a virtio-input event.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    pub ev_type: u16,
    pub code: u16,
    pub value: i32,
}

struct InputDev {
    transport: MmioTransport,
    queue: VirtQueue,
    /// Page holding QUEUE_SIZE event buffers
    events_base: u64,
}

static DEVICES: IrqSpinLock<Vec<InputDev>> = IrqSpinLock::new(Vec::new());

/// Process-wide FIFO of key events not consumed by the pointer paths.
static KEY_EVENTS: IrqSpinLock<RingBuffer<InputEvent, 256>> = IrqSpinLock::new(RingBuffer::new());

/// Probe the MMIO bank and bring up every input device found
/// (typically a keyboard and a tablet/mouse).
pub fn init() {
    let transports = virtio::discover(virtio::DEV_ID_INPUT);
    if transports.is_empty() {
        warn!("virtio-input: no devices found");
        return;
    }

    for transport in transports.iter().take(MAX_DEVICES) {
        if let Err(e) = init_device(*transport) {
            warn!(
                "virtio-input: device at {:#x} failed init: {:?}",
                transport.base(),
                e
            );
        }
    }
}

fn init_device(transport: MmioTransport) -> Result<()> {
    transport.negotiate()?;

    let qsize = transport.queue_max(QUEUE_SIZE)?;
    let mut queue = VirtQueue::new(qsize)?;
    transport.setup_queue(&queue);

    // One page of event buffers; every descriptor device-writable and
    // immediately available.
    let events_base = pmm::alloc_page().ok_or(Errno::ENOMEM)?;
    queue.fill_device_writable(events_base, core::mem::size_of::<InputEvent>() as u32);

    transport.driver_ok();

    let index = {
        let mut devices = DEVICES.lock();
        devices.push(InputDev {
            transport,
            queue,
            events_base,
        });
        devices.len() - 1
    };

    let irq = transport.irq();
    crate::arch::gic::set_priority(irq, 0x80);
    crate::arch::gic::set_target(irq, 1);
    crate::arch::gic::irq_register(irq, irq_entry, index).map_err(|_| Errno::EINVAL)?;

    transport.notify();

    info!(
        "virtio-input: device at {:#x} initialized, IRQ {}",
        transport.base(),
        irq
    );
    Ok(())
}

/// IRQ entry for one device. Drains the used ring, then dispatches the
/// batch with at most one render request.
fn irq_entry(_irq: u32, token: usize) {
    // Copy events out under the lock; classification touches the
    // compositor, which takes its own lock.
    let mut batch: heapless::Vec<InputEvent, 32> = heapless::Vec::new();

    {
        let mut devices = DEVICES.lock();
        let Some(dev) = devices.get_mut(token) else {
            return;
        };

        if dev.transport.ack_interrupt() == 0 {
            return;
        }

        while let Some((id, _len)) = dev.queue.pop_used() {
            let event = unsafe {
                core::ptr::read_volatile(
                    (dev.events_base + (id as u64) * core::mem::size_of::<InputEvent>() as u64)
                        as *const InputEvent,
                )
            };
            // The descriptor goes straight back to the device
            dev.queue.recycle(id as u16);

            if batch.push(event).is_err() {
                // Oversized batch: drop the remainder of this drain;
                // the device keeps delivering on the next interrupt.
                break;
            }
        }
    }

    let mut needs_render = false;
    for event in &batch {
        if classify(event) {
            needs_render = true;
        }
    }

    if needs_render {
        compositor::render();
    }
}

/// Route one event. Returns true when the compositor moved and a
/// render is warranted.
fn classify(event: &InputEvent) -> bool {
    match (event.ev_type, event.code) {
        (EV_REL, REL_X) => {
            compositor::pointer_update(PointerMove::Relative {
                dx: event.value,
                dy: 0,
            });
            true
        }
        (EV_REL, REL_Y) => {
            compositor::pointer_update(PointerMove::Relative {
                dx: 0,
                dy: event.value,
            });
            true
        }
        (EV_ABS, ABS_X) => {
            compositor::pointer_update(PointerMove::Absolute {
                x: Some(event.value),
                y: None,
            });
            true
        }
        (EV_ABS, ABS_Y) => {
            compositor::pointer_update(PointerMove::Absolute {
                x: None,
                y: Some(event.value),
            });
            true
        }
        (EV_KEY, BTN_LEFT) => {
            compositor::handle_click(event.value != 0);
            // A click can change z-order or close a window
            true
        }
        (EV_KEY, _) => {
            KEY_EVENTS.lock().push(*event);
            false
        }
        _ => false,
    }
}

/// Pop one raw key event from the process-wide FIFO.
pub fn poll_event() -> Option<InputEvent> {
    KEY_EVENTS.lock().pop()
}

pub fn has_event() -> bool {
    !KEY_EVENTS.lock().is_empty()
}

/// Inject an event as if it arrived from a device. Drives the same
/// classification path; used by tests and the emulator harness.
pub fn inject_event(event: InputEvent) -> bool {
    classify(&event)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Single test: the FIFO is process-wide shared state.
    #[test]
    fn key_events_enter_fifo_in_order_and_syn_is_ignored() {
        while poll_event().is_some() {}

        let rendered = classify(&InputEvent {
            ev_type: EV_SYN,
            code: 0,
            value: 0,
        });
        assert!(!rendered);
        assert!(poll_event().is_none());

        for code in [30u16, 31, 32] {
            classify(&InputEvent {
                ev_type: EV_KEY,
                code,
                value: 1,
            });
        }

        assert_eq!(poll_event().unwrap().code, 30);
        assert_eq!(poll_event().unwrap().code, 31);
        assert_eq!(poll_event().unwrap().code, 32);
        assert!(poll_event().is_none());
    }
}
