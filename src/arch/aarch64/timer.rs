// ARM Generic Timer (EL1 virtual timer)
//
// The virtual timer works in QEMU -kernel mode without EL2 help, so
// the system tick uses CNTV and PPI 27. Frequency comes from
// CNTFRQ_EL0, set by firmware.

#![allow(dead_code)]

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::vec::Vec;

use crate::arch::trap::TrapFrame;
use crate::platform::IRQ_TIMER_VIRT;
use crate::sync::IrqSpinLock;

/// System tick rate.
pub const HZ: u64 = 100;

const USEC_PER_SEC: u64 = 1_000_000;

/// Monotonic tick counter, incremented on every timer IRQ. Never
/// observed to decrease.
static JIFFIES: AtomicU64 = AtomicU64::new(0);

/// Counter frequency, read once at boot.
static TIMER_FREQ: AtomicU64 = AtomicU64::new(0);

/// A software timer: fires `callback(token)` once `jiffies` reaches
/// `expires`.
#[derive(Clone, Copy)]
pub struct SoftTimer {
    pub expires: u64,
    pub callback: fn(usize),
    pub token: usize,
}

static SOFT_TIMERS: IrqSpinLock<Vec<SoftTimer>> = IrqSpinLock::new(Vec::new());

#[inline]
fn read_cntfrq() -> u64 {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        let freq: u64;
        core::arch::asm!("mrs {}, cntfrq_el0", out(reg) freq);
        freq
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        62_500_000
    }
}

#[inline]
fn read_cntvct() -> u64 {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        let count: u64;
        core::arch::asm!("mrs {}, cntvct_el0", out(reg) count);
        count
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        0
    }
}

#[inline]
fn write_cntv_cval(val: u64) {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!("msr cntv_cval_el0, {}", in(reg) val);
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = val;
    }
}

#[inline]
fn write_cntv_ctl(val: u64) {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!("msr cntv_ctl_el0, {}", in(reg) val);
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = val;
    }
}

/// Current monotonic tick count.
#[inline]
pub fn jiffies() -> u64 {
    JIFFIES.load(Ordering::Relaxed)
}

/// Counter frequency in Hz.
#[inline]
pub fn frequency() -> u64 {
    TIMER_FREQ.load(Ordering::Relaxed)
}

/// One-time init on the boot CPU: latch the counter frequency.
pub fn init() {
    let mut freq = read_cntfrq();
    if freq == 0 {
        // QEMU occasionally leaves CNTFRQ unset under -kernel
        freq = 62_500_000;
    }
    TIMER_FREQ.store(freq, Ordering::Relaxed);

    info!("Timer: Frequency {} Hz", freq);
    info!("Timer: System tick rate {} Hz", HZ);
}

/// Arm the virtual timer on the calling CPU and enable its PPI.
pub fn init_percpu() {
    let freq = frequency();
    let next = read_cntvct() + freq / HZ;
    write_cntv_cval(next);

    // ENABLE=1, IMASK=0
    write_cntv_ctl(1);

    super::gic::enable_irq(IRQ_TIMER_VIRT);

    info!("Timer: Virtual timer armed (IRQ {})", IRQ_TIMER_VIRT);
}

/// Timer IRQ path: advance jiffies, rearm the compare register, fire
/// expired software timers, then hand the frame to the scheduler. The
/// returned frame is the context the vector restores, so a freshly
/// scheduled process always observes the new jiffies value.
pub fn handle_tick(frame: *mut TrapFrame) -> *mut TrapFrame {
    let now = JIFFIES.fetch_add(1, Ordering::Relaxed) + 1;

    write_cntv_cval(read_cntvct() + frequency() / HZ);

    run_expired_timers(now);

    crate::process::scheduler::preempt(frame)
}

fn run_expired_timers(now: u64) {
    // Collect expired entries under the lock, fire them outside it so
    // callbacks may re-register themselves.
    let mut expired: Vec<SoftTimer> = Vec::new();
    {
        let mut timers = SOFT_TIMERS.lock();
        let mut i = 0;
        while i < timers.len() {
            if now >= timers[i].expires {
                expired.push(timers.swap_remove(i));
            } else {
                i += 1;
            }
        }
    }

    for t in expired {
        (t.callback)(t.token);
    }
}

/// Register a software timer.
pub fn timer_add(expires: u64, callback: fn(usize), token: usize) {
    SOFT_TIMERS.lock().push(SoftTimer {
        expires,
        callback,
        token,
    });
}

/// Remove all software timers matching `callback` and `token`.
pub fn timer_del(callback: fn(usize), token: usize) {
    let mut timers = SOFT_TIMERS.lock();
    timers.retain(|t| !(t.callback == callback && t.token == token));
}

/// Microseconds since the counter started.
pub fn uptime_us() -> u64 {
    let freq = frequency();
    if freq == 0 {
        return 0;
    }
    (read_cntvct() * USEC_PER_SEC) / freq
}

/// Busy-wait for `us` microseconds on the counter.
pub fn delay_us(us: u64) {
    let freq = frequency();
    if freq == 0 {
        return;
    }
    let start = read_cntvct();
    let ticks = (us * freq) / USEC_PER_SEC;
    while read_cntvct().wrapping_sub(start) < ticks {
        core::hint::spin_loop();
    }
}

pub fn delay_ms(ms: u64) {
    delay_us(ms * 1000);
}
