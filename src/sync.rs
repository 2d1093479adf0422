//! IRQ-aware locking.
//!
//! Short critical sections in this kernel mask IRQs locally, perform
//! the update, then restore the saved mask state. The lock itself is a
//! spinlock so the discipline stays correct once secondary cores run.

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use spin::{Mutex, MutexGuard};

use crate::arch::cpu;

/// A spinlock whose guard also holds IRQs masked on the local CPU.
///
/// Safe to take from both thread and interrupt context: the DAIF state
/// is saved before the spin and restored on drop, so nested sections
/// compose.
pub struct IrqSpinLock<T> {
    inner: Mutex<T>,
}

pub struct IrqSpinLockGuard<'a, T> {
    guard: ManuallyDrop<MutexGuard<'a, T>>,
    saved_daif: u64,
}

impl<T> IrqSpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let saved_daif = cpu::irq_save();
        IrqSpinLockGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
            saved_daif,
        }
    }
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for IrqSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // The spinlock must release before IRQs unmask, otherwise an
        // interrupt handler could spin on a lock we still hold.
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
        }
        cpu::irq_restore(self.saved_daif);
    }
}
