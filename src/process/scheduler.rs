//! Round-robin scheduler.
//!
//! Preemption is strictly timer-driven: on every tick the inbound
//! trap frame is recorded as the current process's context, the next
//! slot is selected modulo the process count, the user translation
//! root is switched, and that process's saved context is returned for
//! the vector restore path. There is no voluntary yield and no idle
//! task; with an empty table the inbound frame is returned unchanged.

#![allow(dead_code)]

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use super::{Pid, Process, ProcessState, MAX_PROCESSES};
use crate::arch::trap::TrapFrame;
use crate::arch::{cpu, trap};
use crate::lib::error::{Errno, Result};
use crate::sync::IrqSpinLock;

struct SchedulerState {
    processes: Vec<Process>,
    /// Index of the currently executing slot
    current: Option<usize>,
}

static SCHED: IrqSpinLock<SchedulerState> = IrqSpinLock::new(SchedulerState {
    processes: Vec::new(),
    current: None,
});

/// Fast path for syscalls: pid of the running process without taking
/// the scheduler lock.
static CURRENT_PID: AtomicU32 = AtomicU32::new(0);

static NEXT_PID: AtomicU32 = AtomicU32::new(1);

/// Pick the next slot after `current` in a table of `count` entries.
/// Pure so the rotation law is unit-testable.
#[inline]
fn next_slot(current: Option<usize>, count: usize) -> usize {
    match current {
        Some(cur) => (cur + 1) % count,
        None => 0,
    }
}

pub fn allocate_pid() -> Result<Pid> {
    let pid = NEXT_PID.fetch_add(1, Ordering::Relaxed);
    if pid as usize > MAX_PROCESSES {
        return Err(Errno::ENOSPC);
    }
    Ok(pid)
}

/// Insert a prepared process into the run queue.
pub fn register(proc: Process) -> Result<()> {
    let mut sched = SCHED.lock();
    if sched.processes.len() >= MAX_PROCESSES {
        return Err(Errno::ENOSPC);
    }
    sched.processes.push(proc);
    Ok(())
}

pub fn process_count() -> usize {
    SCHED.lock().processes.len()
}

pub fn current_pid() -> Pid {
    CURRENT_PID.load(Ordering::Relaxed)
}

/// Timer-tick entry. Saves the inbound frame as the current context,
/// rotates to the next slot, switches TTBR0 and returns the new
/// context pointer for the vector's restore sequence.
pub fn preempt(frame: *mut TrapFrame) -> *mut TrapFrame {
    let mut sched = SCHED.lock();

    if sched.processes.is_empty() {
        return frame;
    }

    if let Some(cur) = sched.current {
        let proc = &mut sched.processes[cur];
        proc.context = frame;
        proc.state = ProcessState::Running;
    }

    let next = next_slot(sched.current, sched.processes.len());
    sched.current = Some(next);

    let proc = &mut sched.processes[next];
    proc.state = ProcessState::Running;
    CURRENT_PID.store(proc.pid, Ordering::Relaxed);

    unsafe {
        cpu::switch_ttbr0(proc.page_table);
    }

    proc.context
}

/// Bootstrap transfer to EL0: dispatch the first registered process
/// with the entry and stack the loader prepared. Mirrors the vector
/// restore sequence for this first time only. Returns normally only
/// when the table is empty.
pub fn start_first_process() {
    let (entry, user_stack, kstack_top, page_table, pid, name) = {
        let mut sched = SCHED.lock();
        let Some(proc) = sched.processes.first_mut() else {
            return;
        };
        proc.state = ProcessState::Running;
        (
            proc.user_entry,
            proc.user_stack,
            proc.kstack_top,
            proc.page_table,
            proc.pid,
            proc.name.clone(),
        )
    };

    info!(
        "scheduler: starting '{}' (pid {}) at {:#x}, sp {:#x}",
        name, pid, entry, user_stack
    );

    {
        let mut sched = SCHED.lock();
        sched.current = Some(0);
    }
    CURRENT_PID.store(pid, Ordering::Relaxed);

    unsafe {
        trap::enter_user(entry, user_stack, kstack_top, page_table);
    }
}

/// Mark the current process a zombie and halt this context forever.
/// The timer keeps preempting into other processes; nothing is
/// reclaimed.
pub fn exit_current(status: i32) -> ! {
    let pid = current_pid();
    info!("process {} exited with status {}", pid, status);

    {
        let mut sched = SCHED.lock();
        if let Some(cur) = sched.current {
            sched.processes[cur].state = ProcessState::Zombie;
        }
    }

    loop {
        cpu::wait_for_event();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_is_consecutive_modulo_count() {
        let mut cur = None;
        let n = 4;
        let picks: alloc::vec::Vec<usize> = (0..9)
            .map(|_| {
                let next = next_slot(cur, n);
                cur = Some(next);
                next
            })
            .collect();
        assert_eq!(picks, [0, 1, 2, 3, 0, 1, 2, 3, 0]);
    }

    #[test]
    fn first_pick_is_slot_zero() {
        assert_eq!(next_slot(None, 3), 0);
    }

    #[test]
    fn single_process_always_reselected() {
        let mut cur = Some(0);
        for _ in 0..5 {
            let next = next_slot(cur, 1);
            assert_eq!(next, 0);
            cur = Some(next);
        }
    }
}
