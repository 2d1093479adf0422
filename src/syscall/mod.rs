//! System call dispatcher.
//!
//! Entered from the synchronous trap path with the saved user register
//! file. The service number travels in x8, arguments in x0-x5, and the
//! return value is written back into x0 of the frame. IRQs are
//! unmasked on entry so long syscalls stay preemptible.

use crate::arch::cpu;
use crate::arch::trap::TrapFrame;
use crate::compositor;
use crate::drivers::keyboard;
use crate::process;

// Service numbers (AArch64 Linux numbers where one exists, custom
// compositor services above 200)
const SYS_READ: u64 = 63;
const SYS_WRITE: u64 = 64;
const SYS_EXIT: u64 = 93;
const SYS_GET_TIME: u64 = 169;
const SYS_GETPID: u64 = 172;
const SYS_DRAW_RECT: u64 = 200;
const SYS_FLUSH: u64 = 201;
const SYS_CREATE_WINDOW: u64 = 210;
const SYS_WINDOW_DRAW: u64 = 211;
const SYS_RENDER: u64 = 212;

/// Dispatch a syscall trap. Returns the frame to restore (always the
/// inbound frame; context switches happen on the timer path).
pub fn handle(frame: *mut TrapFrame) -> *mut TrapFrame {
    // Allow preemption and device interrupts while the service runs
    unsafe {
        cpu::irq_enable();
    }

    let f = unsafe { &mut *frame };
    let nr = f.regs[8];
    let args = [
        f.regs[0], f.regs[1], f.regs[2], f.regs[3], f.regs[4], f.regs[5],
    ];

    #[cfg(feature = "syscall-verbose")]
    debug!("syscall {} from pid {}", nr, process::current_pid());

    let ret: isize = match nr {
        SYS_READ => sys_read(args[0] as i32, args[1] as *mut u8, args[2] as usize),
        SYS_WRITE => sys_write(args[0] as i32, args[1] as *const u8, args[2] as usize),
        SYS_EXIT => exit_current_frame(args[0] as i32),
        SYS_GET_TIME => crate::arch::timer::jiffies() as isize,
        SYS_GETPID => process::current_pid() as isize,
        SYS_DRAW_RECT => sys_draw_rect(&args),
        SYS_FLUSH | SYS_RENDER => {
            compositor::render();
            0
        }
        SYS_CREATE_WINDOW => sys_create_window(&args),
        SYS_WINDOW_DRAW => sys_window_draw(&args),
        _ => {
            warn!("unknown syscall {}", nr);
            -1
        }
    };

    f.regs[0] = ret as u64;
    frame
}

/// Terminate the faulting or exiting process. Never returns.
pub fn exit_current(status: i32) -> ! {
    process::scheduler::exit_current(status)
}

fn exit_current_frame(status: i32) -> isize {
    process::scheduler::exit_current(status)
}

/// read(fd, buf, n): console input. Only fd 0 is readable; blocks on
/// WFE until the caller's window has focus and a translated character
/// is available, then delivers exactly one byte.
fn sys_read(fd: i32, buf: *mut u8, n: usize) -> isize {
    if fd != 0 || n == 0 || buf.is_null() {
        return 0;
    }

    let my_pid = process::current_pid();

    loop {
        // Input goes to the focused window's owner only
        if let Some(focus) = compositor::focus_pid() {
            if focus != my_pid {
                cpu::wait_for_event();
                continue;
            }
        }

        if let Some(c) = keyboard::read_char_nonblock() {
            unsafe {
                core::ptr::write_volatile(buf, c);
            }
            return 1;
        }

        // Sleep until the next interrupt (key press or tick)
        cpu::wait_for_event();
    }
}

/// write(fd, buf, n): stdout/stderr of a window owner feed the
/// window's terminal emulator; everything else is copied to the
/// serial log sink.
fn sys_write(fd: i32, buf: *const u8, n: usize) -> isize {
    if buf.is_null() || n == 0 {
        return 0;
    }

    let bytes = unsafe { core::slice::from_raw_parts(buf, n) };

    if fd == 1 || fd == 2 {
        let pid = process::current_pid();
        if let Some(win) = compositor::window_by_pid(pid) {
            compositor::window_write(win, bytes);
            return n as isize;
        }
    }

    crate::uart::write_bytes(bytes);
    n as isize
}

/// draw_rect(x, y, w, h, color): draw into the caller's window, or
/// straight into the raw framebuffer for window-less processes
/// (splash).
fn sys_draw_rect(args: &[u64; 6]) -> isize {
    let (x, y, w, h, color) = (
        args[0] as i32,
        args[1] as i32,
        args[2] as u32,
        args[3] as u32,
        args[4] as u32,
    );

    let pid = process::current_pid();
    match compositor::window_by_pid(pid) {
        Some(win) => {
            let _ = compositor::draw_rect(win, x, y, w, h, color, pid);
        }
        None => {
            let _ = crate::graphics::splash_fill_rect(x.max(0) as u32, y.max(0) as u32, w, h, color);
        }
    }
    0
}

/// create_window(x, y, w, h, title_ptr): create a window owned by the
/// caller; returns the window id.
fn sys_create_window(args: &[u64; 6]) -> isize {
    let (x, y, w, h) = (args[0] as i32, args[1] as i32, args[2] as u32, args[3] as u32);
    let title_ptr = args[4] as *const u8;

    let mut title_buf = [0u8; 64];
    let title = copy_user_cstr(title_ptr, &mut title_buf);

    let pid = process::current_pid();
    match compositor::create_window(x, y, w, h, title, pid) {
        Ok(id) => id as isize,
        Err(e) => e.as_isize(),
    }
}

/// window_draw(win, x, y, w, h, color): draw into an arbitrary window;
/// the compositor enforces ownership. Unauthorised draws are logged
/// and dropped, and the call still returns.
fn sys_window_draw(args: &[u64; 6]) -> isize {
    let (win, x, y, w, h, color) = (
        args[0] as u32,
        args[1] as i32,
        args[2] as i32,
        args[3] as u32,
        args[4] as u32,
        args[5] as u32,
    );

    let pid = process::current_pid();
    let _ = compositor::draw_rect(win, x, y, w, h, color, pid);
    0
}

/// Copy a NUL-terminated string from user memory, truncating at the
/// buffer size. The user address space is live in TTBR0, so the
/// pointer dereferences directly.
fn copy_user_cstr<'a>(ptr: *const u8, buf: &'a mut [u8]) -> &'a str {
    if ptr.is_null() {
        return "";
    }

    let mut len = 0;
    while len < buf.len() - 1 {
        let b = unsafe { core::ptr::read_volatile(ptr.add(len)) };
        if b == 0 {
            break;
        }
        buf[len] = b;
        len += 1;
    }

    core::str::from_utf8(&buf[..len]).unwrap_or("")
}
