// Kernel logging (printk) with a bounded ring of recent entries

#![allow(dead_code)]

use super::ringbuf::RingBuffer;
use crate::sync::IrqSpinLock;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Global log level; messages above it are filtered out.
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn get_level() -> LogLevel {
    match LOG_LEVEL.load(Ordering::Relaxed) {
        0 => LogLevel::Error,
        1 => LogLevel::Warn,
        2 => LogLevel::Info,
        _ => LogLevel::Debug,
    }
}

#[inline]
pub fn is_enabled(level: LogLevel) -> bool {
    level <= get_level()
}

/// One retained log line, replayed by the panic handler.
#[derive(Copy, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: [u8; 120],
    pub len: usize,
}

// Taken from both thread and interrupt context, so it masks IRQs
static RECENT: IrqSpinLock<RingBuffer<LogEntry, 64>> = IrqSpinLock::new(RingBuffer::new());

struct UartWriter;

impl Write for UartWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        crate::uart::write_bytes(s.as_bytes());
        Ok(())
    }
}

/// Bounded formatter capturing the head of a message for the recent
/// ring without allocating.
struct EntryWriter {
    buf: [u8; 120],
    len: usize,
}

impl Write for EntryWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.buf.len() - self.len;
        let take = core::cmp::min(room, s.len());
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

pub fn log(level: LogLevel, args: fmt::Arguments) {
    if !is_enabled(level) {
        return;
    }

    let mut console = UartWriter;
    let _ = write!(console, "[{}] {}\n", level.as_str(), args);

    let mut entry = EntryWriter {
        buf: [0; 120],
        len: 0,
    };
    let _ = write!(entry, "{}", args);
    RECENT.lock().push(LogEntry {
        level,
        message: entry.buf,
        len: entry.len,
    });
}

/// Replay retained log lines to the console (panic path).
pub fn dump_recent() {
    let mut recent = RECENT.lock();
    while let Some(entry) = recent.pop() {
        crate::uart::write_bytes(b"  [");
        crate::uart::write_bytes(entry.level.as_str().as_bytes());
        crate::uart::write_bytes(b"] ");
        crate::uart::write_bytes(&entry.message[..entry.len]);
        crate::uart::write_bytes(b"\n");
    }
}

#[macro_export]
macro_rules! printk {
    ($level:expr, $($arg:tt)*) => {
        $crate::lib::printk::log($level, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::printk!($crate::lib::printk::LogLevel::Error, $($arg)*)
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::printk!($crate::lib::printk::LogLevel::Warn, $($arg)*)
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::printk!($crate::lib::printk::LogLevel::Info, $($arg)*)
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::printk!($crate::lib::printk::LogLevel::Debug, $($arg)*)
    };
}
