// Boot-phase error types

#![allow(dead_code)]

/// Kernel initialization errors with phase context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// Early bootstrap failed (MMU, PMM, heap, UART)
    Early(&'static str),

    /// Memory subsystem initialization failed
    Memory(&'static str),

    /// Driver initialization failed (block, GPU, input)
    Driver(&'static str),

    /// Subsystem initialization failed (filesystem, compositor)
    Subsystem(&'static str),

    /// Late initialization failed (GIC, timer, processes)
    Late(&'static str),

    /// Booted at the wrong exception level
    InvalidExceptionLevel(u8),
}

impl core::fmt::Display for InitError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Early(msg) => write!(f, "early init failed: {}", msg),
            Self::Memory(msg) => write!(f, "memory init failed: {}", msg),
            Self::Driver(msg) => write!(f, "driver init failed: {}", msg),
            Self::Subsystem(msg) => write!(f, "subsystem init failed: {}", msg),
            Self::Late(msg) => write!(f, "late init failed: {}", msg),
            Self::InvalidExceptionLevel(el) => write!(f, "invalid exception level: EL{}", el),
        }
    }
}

pub type InitResult<T> = core::result::Result<T, InitError>;
