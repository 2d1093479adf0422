// Kernel error handling and errno definitions

#![allow(dead_code)]

/// Internal kernel error kinds. Coarse on purpose: the kernel only
/// distinguishes bad arguments, exhaustion, device errors and fatal
/// faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    OutOfMemory,
    InvalidArgument,
    PermissionDenied,
    NotFound,
    IoError,
    NotSupported,
    BadAddress,
    ResourceExhausted,
    NotInitialized,
}

/// Linux-style errno values surfaced to user space as negative returns.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    EPERM = 1,   // Operation not permitted
    ENOENT = 2,  // No such file or directory
    ESRCH = 3,   // No such process
    EIO = 5,     // I/O error
    ENOMEM = 12, // Out of memory
    EACCES = 13, // Permission denied
    EFAULT = 14, // Bad address
    ENODEV = 19, // No such device
    EINVAL = 22, // Invalid argument
    ENOSPC = 28, // No space left on device
    ENOSYS = 38, // Function not implemented
}

impl Errno {
    pub fn as_isize(self) -> isize {
        -(self as i32 as isize)
    }

    pub fn description(self) -> &'static str {
        match self {
            Errno::EPERM => "Operation not permitted",
            Errno::ENOENT => "No such file or directory",
            Errno::ESRCH => "No such process",
            Errno::EIO => "I/O error",
            Errno::ENOMEM => "Out of memory",
            Errno::EACCES => "Permission denied",
            Errno::EFAULT => "Bad address",
            Errno::ENODEV => "No such device",
            Errno::EINVAL => "Invalid argument",
            Errno::ENOSPC => "No space left on device",
            Errno::ENOSYS => "Function not implemented",
        }
    }
}

impl From<KernelError> for Errno {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::OutOfMemory => Errno::ENOMEM,
            KernelError::InvalidArgument => Errno::EINVAL,
            KernelError::PermissionDenied => Errno::EACCES,
            KernelError::NotFound => Errno::ENOENT,
            KernelError::IoError => Errno::EIO,
            KernelError::NotSupported => Errno::ENOSYS,
            KernelError::BadAddress => Errno::EFAULT,
            KernelError::ResourceExhausted => Errno::ENOSPC,
            KernelError::NotInitialized => Errno::ENODEV,
        }
    }
}

pub type Result<T> = core::result::Result<T, Errno>;
