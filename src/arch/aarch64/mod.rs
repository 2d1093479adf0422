// AArch64 architecture-specific code

pub mod cpu;
pub mod gic;
pub mod timer;
pub mod trap;

pub use trap::TrapFrame;
