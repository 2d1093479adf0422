// Core library utilities for the kernel

// Include AArch64 assembly directly using global_asm! so it is linked
// into the binary for bare-metal targets.
#[cfg(all(target_arch = "aarch64", not(test)))]
core::arch::global_asm!(include_str!("../arch/aarch64/boot.S"));
#[cfg(all(target_arch = "aarch64", not(test)))]
core::arch::global_asm!(include_str!("../arch/aarch64/vectors.S"));

pub mod error;
pub mod panic;
#[macro_use]
pub mod printk;
pub mod ringbuf;
