// Kernel initialization, split into ordered phases

pub mod error;
pub mod phases;

pub use error::{InitError, InitResult};

/// Report a failed boot phase and park the CPU. Nothing can be
/// salvaged this early.
pub fn fail(stage: &str, err: InitError) -> ! {
    error!("{} FAILED: {}", stage, err);
    loop {
        crate::arch::cpu::wait_for_event();
    }
}
