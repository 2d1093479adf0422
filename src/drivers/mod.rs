/// Device drivers
///
/// VirtIO block (disk), GPU (display scanout) and input (pointer +
/// keyboard events), plus the scancode translation layer.

pub mod keyboard;
pub mod virtio_blk;
pub mod virtio_gpu;
pub mod virtio_input;
