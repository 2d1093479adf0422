/// On-disk filesystem layer
///
/// GPT partition discovery plus a read-only, simplified ext4 driver.
/// This is a one-shot loader path: it exists to find and read the
/// executables on the userland partition.

pub mod ext4;
pub mod gpt;
