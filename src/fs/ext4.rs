//! Simplified read-only ext4 driver.
//!
//! Enough of ext4 to load executables from the userland partition:
//! superblock + block group 0, inode fetch, random-access reads over
//! direct blocks 0-11 and the single-indirect block 12, and name
//! lookup in the root directory. 4 KiB filesystem blocks only; data
//! block reads go through the buffer cache.

#![allow(dead_code)]

use spin::Mutex;

use crate::drivers::virtio_blk;
use crate::lib::error::{Errno, Result};
use crate::mm::buffer;

pub const EXT4_MAGIC: u16 = 0xEF53;
pub const EXT4_BLOCK_SIZE: usize = 4096;
pub const EXT4_SECTORS_PER_BLOCK: u64 = 8;
pub const EXT4_INODE_SIZE: u32 = 256;
pub const EXT4_ROOT_INO: u32 = 2;

/// Userland filesystem lives on partition index 2.
const USERLAND_PARTITION: usize = 2;

/// Simplified ext4 superblock (the classic 32-bit field set).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
struct Ext4Superblock {
    s_inodes_count: u32,
    s_blocks_count_lo: u32,
    s_r_blocks_count_lo: u32,
    s_free_blocks_count_lo: u32,
    s_free_inodes_count: u32,
    s_first_data_block: u32,
    s_log_block_size: u32,
    s_log_cluster_size: u32,
    s_blocks_per_group: u32,
    s_clusters_per_group: u32,
    s_inodes_per_group: u32,
    s_mtime: u32,
    s_wtime: u32,
    s_mnt_count: u16,
    s_max_mnt_count: u16,
    s_magic: u16,
    s_state: u16,
    s_errors: u16,
    s_minor_rev_level: u16,
    s_lastcheck: u32,
    s_checkinterval: u32,
    s_creator_os: u32,
    s_rev_level: u32,
    s_def_resuid: u16,
    s_def_resgid: u16,
    s_first_ino: u32,
    s_inode_size: u16,
    s_block_group_nr: u16,
    s_feature_compat: u32,
    s_feature_incompat: u32,
    s_feature_ro_compat: u32,
    s_uuid: [u8; 16],
    s_volume_name: [u8; 16],
}

/// Block group descriptor (32-byte layout).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
struct Ext4GroupDesc {
    bg_block_bitmap_lo: u32,
    bg_inode_bitmap_lo: u32,
    bg_inode_table_lo: u32,
    bg_free_blocks_count_lo: u16,
    bg_free_inodes_count_lo: u16,
    bg_used_dirs_count_lo: u16,
    bg_flags: u16,
    padding: [u8; 14],
}

/// On-disk inode.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
struct Ext4Inode {
    i_mode: u16,
    i_uid: u16,
    i_size_lo: u32,
    i_atime: u32,
    i_ctime: u32,
    i_mtime: u32,
    i_dtime: u32,
    i_gid: u16,
    i_links_count: u16,
    i_blocks_lo: u32,
    i_flags: u32,
    i_osd1: u32,
    i_block: [u32; 15],
    i_generation: u32,
    i_file_acl_lo: u32,
    i_size_high: u32,
    i_obso_faddr: u32,
}

/// Directory entry file types
pub const EXT4_FT_REG_FILE: u8 = 1;
pub const EXT4_FT_DIR: u8 = 2;

struct Ext4State {
    /// Partition start; must be 4 KiB aligned for the cache path
    part_start_lba: u64,
    inode_table_block: u64,
}

static STATE: Mutex<Option<Ext4State>> = Mutex::new(None);

/// Mount: locate the userland partition, verify the superblock, latch
/// block group 0's inode table.
pub fn init() -> Result<()> {
    let part = crate::fs::gpt::get_partition(USERLAND_PARTITION).ok_or(Errno::ENODEV)?;
    let part_start_lba = part.start_lba;
    info!("ext4: partition at LBA {}", part_start_lba);

    // Superblock sits at byte offset 1024 (sectors 2..4)
    let mut buf = [0u8; 1024];
    virtio_blk::read_sectors(part_start_lba + 2, &mut buf)?;
    let sb = unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const Ext4Superblock) };

    let magic = sb.s_magic;
    if magic != EXT4_MAGIC {
        error!("ext4: invalid magic {:#x}", magic);
        return Err(Errno::EINVAL);
    }

    let inodes = sb.s_inodes_count;
    let volume = sb.s_volume_name;
    info!(
        "ext4: mounted, vol='{}', {} inodes",
        core::str::from_utf8(&volume)
            .unwrap_or("?")
            .trim_end_matches('\0'),
        inodes
    );

    // Group descriptor table starts at block 1 (byte 4096)
    let mut gdt = [0u8; 512];
    virtio_blk::read_sectors(part_start_lba + 8, &mut gdt)?;
    let bg = unsafe { core::ptr::read_unaligned(gdt.as_ptr() as *const Ext4GroupDesc) };

    let inode_table_block = bg.bg_inode_table_lo as u64;
    info!("ext4: group 0 inode table at block {}", inode_table_block);

    *STATE.lock() = Some(Ext4State {
        part_start_lba,
        inode_table_block,
    });
    Ok(())
}

/// Read one filesystem block, preferring the buffer cache when the
/// partition is block-aligned on disk.
fn read_fs_block(state: &Ext4State, fs_block: u64, buf: &mut [u8; EXT4_BLOCK_SIZE]) -> Result<()> {
    if state.part_start_lba % EXT4_SECTORS_PER_BLOCK == 0 {
        let disk_block = state.part_start_lba / EXT4_SECTORS_PER_BLOCK + fs_block;
        buffer::read_block(disk_block, buf)
    } else {
        virtio_blk::read_sectors(
            state.part_start_lba + fs_block * EXT4_SECTORS_PER_BLOCK,
            buf,
        )
    }
}

/// Fetch an inode structure from the group-0 inode table.
fn get_inode(state: &Ext4State, ino: u32) -> Result<Ext4Inode> {
    if ino == 0 {
        return Err(Errno::EINVAL);
    }

    let byte_offset = state.inode_table_block * EXT4_BLOCK_SIZE as u64
        + ((ino - 1) as u64) * EXT4_INODE_SIZE as u64;
    let fs_block = byte_offset / EXT4_BLOCK_SIZE as u64;
    let in_block = (byte_offset % EXT4_BLOCK_SIZE as u64) as usize;

    let mut block = [0u8; EXT4_BLOCK_SIZE];
    read_fs_block(state, fs_block, &mut block)?;

    Ok(unsafe { core::ptr::read_unaligned(block[in_block..].as_ptr() as *const Ext4Inode) })
}

/// Resolve the physical block for file-relative `block_idx`: direct
/// blocks 0-11, then the single-indirect table behind slot 12. A zero
/// pointer is a sparse hole.
fn resolve_block(state: &Ext4State, inode: &Ext4Inode, block_idx: u32) -> Result<u32> {
    let blocks = inode.i_block;
    if block_idx < 12 {
        return Ok(blocks[block_idx as usize]);
    }

    let indirect_block = blocks[12];
    if indirect_block == 0 {
        return Ok(0);
    }

    let indirect_idx = (block_idx - 12) as usize;
    if indirect_idx >= EXT4_BLOCK_SIZE / 4 {
        warn!("ext4: double-indirect blocks not supported (index {})", block_idx);
        return Err(Errno::EINVAL);
    }

    let mut table = [0u8; EXT4_BLOCK_SIZE];
    read_fs_block(state, indirect_block as u64, &mut table)?;

    let ptr = u32::from_le_bytes([
        table[indirect_idx * 4],
        table[indirect_idx * 4 + 1],
        table[indirect_idx * 4 + 2],
        table[indirect_idx * 4 + 3],
    ]);
    Ok(ptr)
}

/// Random-access read from an inode. Returns the number of bytes read
/// (short at end of file).
pub fn read_inode(ino: u32, offset: u32, buf: &mut [u8]) -> Result<usize> {
    let state = STATE.lock();
    let state = state.as_ref().ok_or(Errno::ENODEV)?;

    let inode = get_inode(state, ino)?;
    let file_size = inode.i_size_lo;

    if offset >= file_size {
        return Ok(0);
    }
    let size = core::cmp::min(buf.len() as u32, file_size - offset) as usize;

    let mut bytes_read = 0usize;
    let mut pos = offset;

    while bytes_read < size {
        let block_idx = pos / EXT4_BLOCK_SIZE as u32;
        let in_block = (pos % EXT4_BLOCK_SIZE as u32) as usize;
        let to_copy = core::cmp::min(EXT4_BLOCK_SIZE - in_block, size - bytes_read);

        let phys_block = resolve_block(state, &inode, block_idx)?;

        let mut block = [0u8; EXT4_BLOCK_SIZE];
        if phys_block != 0 {
            read_fs_block(state, phys_block as u64, &mut block)?;
        }
        // A zero block is a sparse hole and reads as zeros

        buf[bytes_read..bytes_read + to_copy].copy_from_slice(&block[in_block..in_block + to_copy]);

        bytes_read += to_copy;
        pos += to_copy as u32;
    }

    Ok(bytes_read)
}

/// Scan a directory data block for `name`. Returns the inode number.
fn scan_dir_block(data: &[u8], name: &str) -> Option<u32> {
    let target = name.as_bytes();
    let mut offset = 0usize;

    while offset + 8 <= data.len() {
        let inode = u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]);
        let rec_len = u16::from_le_bytes([data[offset + 4], data[offset + 5]]) as usize;
        let name_len = data[offset + 6] as usize;

        if inode == 0 || rec_len < 8 {
            break;
        }

        if name_len == target.len()
            && offset + 8 + name_len <= data.len()
            && &data[offset + 8..offset + 8 + name_len] == target
        {
            return Some(inode);
        }

        offset += rec_len;
    }

    None
}

/// Look up a root-directory entry by path (single component, e.g.
/// "/init").
pub fn find_inode(path: &str) -> Result<u32> {
    let name = path.strip_prefix('/').unwrap_or(path);
    if name.is_empty() {
        return Err(Errno::EINVAL);
    }

    let mut dir = [0u8; EXT4_BLOCK_SIZE];
    let n = read_inode(EXT4_ROOT_INO, 0, &mut dir)?;

    scan_dir_block(&dir[..n], name).ok_or(Errno::ENOENT)
}

/// File size in bytes.
pub fn file_size(ino: u32) -> Result<u32> {
    let state = STATE.lock();
    let state = state.as_ref().ok_or(Errno::ENODEV)?;
    Ok(get_inode(state, ino)?.i_size_lo)
}

/// Read a whole file by path.
pub fn read_file(path: &str, buf: &mut [u8]) -> Result<usize> {
    let ino = find_inode(path)?;
    read_inode(ino, 0, buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_dirent(buf: &mut alloc::vec::Vec<u8>, ino: u32, name: &str, ft: u8) {
        let name_len = name.len();
        let rec_len = ((8 + name_len + 3) & !3) as u16;
        buf.extend_from_slice(&ino.to_le_bytes());
        buf.extend_from_slice(&rec_len.to_le_bytes());
        buf.push(name_len as u8);
        buf.push(ft);
        buf.extend_from_slice(name.as_bytes());
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
    }

    #[test]
    fn directory_scan_finds_entries_by_exact_name() {
        let mut dir = alloc::vec::Vec::new();
        push_dirent(&mut dir, 2, ".", EXT4_FT_DIR);
        push_dirent(&mut dir, 2, "..", EXT4_FT_DIR);
        push_dirent(&mut dir, 12, "init", EXT4_FT_REG_FILE);
        push_dirent(&mut dir, 13, "shell", EXT4_FT_REG_FILE);
        push_dirent(&mut dir, 14, "counter", EXT4_FT_REG_FILE);
        push_dirent(&mut dir, 15, "demo3d", EXT4_FT_REG_FILE);

        assert_eq!(scan_dir_block(&dir, "init"), Some(12));
        assert_eq!(scan_dir_block(&dir, "shell"), Some(13));
        assert_eq!(scan_dir_block(&dir, "demo3d"), Some(15));
        // Prefixes must not match
        assert_eq!(scan_dir_block(&dir, "ini"), None);
        assert_eq!(scan_dir_block(&dir, "shells"), None);
    }

    #[test]
    fn scan_stops_at_terminator() {
        let mut dir = alloc::vec::Vec::new();
        push_dirent(&mut dir, 12, "init", EXT4_FT_REG_FILE);
        // Zero-inode terminator followed by garbage that must not be
        // interpreted
        dir.extend_from_slice(&[0u8; 8]);
        push_dirent(&mut dir, 99, "ghost", EXT4_FT_REG_FILE);

        assert_eq!(scan_dir_block(&dir, "ghost"), None);
    }

    #[test]
    fn superblock_magic_offset_is_56() {
        // The packed layout must place s_magic at byte 56 of the
        // superblock, per the on-disk format.
        assert_eq!(core::mem::offset_of!(Ext4Superblock, s_magic), 56);
        assert_eq!(core::mem::offset_of!(Ext4Inode, i_block), 40);
        assert_eq!(core::mem::size_of::<Ext4GroupDesc>(), 32);
    }
}
