//! GPT partition table parser.
//!
//! Minimal parse: header at LBA 1, signature check, scan of the entry
//! array. An entry is in use when its type GUID is non-zero. The disk
//! layout carries three partitions (boot, kernel, userland); index 2
//! is the userland filesystem.

#![allow(dead_code)]

use alloc::vec::Vec;
use spin::Mutex;

use crate::drivers::virtio_blk;
use crate::lib::error::{Errno, Result};

/// "EFI PART"
const GPT_SIGNATURE: u64 = 0x5452_4150_2049_4645;

const SECTOR_SIZE: usize = 512;
const MAX_PARTITIONS: usize = 16;

/// GPT header (LBA 1)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
struct GptHeader {
    signature: u64,
    revision: u32,
    header_size: u32,
    header_crc32: u32,
    reserved1: u32,
    my_lba: u64,
    alternate_lba: u64,
    first_usable_lba: u64,
    last_usable_lba: u64,
    disk_guid: [u8; 16],
    partition_entry_lba: u64,
    num_partition_entries: u32,
    partition_entry_size: u32,
    partition_entry_crc32: u32,
}

/// GPT partition entry
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
struct GptPartitionEntry {
    type_guid: [u8; 16],
    unique_guid: [u8; 16],
    start_lba: u64,
    end_lba: u64,
    attributes: u64,
    partition_name: [u16; 36], // UTF-16LE
}

/// In-memory partition info
#[derive(Debug, Clone, Copy)]
pub struct Partition {
    pub index: usize,
    pub start_lba: u64,
    pub end_lba: u64,
    pub size_sectors: u64,
    pub type_guid: [u8; 16],
}

static PARTITIONS: Mutex<Vec<Partition>> = Mutex::new(Vec::new());

/// Parse the header sector. Returns (entries LBA, entry size, count).
fn parse_header(sector: &[u8]) -> Result<(u64, usize, usize)> {
    if sector.len() < core::mem::size_of::<GptHeader>() {
        return Err(Errno::EINVAL);
    }

    let header = unsafe { core::ptr::read_unaligned(sector.as_ptr() as *const GptHeader) };
    if header.signature != GPT_SIGNATURE {
        return Err(Errno::EINVAL);
    }

    Ok((
        header.partition_entry_lba,
        header.partition_entry_size as usize,
        header.num_partition_entries as usize,
    ))
}

/// Scan the entry array, collecting in-use entries.
fn parse_entries(data: &[u8], entry_size: usize, num_entries: usize) -> Vec<Partition> {
    let mut partitions = Vec::new();

    let fit = data.len() / entry_size;
    for i in 0..num_entries.min(fit).min(32) {
        let entry = unsafe {
            core::ptr::read_unaligned(data[i * entry_size..].as_ptr() as *const GptPartitionEntry)
        };

        if entry.type_guid.iter().all(|&b| b == 0) {
            continue;
        }
        if partitions.len() >= MAX_PARTITIONS {
            break;
        }

        let start_lba = entry.start_lba;
        let end_lba = entry.end_lba;
        partitions.push(Partition {
            index: partitions.len(),
            start_lba,
            end_lba,
            size_sectors: end_lba - start_lba + 1,
            type_guid: entry.type_guid,
        });
    }

    partitions
}

/// Read and parse the partition table from the block device.
pub fn init() -> Result<()> {
    let mut sector = [0u8; SECTOR_SIZE];
    virtio_blk::read_sectors(1, &mut sector)?;

    let (entries_lba, entry_size, num_entries) = parse_header(&sector)?;
    info!(
        "GPT: valid signature, {} entries @ LBA {}",
        num_entries, entries_lba
    );

    // One page of entries covers 32 at the standard 128-byte size
    let mut entries = [0u8; 4096];
    virtio_blk::read_sectors(entries_lba, &mut entries)?;

    let partitions = parse_entries(&entries, entry_size, num_entries);
    for p in &partitions {
        info!(
            "GPT: partition {}: start={} size={} sectors",
            p.index, p.start_lba, p.size_sectors
        );
    }
    info!("GPT: found {} partitions", partitions.len());

    *PARTITIONS.lock() = partitions;
    Ok(())
}

/// Look up a partition by index.
pub fn get_partition(index: usize) -> Option<Partition> {
    PARTITIONS.lock().get(index).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_header(entries_lba: u64, entry_size: u32, count: u32) -> [u8; 512] {
        let mut sector = [0u8; 512];
        sector[0..8].copy_from_slice(&GPT_SIGNATURE.to_le_bytes());
        sector[72..80].copy_from_slice(&entries_lba.to_le_bytes());
        sector[80..84].copy_from_slice(&count.to_le_bytes());
        sector[84..88].copy_from_slice(&entry_size.to_le_bytes());
        sector
    }

    fn build_entry(buf: &mut [u8], type_byte: u8, start: u64, end: u64) {
        buf[0] = type_byte;
        buf[32..40].copy_from_slice(&start.to_le_bytes());
        buf[40..48].copy_from_slice(&end.to_le_bytes());
    }

    #[test]
    fn header_parse_extracts_entry_geometry() {
        let sector = build_header(2, 128, 8);
        let (lba, size, count) = parse_header(&sector).unwrap();
        assert_eq!(lba, 2);
        assert_eq!(size, 128);
        assert_eq!(count, 8);
    }

    #[test]
    fn bad_signature_is_rejected() {
        let sector = [0u8; 512];
        assert!(parse_header(&sector).is_err());
    }

    #[test]
    fn unused_entries_are_skipped() {
        let mut data = [0u8; 4096];
        // Three used entries (boot, kernel, userland) at slots 0,1,2;
        // slot 3 left zeroed
        build_entry(&mut data[0..128], 0xEF, 2048, 4095);
        build_entry(&mut data[128..256], 0x83, 4096, 8191);
        build_entry(&mut data[256..384], 0x83, 8192, 65535);

        let parts = parse_entries(&data, 128, 8);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].index, 2);
        assert_eq!(parts[2].start_lba, 8192);
        assert_eq!(parts[2].size_sectors, 65536 - 8192);
    }
}
