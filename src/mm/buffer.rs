//! Block buffer cache.
//!
//! A hash table keyed by 4 KiB block number fronting an LRU list. At
//! most one entry exists per block; dirty entries are written back on
//! an explicit sync. Eviction policy is LRU-from-tail among
//! zero-refcount entries (not exercised at current sizes).

#![allow(dead_code)]

use alloc::vec;
use alloc::vec::Vec;

use crate::lib::error::{Errno, Result};
use crate::sync::IrqSpinLock;

/// Cache block size and its disk footprint.
pub const BLOCK_SIZE: usize = 4096;
pub const SECTORS_PER_BLOCK: u64 = (BLOCK_SIZE / 512) as u64;

const HASH_BUCKETS: usize = 64;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct BufferFlags: u8 {
        /// Contents match (or supersede) the disk
        const UPTODATE = 1 << 0;
        /// Modified; must be written back on sync
        const DIRTY = 1 << 1;
    }
}

struct BufferEntry {
    block: u64,
    flags: BufferFlags,
    refcount: u32,
    data: Vec<u8>,
}

/// The device a cache instance reads and writes through. The kernel
/// wires this to virtio-blk; tests substitute an in-memory disk.
pub trait BlockBackend: Sync {
    fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> Result<()>;
    fn write_sectors(&self, sector: u64, buf: &[u8]) -> Result<()>;
}

struct CacheState {
    entries: Vec<BufferEntry>,
    /// Hash chains of indices into `entries`
    buckets: [Vec<usize>; HASH_BUCKETS],
    /// LRU order, most recent first (indices into `entries`)
    lru: Vec<usize>,
}

impl CacheState {
    const fn new() -> Self {
        Self {
            entries: Vec::new(),
            buckets: [const { Vec::new() }; HASH_BUCKETS],
            lru: Vec::new(),
        }
    }

    #[inline]
    fn bucket_of(block: u64) -> usize {
        (block % HASH_BUCKETS as u64) as usize
    }

    fn lookup(&self, block: u64) -> Option<usize> {
        self.buckets[Self::bucket_of(block)]
            .iter()
            .copied()
            .find(|&idx| self.entries[idx].block == block)
    }

    fn promote(&mut self, idx: usize) {
        if let Some(pos) = self.lru.iter().position(|&i| i == idx) {
            self.lru.remove(pos);
        }
        self.lru.insert(0, idx);
    }

    fn insert(&mut self, entry: BufferEntry) -> usize {
        let idx = self.entries.len();
        let bucket = Self::bucket_of(entry.block);
        self.entries.push(entry);
        self.buckets[bucket].push(idx);
        self.lru.insert(0, idx);
        idx
    }
}

pub struct BufferCache<B: BlockBackend> {
    backend: B,
    state: IrqSpinLock<CacheState>,
}

impl<B: BlockBackend> BufferCache<B> {
    pub const fn new(backend: B) -> Self {
        Self {
            backend,
            state: IrqSpinLock::new(CacheState::new()),
        }
    }

    /// Look up `block`, reading it from disk on a miss, and pass the
    /// cached data to `f`. The entry is pinned (refcount held) for the
    /// duration and promoted on the LRU.
    pub fn with_block<R>(&self, block: u64, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let idx = self.get(block)?;

        let result = {
            let mut state = self.state.lock();
            f(&mut state.entries[idx].data)
        };

        self.put(idx);
        Ok(result)
    }

    /// Copy a whole cached block into `buf`.
    pub fn read_block(&self, block: u64, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        self.with_block(block, |data| buf.copy_from_slice(data))
    }

    /// Overwrite a cached block and mark it dirty. The disk copy is
    /// updated on the next `sync`.
    pub fn write_block(&self, block: u64, buf: &[u8; BLOCK_SIZE]) -> Result<()> {
        let idx = self.get(block)?;
        {
            let mut state = self.state.lock();
            let entry = &mut state.entries[idx];
            entry.data.copy_from_slice(buf);
            entry.flags |= BufferFlags::DIRTY;
        }
        self.put(idx);
        Ok(())
    }

    /// Pin an entry, filling it from disk on a miss.
    fn get(&self, block: u64) -> Result<usize> {
        if let Some(idx) = {
            let mut state = self.state.lock();
            let found = state.lookup(block);
            if let Some(idx) = found {
                state.entries[idx].refcount += 1;
                state.promote(idx);
            }
            found
        } {
            return Ok(idx);
        }

        // Miss: read outside the lock, then insert. A racing insert of
        // the same block is resolved in favour of the existing entry.
        let mut data = vec![0u8; BLOCK_SIZE];
        self.backend
            .read_sectors(block * SECTORS_PER_BLOCK, &mut data)?;

        let mut state = self.state.lock();
        if let Some(idx) = state.lookup(block) {
            state.entries[idx].refcount += 1;
            state.promote(idx);
            return Ok(idx);
        }

        let idx = state.insert(BufferEntry {
            block,
            flags: BufferFlags::UPTODATE,
            refcount: 1,
            data,
        });
        Ok(idx)
    }

    /// Unpin an entry.
    fn put(&self, idx: usize) {
        let mut state = self.state.lock();
        let entry = &mut state.entries[idx];
        if entry.refcount > 0 {
            entry.refcount -= 1;
        }
    }

    /// Write all dirty entries back, walking the LRU.
    pub fn sync(&self) -> Result<()> {
        // Snapshot dirty blocks under the lock, write outside it.
        let dirty: Vec<(usize, u64, Vec<u8>)> = {
            let state = self.state.lock();
            state
                .lru
                .iter()
                .filter(|&&idx| state.entries[idx].flags.contains(BufferFlags::DIRTY))
                .map(|&idx| {
                    let e = &state.entries[idx];
                    (idx, e.block, e.data.clone())
                })
                .collect()
        };

        for (idx, block, data) in dirty {
            self.backend
                .write_sectors(block * SECTORS_PER_BLOCK, &data)?;
            let mut state = self.state.lock();
            state.entries[idx].flags.remove(BufferFlags::DIRTY);
        }

        Ok(())
    }

    /// Number of resident entries (diagnostics).
    pub fn entry_count(&self) -> usize {
        self.state.lock().entries.len()
    }
}

/// Backend wiring the global cache to the virtio block device.
pub struct VirtioBackend;

impl BlockBackend for VirtioBackend {
    fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        crate::drivers::virtio_blk::read_sectors(sector, buf)
    }

    fn write_sectors(&self, sector: u64, buf: &[u8]) -> Result<()> {
        crate::drivers::virtio_blk::write_sectors(sector, buf)
    }
}

static CACHE: BufferCache<VirtioBackend> = BufferCache::new(VirtioBackend);

pub fn init() {
    info!("BufferCache: initialized ({} hash buckets)", HASH_BUCKETS);
}

/// Read a 4 KiB block through the global cache.
pub fn read_block(block: u64, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
    CACHE.read_block(block, buf)
}

/// Access a cached block in place.
pub fn with_block<R>(block: u64, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
    CACHE.with_block(block, f)
}

/// Flush dirty blocks to disk.
pub fn sync() -> Result<()> {
    CACHE.sync()
}

#[cfg(test)]
mod tests {
    use super::*;
    use spin::Mutex;

    /// In-memory disk with a read counter, mirroring the mock block
    /// devices the driver tests use.
    struct MemDisk {
        sectors: Mutex<Vec<u8>>,
        reads: Mutex<usize>,
    }

    impl MemDisk {
        fn new(nblocks: usize) -> Self {
            let mut data = vec![0u8; nblocks * BLOCK_SIZE];
            // Stamp each sector with its number so reads are distinguishable
            for (i, chunk) in data.chunks_mut(512).enumerate() {
                chunk[0] = i as u8;
                chunk[1] = (i >> 8) as u8;
            }
            Self {
                sectors: Mutex::new(data),
                reads: Mutex::new(0),
            }
        }
    }

    impl BlockBackend for MemDisk {
        fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
            *self.reads.lock() += 1;
            let data = self.sectors.lock();
            let off = sector as usize * 512;
            buf.copy_from_slice(&data[off..off + buf.len()]);
            Ok(())
        }

        fn write_sectors(&self, sector: u64, buf: &[u8]) -> Result<()> {
            let mut data = self.sectors.lock();
            let off = sector as usize * 512;
            data[off..off + buf.len()].copy_from_slice(buf);
            Ok(())
        }
    }

    #[test]
    fn hit_does_not_reread_disk() {
        let cache = BufferCache::new(MemDisk::new(16));

        let mut a = [0u8; BLOCK_SIZE];
        let mut b = [0u8; BLOCK_SIZE];
        cache.read_block(3, &mut a).unwrap();
        cache.read_block(3, &mut b).unwrap();

        assert_eq!(a, b);
        assert_eq!(*cache.backend.reads.lock(), 1);
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn one_entry_per_block_number() {
        let cache = BufferCache::new(MemDisk::new(16));

        let mut buf = [0u8; BLOCK_SIZE];
        for _ in 0..4 {
            cache.read_block(7, &mut buf).unwrap();
        }
        cache.read_block(8, &mut buf).unwrap();

        assert_eq!(cache.entry_count(), 2);
    }

    #[test]
    fn distinct_blocks_read_distinct_payloads() {
        let cache = BufferCache::new(MemDisk::new(16));

        let mut blk0 = [0u8; BLOCK_SIZE];
        let mut blk1 = [0u8; BLOCK_SIZE];
        cache.read_block(0, &mut blk0).unwrap();
        cache.read_block(1, &mut blk1).unwrap();

        assert_ne!(blk0, blk1);
        // First sector of block 1 is absolute sector 8
        assert_eq!(blk1[0], 8);
    }

    #[test]
    fn sync_writes_back_dirty_entries_once() {
        let cache = BufferCache::new(MemDisk::new(16));

        let mut buf = [0xABu8; BLOCK_SIZE];
        cache.write_block(5, &buf).unwrap();
        cache.sync().unwrap();

        // The disk now carries the new contents
        buf.fill(0);
        cache.backend.read_sectors(5 * SECTORS_PER_BLOCK, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xAB));

        // A second sync has nothing to write: contents unchanged
        cache.sync().unwrap();
        let mut reread = [0u8; BLOCK_SIZE];
        cache.read_block(5, &mut reread).unwrap();
        assert!(reread.iter().all(|&b| b == 0xAB));
    }
}
