//! Striped, bitmap-allocated pool of fixed-size blocks spread across
//! several backing storage files.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::debug;
use memmap2::{MmapMut, MmapOptions};

use crate::error::{Error, Result};
use crate::inode::BlockAddress;
use crate::layout::Layout;

/// A pinned, writable view of one block's bytes. Dropping it unpins the
/// view without flushing; call [`BlockSpace::unpin`] to flush explicitly.
pub struct BlockView {
    map: MmapMut,
}

impl BlockView {
    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }
}

struct BitmapState {
    bits: MmapMut,
    free_counts: Vec<u32>,
}

/// Owner of the `storageN` files and the `free_blocks` bitmap.
///
/// The storage files themselves live outside the bitmap mutex: `pin`/`unpin`
/// map and flush a file region without touching `state`, so pins of
/// different blocks (and pins racing `alloc`/`free`) never serialize against
/// each other.
pub struct BlockSpace {
    layout: Layout,
    dir: PathBuf,
    files: Vec<File>,
    state: Mutex<BitmapState>,
}

fn storage_path(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("storage{index}"))
}

fn bitmap_path(dir: &Path) -> PathBuf {
    dir.join("free_blocks")
}

fn bit_index(layout: &Layout, storage_num: u32, block_num: u32) -> u64 {
    storage_num as u64 * layout.storage_size as u64 + block_num as u64
}

fn bit_get(bits: &[u8], index: u64) -> bool {
    let byte = bits[(index / 8) as usize];
    byte & (1 << (index % 8)) != 0
}

fn bit_set(bits: &mut [u8], index: u64, value: bool) {
    let byte = &mut bits[(index / 8) as usize];
    if value {
        *byte |= 1 << (index % 8);
    } else {
        *byte &= !(1 << (index % 8));
    }
}

impl BlockSpace {
    /// Creates every `storageN` file and the `free_blocks` bitmap at `dir`,
    /// all blocks marked free.
    pub fn format(dir: &Path, layout: &Layout) -> Result<()> {
        for i in 0..layout.storage_amount {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(storage_path(dir, i))?;
            file.set_len(layout.storage_size as u64 * layout.block_size)?;
        }
        let bitmap_bytes = (layout.total_blocks() + 7) / 8;
        let bitmap = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(bitmap_path(dir))?;
        bitmap.set_len(bitmap_bytes)?;
        {
            let mut map = unsafe { MmapOptions::new().map_mut(&bitmap)? };
            map.fill(0xFF);
            map.flush()?;
        }
        Ok(())
    }

    /// Opens an already-formatted block pool.
    pub fn init(dir: &Path, layout: Layout) -> Result<Self> {
        let bitmap_file = OpenOptions::new().read(true).write(true).open(bitmap_path(dir))?;
        let bits = unsafe { MmapOptions::new().map_mut(&bitmap_file)? };

        let mut files = Vec::with_capacity(layout.storage_amount as usize);
        let mut free_counts = Vec::with_capacity(layout.storage_amount as usize);
        for i in 0..layout.storage_amount {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(storage_path(dir, i))?;
            let mut free_count = 0u32;
            for block in 0..layout.storage_size {
                if bit_get(&bits, bit_index(&layout, i, block)) {
                    free_count += 1;
                }
            }
            files.push(file);
            free_counts.push(free_count);
        }

        Ok(Self {
            layout,
            dir: dir.to_path_buf(),
            files,
            state: Mutex::new(BitmapState { bits, free_counts }),
        })
    }

    /// Picks the storage with the most free blocks, ties broken by lowest
    /// index, scans it for the first free bit, clears it, and returns the
    /// resulting address.
    pub fn alloc(&self) -> Result<BlockAddress> {
        let mut state = self.state.lock().unwrap();
        let storage_num = state
            .free_counts
            .iter()
            .enumerate()
            .filter(|(_, &count)| count > 0)
            .max_by_key(|(i, &count)| (count, std::cmp::Reverse(*i)))
            .map(|(i, _)| i as u32)
            .ok_or(Error::Exhausted("no free block in any storage"))?;

        let layout = self.layout;
        let block_num = (0..layout.storage_size)
            .find(|&b| bit_get(&state.bits, bit_index(&layout, storage_num, b)))
            .expect("free_count inconsistent with bitmap");

        let idx = bit_index(&layout, storage_num, block_num);
        bit_set(&mut state.bits, idx, false);
        state.free_counts[storage_num as usize] -= 1;
        debug!("block ({storage_num}, {block_num}) allocated");
        Ok(BlockAddress {
            storage_num,
            block_num,
        })
    }

    /// Marks `addr` free again.
    pub fn free(&self, addr: BlockAddress) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let idx = bit_index(&self.layout, addr.storage_num, addr.block_num);
        bit_set(&mut state.bits, idx, true);
        state.free_counts[addr.storage_num as usize] += 1;
        debug!("block ({}, {}) freed", addr.storage_num, addr.block_num);
        Ok(())
    }

    /// Maps a writable view of the block at `addr`. Does not touch the
    /// bitmap mutex: concurrent pins of different blocks, and pins racing
    /// `alloc`/`free`, proceed independently.
    pub fn pin(&self, addr: BlockAddress) -> Result<BlockView> {
        let file = &self.files[addr.storage_num as usize];
        let offset = addr.block_num as u64 * self.layout.block_size;
        let map = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(self.layout.block_size as usize)
                .map_mut(file)?
        };
        Ok(BlockView { map })
    }

    /// Flushes and releases a pinned view.
    pub fn unpin(&self, mut view: BlockView) -> Result<()> {
        view.map.flush()?;
        Ok(())
    }

    /// Total free blocks across every storage, for diagnostics/tests.
    pub fn free_blocks(&self) -> u64 {
        let state = self.state.lock().unwrap();
        state.free_counts.iter().map(|&c| c as u64).sum()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vfscore_block_test_{tag}_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn alloc_free_roundtrip() {
        let dir = temp_dir("allocfree");
        let layout = Layout {
            storage_amount: 2,
            storage_size: 8,
            block_size: 512,
            max_file_amount: 16,
        };
        BlockSpace::format(&dir, &layout).unwrap();
        let space = BlockSpace::init(&dir, layout).unwrap();
        let total = layout.total_blocks();
        assert_eq!(space.free_blocks(), total);
        let addr = space.alloc().unwrap();
        assert_eq!(space.free_blocks(), total - 1);
        space.free(addr).unwrap();
        assert_eq!(space.free_blocks(), total);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn pin_write_persists() {
        let dir = temp_dir("pinwrite");
        let layout = Layout {
            storage_amount: 1,
            storage_size: 4,
            block_size: 512,
            max_file_amount: 16,
        };
        BlockSpace::format(&dir, &layout).unwrap();
        let space = BlockSpace::init(&dir, layout).unwrap();
        let addr = space.alloc().unwrap();
        {
            let mut view = space.pin(addr).unwrap();
            view.as_mut_slice()[0] = 0xAB;
            space.unpin(view).unwrap();
        }
        let view = space.pin(addr).unwrap();
        assert_eq!(view.as_slice()[0], 0xAB);
        std::fs::remove_dir_all(&dir).ok();
    }
}
