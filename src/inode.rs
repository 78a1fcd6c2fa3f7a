//! On-disk inode record and the dense inode space backing it.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Mutex;

use log::debug;

use crate::error::{Error, Result};
use crate::layout::{Layout, DIRECT_BLOCKS};

/// Identifies one block within one of the pool's striped storage files.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAddress {
    pub storage_num: u32,
    pub block_num: u32,
}

impl BlockAddress {
    /// Sentinel meaning "no block attached here yet".
    pub const NONE: BlockAddress = BlockAddress {
        storage_num: u32::MAX,
        block_num: u32::MAX,
    };

    pub fn is_none(&self) -> bool {
        self.storage_num == u32::MAX && self.block_num == u32::MAX
    }
}

/// A single inode record, laid out for direct on-disk storage.
///
/// `block[0..8]` are direct pointers, `block[8]` is the single-indirect
/// pointer, `block[9]` is the double-indirect pointer. Not `packed`: the
/// natural alignment is kept so fields can be read without an intermediate
/// byte copy; each record is produced and consumed only by this crate, so
/// there is no external layout to match.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Inode {
    pub is_busy: u8,
    pub is_dir: u8,
    pub byte_size: u64,
    pub blk_size: u64,
    pub block: [BlockAddress; DIRECT_BLOCKS + 2],
}

impl Inode {
    /// A freshly allocated, empty inode of the given kind.
    pub fn empty(is_dir: bool) -> Self {
        Self {
            is_busy: 1,
            is_dir: is_dir as u8,
            byte_size: 0,
            blk_size: 0,
            block: [BlockAddress::NONE; DIRECT_BLOCKS + 2],
        }
    }

    /// The all-zero, unallocated record a freshly formatted inode space is
    /// filled with.
    pub fn free_slot() -> Self {
        Self {
            is_busy: 0,
            is_dir: 0,
            byte_size: 0,
            blk_size: 0,
            block: [BlockAddress::NONE; DIRECT_BLOCKS + 2],
        }
    }

    pub fn is_busy(&self) -> bool {
        self.is_busy != 0
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir != 0
    }
}

const RECORD_SIZE: usize = std::mem::size_of::<Inode>();

fn to_bytes(inode: &Inode) -> [u8; RECORD_SIZE] {
    unsafe { std::mem::transmute_copy(inode) }
}

fn from_bytes(buf: &[u8; RECORD_SIZE]) -> Inode {
    unsafe { std::mem::transmute_copy(buf) }
}

/// Root directory always lives at inode index 0.
pub const ROOT_INODE: u32 = 0;

/// Default depth of the free-inode ring cache.
const CACHE_SIZE: usize = 64;

/// Dense array of [`Inode`] records backed by a single file, with a small
/// free-slot cache to avoid scanning the whole file on every allocation.
pub struct InodeSpace {
    layout: Layout,
    file: Mutex<File>,
    alloc: Mutex<AllocState>,
}

struct AllocState {
    cache: VecDeque<u32>,
    scan_cursor: u32,
}

impl InodeSpace {
    /// Creates `inode_space` at `dir`, zero-filled (every slot free).
    pub fn format(dir: &Path, layout: &Layout) -> Result<()> {
        let path = dir.join("inode_space");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(layout.max_file_amount as u64 * RECORD_SIZE as u64)?;
        Ok(())
    }

    /// Opens an already-formatted inode space.
    pub fn init(dir: &Path, layout: Layout) -> Result<Self> {
        let path = dir.join("inode_space");
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Self {
            layout,
            file: Mutex::new(file),
            alloc: Mutex::new(AllocState {
                cache: VecDeque::new(),
                scan_cursor: ROOT_INODE + 1,
            }),
        })
    }

    fn offset(index: u32) -> u64 {
        index as u64 * RECORD_SIZE as u64
    }

    /// Reads the inode record at `index`.
    pub fn read(&self, index: u32) -> Result<Inode> {
        let mut buf = [0u8; RECORD_SIZE];
        let file = self.file.lock().unwrap();
        file.read_exact_at(&mut buf, Self::offset(index))?;
        Ok(from_bytes(&buf))
    }

    /// Writes the inode record at `index`.
    pub fn write(&self, index: u32, inode: &Inode) -> Result<()> {
        let buf = to_bytes(inode);
        let file = self.file.lock().unwrap();
        file.write_all_at(&buf, Self::offset(index))?;
        Ok(())
    }

    fn refill_cache(&self, alloc: &mut AllocState) -> Result<()> {
        let start = alloc.scan_cursor;
        let total = self.layout.max_file_amount;
        // Non-root indices form a cycle of length `total - 1`; scanning that
        // many times visits each slot exactly once per refill.
        let max_scan = total.saturating_sub(ROOT_INODE + 1);
        let mut scanned = 0u32;
        let mut idx = start;
        while scanned < max_scan && alloc.cache.len() < CACHE_SIZE {
            let inode = self.read(idx)?;
            if !inode.is_busy() {
                alloc.cache.push_back(idx);
            }
            idx = if idx + 1 >= total { ROOT_INODE + 1 } else { idx + 1 };
            scanned += 1;
        }
        alloc.scan_cursor = idx;
        Ok(())
    }

    /// Allocates a free inode index, marking it busy on disk, and returns
    /// it. Returns [`Error::Exhausted`] when no free inode can be found.
    pub fn get(&self) -> Result<u32> {
        let mut alloc = self.alloc.lock().unwrap();
        if alloc.cache.is_empty() {
            self.refill_cache(&mut alloc)?;
        }
        let index = alloc
            .cache
            .pop_front()
            .ok_or(Error::Exhausted("no free inode"))?;
        drop(alloc);
        let mut inode = self.read(index)?;
        inode.is_busy = 1;
        self.write(index, &inode)?;
        debug!("inode {} allocated", index);
        Ok(index)
    }

    /// Frees the inode at `index`, zeroing it on disk.
    pub fn free(&self, index: u32) -> Result<()> {
        self.write(index, &Inode::free_slot())?;
        let mut alloc = self.alloc.lock().unwrap();
        if alloc.cache.len() < CACHE_SIZE {
            alloc.cache.push_back(index);
        }
        debug!("inode {} freed", index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_address_none_roundtrip() {
        assert!(BlockAddress::NONE.is_none());
        let addr = BlockAddress {
            storage_num: 0,
            block_num: 0,
        };
        assert!(!addr.is_none());
    }

    #[test]
    fn inode_roundtrips_through_bytes() {
        let mut inode = Inode::empty(true);
        inode.byte_size = 4096;
        inode.blk_size = 1;
        inode.block[0] = BlockAddress {
            storage_num: 2,
            block_num: 17,
        };
        let bytes = to_bytes(&inode);
        let back = from_bytes(&bytes);
        assert_eq!(back.is_busy(), true);
        assert_eq!(back.is_dir(), true);
        assert_eq!({ back.byte_size }, 4096);
        assert_eq!({ back.blk_size }, 1);
        assert_eq!(back.block[0], inode.block[0]);
    }

    #[test]
    fn format_and_alloc_free(){
        let dir = std::env::temp_dir().join(format!("vfscore_inode_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let layout = Layout {
            max_file_amount: 16,
            ..Layout::default()
        };
        InodeSpace::format(&dir, &layout).unwrap();
        let space = InodeSpace::init(&dir, layout).unwrap();
        let a = space.get().unwrap();
        let b = space.get().unwrap();
        assert_ne!(a, b);
        assert!(a >= ROOT_INODE + 1);
        space.free(a).unwrap();
        let c = space.get().unwrap();
        assert_eq!(a, c);
        std::fs::remove_dir_all(&dir).ok();
    }
}
