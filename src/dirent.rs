//! Directory contents: a dense array of fixed-width [`DirRecord`]s stored
//! in a directory inode's data blocks, with tombstone recycling.

use crate::block::BlockSpace;
use crate::blockmap;
use crate::error::Result;
use crate::inode::Inode;
use crate::layout::{Layout, NAME_BYTES};

/// One directory entry: a name and the inode it points at. A leading NUL
/// byte in `name` marks the slot as empty (free or tombstoned).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DirRecord {
    pub name: [u8; NAME_BYTES],
    pub inode_index: u32,
}

const RECORD_SIZE: usize = std::mem::size_of::<DirRecord>();

impl DirRecord {
    pub fn empty() -> Self {
        Self {
            name: [0u8; NAME_BYTES],
            inode_index: 0,
        }
    }

    pub fn new(name: &str, inode_index: u32) -> Self {
        let mut bytes = [0u8; NAME_BYTES];
        let src = name.as_bytes();
        bytes[..src.len()].copy_from_slice(src);
        Self {
            name: bytes,
            inode_index,
        }
    }

    pub fn is_free(&self) -> bool {
        self.name[0] == 0
    }

    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        unsafe { std::mem::transmute_copy(self) }
    }

    fn from_bytes(buf: &[u8; RECORD_SIZE]) -> Self {
        unsafe { std::mem::transmute_copy(buf) }
    }
}

fn read_record(blocks: &BlockSpace, layout: &Layout, inode: &Inode, slot: u64) -> Result<DirRecord> {
    let per_block = layout.records_per_block();
    let block_idx = slot / per_block;
    let offset = (slot % per_block) as usize * RECORD_SIZE;
    let addr = blockmap::get(blocks, layout, inode, block_idx)?;
    let view = blocks.pin(addr)?;
    let mut buf = [0u8; RECORD_SIZE];
    buf.copy_from_slice(&view.as_slice()[offset..offset + RECORD_SIZE]);
    blocks.unpin(view)?;
    Ok(DirRecord::from_bytes(&buf))
}

fn write_record(blocks: &BlockSpace, layout: &Layout, inode: &Inode, slot: u64, record: &DirRecord) -> Result<()> {
    let per_block = layout.records_per_block();
    let block_idx = slot / per_block;
    let offset = (slot % per_block) as usize * RECORD_SIZE;
    let addr = blockmap::get(blocks, layout, inode, block_idx)?;
    let mut view = blocks.pin(addr)?;
    view.as_mut_slice()[offset..offset + RECORD_SIZE].copy_from_slice(&record.to_bytes());
    blocks.unpin(view)
}

fn slot_count(layout: &Layout, inode: &Inode) -> u64 {
    inode.blk_size * layout.records_per_block()
}

/// Every currently-named record in `inode`'s directory contents.
pub fn enumerate(blocks: &BlockSpace, layout: &Layout, inode: &Inode) -> Result<Vec<DirRecord>> {
    let mut out = Vec::new();
    for slot in 0..slot_count(layout, inode) {
        let record = read_record(blocks, layout, inode, slot)?;
        if !record.is_free() {
            out.push(record);
        }
    }
    Ok(out)
}

/// Finds the record named `name`, if any.
pub fn find(blocks: &BlockSpace, layout: &Layout, inode: &Inode, name: &str) -> Result<Option<u32>> {
    for slot in 0..slot_count(layout, inode) {
        let record = read_record(blocks, layout, inode, slot)?;
        if !record.is_free() && record.name_str() == name {
            return Ok(Some(record.inode_index));
        }
    }
    Ok(None)
}

/// Inserts a new record, reusing the first tombstoned slot found, or
/// appending a new one (allocating a new data block if necessary).
pub fn insert(blocks: &BlockSpace, layout: &Layout, inode: &mut Inode, name: &str, child_index: u32) -> Result<()> {
    let record = DirRecord::new(name, child_index);
    let total = slot_count(layout, inode);
    for slot in 0..total {
        let existing = read_record(blocks, layout, inode, slot)?;
        if existing.is_free() {
            write_record(blocks, layout, inode, slot, &record)?;
            let byte_offset = (slot + 1) * RECORD_SIZE as u64;
            if byte_offset > inode.byte_size {
                inode.byte_size = byte_offset;
            }
            return Ok(());
        }
    }
    // No tombstone available: append a fresh block and write at its first slot.
    blockmap::append(blocks, layout, inode)?;
    write_record(blocks, layout, inode, total, &record)?;
    inode.byte_size = (total + 1) * RECORD_SIZE as u64;
    Ok(())
}

/// Tombstones the record named `name`. Returns `true` if a record was
/// found and removed.
pub fn remove(blocks: &BlockSpace, layout: &Layout, inode: &mut Inode, name: &str) -> Result<bool> {
    for slot in 0..slot_count(layout, inode) {
        let existing = read_record(blocks, layout, inode, slot)?;
        if !existing.is_free() && existing.name_str() == name {
            write_record(blocks, layout, inode, slot, &DirRecord::empty())?;
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_blocks(tag: &str, layout: Layout) -> (BlockSpace, PathBuf) {
        let dir = std::env::temp_dir().join(format!("vfscore_dirent_test_{tag}_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        BlockSpace::format(&dir, &layout).unwrap();
        (BlockSpace::init(&dir, layout).unwrap(), dir)
    }

    #[test]
    fn insert_find_remove_reuses_tombstone() {
        let layout = Layout {
            storage_amount: 1,
            storage_size: 64,
            block_size: 256,
            max_file_amount: 16,
        };
        let (blocks, dir) = temp_blocks("tombstone", layout);
        let mut root = Inode::empty(true);
        blockmap::append(&blocks, &layout, &mut root).unwrap();

        insert(&blocks, &layout, &mut root, "a", 5).unwrap();
        insert(&blocks, &layout, &mut root, "b", 6).unwrap();
        assert_eq!(find(&blocks, &layout, &root, "a").unwrap(), Some(5));

        assert!(remove(&blocks, &layout, &mut root, "a").unwrap());
        assert_eq!(find(&blocks, &layout, &root, "a").unwrap(), None);

        let byte_size_before = root.byte_size;
        insert(&blocks, &layout, &mut root, "c", 7).unwrap();
        assert_eq!(root.byte_size, byte_size_before);
        assert_eq!(find(&blocks, &layout, &root, "c").unwrap(), Some(7));

        let names: Vec<_> = enumerate(&blocks, &layout, &root)
            .unwrap()
            .iter()
            .map(|r| r.name_str().to_string())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"b".to_string()));
        assert!(names.contains(&"c".to_string()));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn overflow_allocates_second_block() {
        let layout = Layout {
            storage_amount: 1,
            storage_size: 256,
            block_size: 256,
            max_file_amount: 16,
        };
        let per_block = layout.records_per_block();
        let (blocks, dir) = temp_blocks("overflow", layout);
        let mut root = Inode::empty(true);
        blockmap::append(&blocks, &layout, &mut root).unwrap();
        for i in 0..per_block {
            insert(&blocks, &layout, &mut root, &format!("f{i}"), i as u32 + 1).unwrap();
        }
        assert_eq!(root.blk_size, 1);
        insert(&blocks, &layout, &mut root, "overflow", 999).unwrap();
        assert_eq!(root.blk_size, 2);
        assert_eq!(find(&blocks, &layout, &root, "overflow").unwrap(), Some(999));
        std::fs::remove_dir_all(&dir).ok();
    }
}
