//! Tracks currently-open inodes and enforces the writer-exclusive,
//! multi-reader open discipline.

use std::collections::HashMap;

use log::debug;

use crate::block::BlockSpace;
use crate::blockmap;
use crate::error::{Error, Result};
use crate::inode::{Inode, InodeSpace};
use crate::layout::Layout;

/// In-memory state for an inode that is currently open by at least one
/// handle.
pub struct OpenedFile {
    pub inode_index: u32,
    pub refcount: u32,
    pub perm_read: bool,
    pub perm_write: bool,
    pub inode: Inode,
    pub defer_delete: bool,
}

/// Coordinates concurrent opens of the same inode.
#[derive(Default)]
pub struct OpenTable {
    entries: HashMap<u32, OpenedFile>,
}

impl OpenTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Grants or denies an open request for `inode_index`. On success,
    /// returns `true` when this call created a fresh entry (so the caller
    /// should also seed `FileHandle` state for logical block 0).
    pub fn acquire(
        &mut self,
        inode_index: u32,
        want_read: bool,
        want_write: bool,
        inodes: &InodeSpace,
    ) -> Result<()> {
        if let Some(entry) = self.entries.get_mut(&inode_index) {
            if entry.perm_write || want_write {
                return Err(Error::Busy(format!("inode {inode_index} already open")));
            }
            entry.refcount += 1;
            debug!("inode {inode_index} reopened, refcount now {}", entry.refcount);
            return Ok(());
        }
        let inode = inodes.read(inode_index)?;
        self.entries.insert(
            inode_index,
            OpenedFile {
                inode_index,
                refcount: 1,
                perm_read: want_read,
                perm_write: want_write,
                inode,
                defer_delete: false,
            },
        );
        debug!("inode {inode_index} opened (read={want_read}, write={want_write})");
        Ok(())
    }

    pub fn get(&self, inode_index: u32) -> Option<&OpenedFile> {
        self.entries.get(&inode_index)
    }

    pub fn get_mut(&mut self, inode_index: u32) -> Option<&mut OpenedFile> {
        self.entries.get_mut(&inode_index)
    }

    pub fn is_open(&self, inode_index: u32) -> bool {
        self.entries.contains_key(&inode_index)
    }

    /// Marks the entry for `inode_index` to have its blocks freed at last
    /// close, instead of now.
    pub fn mark_defer_delete(&mut self, inode_index: u32) {
        if let Some(entry) = self.entries.get_mut(&inode_index) {
            entry.defer_delete = true;
        }
    }

    /// Drops one reference to `inode_index`. On the last reference, either
    /// flushes the in-memory snapshot back to `InodeSpace`, or — if
    /// deferred delete was requested — releases its blocks and frees the
    /// inode.
    pub fn release(
        &mut self,
        inode_index: u32,
        inodes: &InodeSpace,
        blocks: &BlockSpace,
        layout: &Layout,
    ) -> Result<()> {
        let done = {
            let entry = self
                .entries
                .get_mut(&inode_index)
                .expect("release of an inode with no open entry");
            entry.refcount -= 1;
            entry.refcount == 0
        };
        if !done {
            return Ok(());
        }
        let mut entry = self.entries.remove(&inode_index).unwrap();
        if entry.defer_delete {
            blockmap::release_all(blocks, layout, &mut entry.inode)?;
            inodes.free(inode_index)?;
            debug!("inode {inode_index} deferred-deleted on last close");
        } else {
            inodes.write(inode_index, &entry.inode)?;
            debug!("inode {inode_index} flushed on last close");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Layout;
    use std::path::PathBuf;

    fn setup(tag: &str) -> (InodeSpace, PathBuf, Layout) {
        let dir = std::env::temp_dir().join(format!("vfscore_opentable_test_{tag}_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let layout = Layout {
            max_file_amount: 16,
            ..Layout::default()
        };
        InodeSpace::format(&dir, &layout).unwrap();
        (InodeSpace::init(&dir, layout).unwrap(), dir, layout)
    }

    #[test]
    fn writer_excludes_everyone() {
        let (inodes, dir, _layout) = setup("writer_exclusive");
        let idx = inodes.get().unwrap();
        let mut table = OpenTable::new();
        table.acquire(idx, false, true, &inodes).unwrap();
        assert!(table.acquire(idx, true, false, &inodes).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn multiple_readers_allowed() {
        let (inodes, dir, _layout) = setup("multi_reader");
        let idx = inodes.get().unwrap();
        let mut table = OpenTable::new();
        table.acquire(idx, true, false, &inodes).unwrap();
        table.acquire(idx, true, false, &inodes).unwrap();
        assert_eq!(table.get(idx).unwrap().refcount, 2);
        std::fs::remove_dir_all(&dir).ok();
    }
}
