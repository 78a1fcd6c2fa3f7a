//! Top-level orchestration: mount/format/unmount and the public
//! open/read/write/seek/close/create/remove/rename API.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::info;

use crate::block::BlockSpace;
use crate::error::{Error, Result};
use crate::handle::{FileHandle, Whence};
use crate::inode::{Inode, InodeSpace, ROOT_INODE};
use crate::layout::Layout;
use crate::namespace;
use crate::open_table::OpenTable;

/// Parsed `open` mode string: a short vocabulary of single characters.
/// `r` = read, `w` = write, `c` = create if missing, `t` = truncate,
/// `a` = append. `a` is recognized but has no behavioral effect of its
/// own (truncation and positioning are controlled explicitly by `t` and
/// `seek`); it exists so mode strings from the historical tool family
/// parse without error.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModeFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
    pub append: bool,
}

impl ModeFlags {
    pub fn parse(mode: &str) -> Result<Self> {
        let mut flags = ModeFlags::default();
        for c in mode.chars() {
            match c {
                'r' => flags.read = true,
                'w' => flags.write = true,
                'c' => flags.create = true,
                't' => flags.truncate = true,
                'a' => flags.append = true,
                other => return Err(Error::BadMode(format!("unknown mode character '{other}'"))),
            }
        }
        if !flags.read && !flags.write {
            return Err(Error::BadMode("mode must request read or write".to_string()));
        }
        if flags.truncate && !flags.write {
            return Err(Error::BadMode("truncate requires write".to_string()));
        }
        Ok(flags)
    }
}

/// A handle returned by [`Vfs::open`]: pairs a byte cursor with the inode
/// it targets.
pub struct Handle {
    inode_index: u32,
    cursor: FileHandle,
}

/// A mounted virtual file system instance.
pub struct Vfs {
    dir: PathBuf,
    layout: Layout,
    blocks: BlockSpace,
    inodes: InodeSpace,
    open_table: Mutex<OpenTable>,
}

impl Vfs {
    /// Formats a fresh volume at `dir` using the default [`Layout`].
    pub fn format(dir: &Path) -> Result<()> {
        Self::format_with_layout(dir, &Layout::default())
    }

    /// Formats a fresh volume at `dir` using a caller-supplied [`Layout`].
    pub fn format_with_layout(dir: &Path, layout: &Layout) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        BlockSpace::format(dir, layout)?;
        InodeSpace::format(dir, layout)?;
        info!("formatted volume at {}", dir.display());
        Ok(())
    }

    /// Opens an already-formatted volume, creating the root directory's
    /// first data block if this is the very first mount after formatting.
    pub fn mount(dir: &Path, layout: Layout) -> Result<Self> {
        let blocks = BlockSpace::init(dir, layout)?;
        let inodes = InodeSpace::init(dir, layout)?;

        let root = inodes.read(ROOT_INODE)?;
        if !root.is_busy() {
            let mut root = Inode::empty(true);
            crate::blockmap::append(&blocks, &layout, &mut root)?;
            inodes.write(ROOT_INODE, &root)?;
            info!("initialized root directory");
        }

        info!("mounted volume at {}", dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
            layout,
            blocks,
            inodes,
            open_table: Mutex::new(OpenTable::new()),
        })
    }

    /// Formats and mounts in one step, a convenience for tests and the CLI.
    pub fn mount_fresh(dir: &Path, layout: Layout) -> Result<Self> {
        Self::format_with_layout(dir, &layout)?;
        Self::mount(dir, layout)
    }

    pub fn unmount(self) -> Result<()> {
        info!("unmounted volume at {}", self.dir.display());
        Ok(())
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn free_blocks(&self) -> u64 {
        self.blocks.free_blocks()
    }

    /// Opens `path` under `mode`, creating it (as a regular file) first if
    /// `c` was requested and it doesn't exist.
    pub fn open(&self, path: &str, mode: &str) -> Result<Handle> {
        let flags = ModeFlags::parse(mode)?;
        let index = if flags.create {
            match namespace::resolve(&self.inodes, &self.blocks, &self.layout, path, false, false) {
                Ok(index) => index,
                Err(Error::NotFound(_)) => namespace::create(&self.inodes, &self.blocks, &self.layout, path, false)?,
                Err(e) => return Err(e),
            }
        } else {
            namespace::resolve(&self.inodes, &self.blocks, &self.layout, path, false, false)?
        };

        let inode = self.inodes.read(index)?;
        if inode.is_dir() {
            return Err(Error::IsADirectory(path.to_string()));
        }

        let mut table = self.open_table.lock().unwrap();
        table.acquire(index, flags.read, flags.write, &self.inodes)?;
        let entry = table.get_mut(index).unwrap();
        let cursor = FileHandle::open(&self.blocks, &self.layout, index, entry, flags.truncate)?;
        drop(table);

        info!("opened {path} (mode={mode})");
        Ok(Handle {
            inode_index: index,
            cursor,
        })
    }

    pub fn read(&self, handle: &mut Handle, buf: &mut [u8]) -> Result<usize> {
        let table = self.open_table.lock().unwrap();
        let entry = table.get(handle.inode_index).expect("handle outlived its open entry");
        handle.cursor.read(&self.blocks, &self.layout, entry, buf)
    }

    pub fn write(&self, handle: &mut Handle, buf: &[u8]) -> Result<usize> {
        let mut table = self.open_table.lock().unwrap();
        let entry = table.get_mut(handle.inode_index).expect("handle outlived its open entry");
        handle.cursor.write(&self.blocks, &self.layout, entry, buf)
    }

    pub fn seek(&self, handle: &mut Handle, offset: i64, whence: Whence) -> Result<u64> {
        let table = self.open_table.lock().unwrap();
        let entry = table.get(handle.inode_index).expect("handle outlived its open entry");
        handle.cursor.seek(&self.blocks, &self.layout, entry, offset, whence)
    }

    pub fn close(&self, handle: Handle) -> Result<()> {
        let inode_index = handle.inode_index;
        handle.cursor.close(&self.blocks)?;
        let mut table = self.open_table.lock().unwrap();
        table.release(inode_index, &self.inodes, &self.blocks, &self.layout)?;
        info!("closed inode {inode_index}");
        Ok(())
    }

    pub fn create(&self, path: &str, is_dir: bool) -> Result<()> {
        namespace::create(&self.inodes, &self.blocks, &self.layout, path, is_dir)?;
        Ok(())
    }

    pub fn remove(&self, path: &str, recursive: bool) -> Result<()> {
        let mut table = self.open_table.lock().unwrap();
        namespace::remove(&self.inodes, &self.blocks, &self.layout, &mut table, path, recursive)
    }

    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        namespace::rename(&self.inodes, &self.blocks, &self.layout, old, new)
    }

    /// Lists the names of a directory's entries. Used by the CLI front
    /// end; not part of the byte-I/O path.
    pub fn list(&self, path: &str) -> Result<Vec<String>> {
        let index = namespace::resolve(&self.inodes, &self.blocks, &self.layout, path, false, false)?;
        let inode = self.inodes.read(index)?;
        if !inode.is_dir() {
            return Err(Error::NotADirectory(path.to_string()));
        }
        let records = crate::dirent::enumerate(&self.blocks, &self.layout, &inode)?;
        Ok(records.iter().map(|r| r.name_str().to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("vfscore_vfs_test_{tag}_{}", std::process::id()))
    }

    #[test]
    fn write_then_read_roundtrip() {
        let dir = temp_dir("roundtrip");
        let layout = Layout {
            storage_amount: 2,
            storage_size: 256,
            block_size: 256,
            max_file_amount: 64,
        };
        let vfs = Vfs::mount_fresh(&dir, layout).unwrap();

        let mut handle = vfs.open("/a", "wc").unwrap();
        let written = vfs.write(&mut handle, b"hello").unwrap();
        assert_eq!(written, 5);
        vfs.close(handle).unwrap();

        let mut handle = vfs.open("/a", "r").unwrap();
        let mut buf = [0u8; 16];
        let read = vfs.read(&mut handle, &mut buf).unwrap();
        assert_eq!(read, 5);
        assert_eq!(&buf[..5], b"hello");
        vfs.close(handle).unwrap();

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn writer_excludes_reader_until_closed() {
        let dir = temp_dir("writer_excludes");
        let layout = Layout {
            storage_amount: 1,
            storage_size: 64,
            block_size: 256,
            max_file_amount: 16,
        };
        let vfs = Vfs::mount_fresh(&dir, layout).unwrap();
        let writer = vfs.open("/home_file", "wc").unwrap();
        assert!(vfs.open("/home_file", "r").is_err());
        vfs.close(writer).unwrap();
        let reader = vfs.open("/home_file", "r").unwrap();
        vfs.close(reader).unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn seek_end_of_empty_file_is_zero() {
        let dir = temp_dir("seek_empty");
        let layout = Layout {
            storage_amount: 1,
            storage_size: 64,
            block_size: 256,
            max_file_amount: 16,
        };
        let vfs = Vfs::mount_fresh(&dir, layout).unwrap();
        let mut handle = vfs.open("/empty", "wc").unwrap();
        let pos = vfs.seek(&mut handle, 0, Whence::End).unwrap();
        assert_eq!(pos, 0);
        vfs.close(handle).unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn nested_path_creates_intermediate_directories() {
        let dir = temp_dir("nested");
        let layout = Layout {
            storage_amount: 1,
            storage_size: 128,
            block_size: 256,
            max_file_amount: 32,
        };
        let vfs = Vfs::mount_fresh(&dir, layout).unwrap();
        let handle = vfs.open("/x/y/z/w", "wc").unwrap();
        vfs.close(handle).unwrap();

        assert_eq!(vfs.list("/").unwrap(), vec!["x".to_string()]);
        assert_eq!(vfs.list("/x").unwrap(), vec!["y".to_string()]);
        assert_eq!(vfs.list("/x/y").unwrap(), vec!["z".to_string()]);

        let h = vfs.open("/x/y/z/w", "r").unwrap();
        vfs.close(h).unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn rename_moves_subtree_pointer() {
        let dir = temp_dir("rename");
        let layout = Layout {
            storage_amount: 1,
            storage_size: 128,
            block_size: 256,
            max_file_amount: 32,
        };
        let vfs = Vfs::mount_fresh(&dir, layout).unwrap();
        let h = vfs.open("/usr/bin/test", "wc").unwrap();
        vfs.close(h).unwrap();
        vfs.rename("/usr", "/user").unwrap();
        assert!(vfs.open("/usr/bin/test", "r").is_err());
        let h = vfs.open("/user/bin/test", "r").unwrap();
        vfs.close(h).unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }
}
