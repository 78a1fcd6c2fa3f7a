//! Byte-cursor view over an open file: `read`/`write`/`seek`/`close`.

use log::debug;

use crate::block::{BlockSpace, BlockView};
use crate::blockmap;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::open_table::OpenedFile;

/// Seek origin, mirroring `lseek`'s `whence` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// Per-open byte cursor. Holds the currently pinned data block.
pub struct FileHandle {
    pub inode_index: u32,
    cursor_block: u64,
    cursor_offset: u64,
    current: Option<BlockView>,
}

impl FileHandle {
    /// Opens a cursor at offset 0 for `inode_index`. If `truncate` is set,
    /// releases all existing blocks first and starts from an empty file.
    pub fn open(
        blocks: &BlockSpace,
        layout: &Layout,
        inode_index: u32,
        entry: &mut OpenedFile,
        truncate: bool,
    ) -> Result<Self> {
        if truncate {
            blockmap::release_all(blocks, layout, &mut entry.inode)?;
        }
        if entry.inode.blk_size == 0 {
            blockmap::append(blocks, layout, &mut entry.inode)?;
        }
        let addr = blockmap::get(blocks, layout, &entry.inode, 0)?;
        let view = blocks.pin(addr)?;
        Ok(Self {
            inode_index,
            cursor_block: 0,
            cursor_offset: 0,
            current: Some(view),
        })
    }

    fn position(&self, layout: &Layout) -> u64 {
        self.cursor_block * layout.block_size + self.cursor_offset
    }

    fn goto_block(&mut self, blocks: &BlockSpace, layout: &Layout, entry: &OpenedFile, block_idx: u64) -> Result<()> {
        if block_idx == self.cursor_block && self.current.is_some() {
            return Ok(());
        }
        if let Some(view) = self.current.take() {
            blocks.unpin(view)?;
        }
        let addr = blockmap::get(blocks, layout, &entry.inode, block_idx)?;
        self.current = Some(blocks.pin(addr)?);
        self.cursor_block = block_idx;
        Ok(())
    }

    /// Reads up to `buf.len()` bytes starting at the cursor. Returns the
    /// number of bytes actually read (0 at EOF).
    pub fn read(&mut self, blocks: &BlockSpace, layout: &Layout, entry: &OpenedFile, buf: &mut [u8]) -> Result<usize> {
        if !entry.perm_read {
            return Err(Error::BadMode("handle is not open for reading".to_string()));
        }
        let remaining_in_file = entry.inode.byte_size.saturating_sub(self.position(layout));
        let to_read = (buf.len() as u64).min(remaining_in_file) as usize;
        let mut done = 0;
        while done < to_read {
            let block_size = layout.block_size as usize;
            let available = block_size - self.cursor_offset as usize;
            let chunk = (to_read - done).min(available);
            let view = self.current.as_ref().expect("current block always pinned while open");
            let start = self.cursor_offset as usize;
            buf[done..done + chunk].copy_from_slice(&view.as_slice()[start..start + chunk]);
            done += chunk;
            self.cursor_offset += chunk as u64;
            if self.cursor_offset == block_size as u64 {
                let next_block = self.cursor_block + 1;
                if next_block < entry.inode.blk_size {
                    self.goto_block(blocks, layout, entry, next_block)?;
                    self.cursor_offset = 0;
                }
                // Otherwise this is the last block: leave the cursor
                // parked at its end, the next call will see no bytes
                // remaining and return immediately.
            }
        }
        Ok(done)
    }

    /// Writes `buf` at the cursor, growing the file and allocating new
    /// blocks as needed. Returns the number of bytes written.
    pub fn write(&mut self, blocks: &BlockSpace, layout: &Layout, entry: &mut OpenedFile, buf: &[u8]) -> Result<usize> {
        if !entry.perm_write {
            return Err(Error::BadMode("handle is not open for writing".to_string()));
        }
        let block_size = layout.block_size as usize;
        let mut done = 0;
        while done < buf.len() {
            let available = block_size - self.cursor_offset as usize;
            let chunk = (buf.len() - done).min(available);
            {
                let view = self.current.as_mut().expect("current block always pinned while open");
                let start = self.cursor_offset as usize;
                view.as_mut_slice()[start..start + chunk].copy_from_slice(&buf[done..done + chunk]);
            }
            done += chunk;
            self.cursor_offset += chunk as u64;
            let pos = self.position(layout);
            if pos > entry.inode.byte_size {
                entry.inode.byte_size = pos;
            }
            if self.cursor_offset == block_size as u64 {
                let next_block = self.cursor_block + 1;
                if next_block >= entry.inode.blk_size {
                    if let Some(view) = self.current.take() {
                        blocks.unpin(view)?;
                    }
                    let addr = blockmap::append(blocks, layout, &mut entry.inode)?;
                    self.current = Some(blocks.pin(addr)?);
                    self.cursor_block = next_block;
                } else {
                    self.goto_block(blocks, layout, entry, next_block)?;
                }
                self.cursor_offset = 0;
            }
        }
        debug!("inode {} wrote {} bytes", self.inode_index, done);
        Ok(done)
    }

    /// Repositions the cursor. `seek_end` lands on the file's last valid
    /// byte (`byte_size - 1`), not one past it, matching this
    /// implementation's documented, historical behavior.
    pub fn seek(&mut self, blocks: &BlockSpace, layout: &Layout, entry: &OpenedFile, offset: i64, whence: Whence) -> Result<u64> {
        let base: i64 = match whence {
            Whence::Set => 0,
            Whence::Cur => self.position(layout) as i64,
            Whence::End => entry.inode.byte_size as i64 - 1,
        };
        let mut target = base + offset;
        let max = entry.inode.byte_size.saturating_sub(1) as i64;
        if target < 0 {
            target = 0;
        }
        if target > max {
            target = max.max(0);
        }
        let target = target as u64;
        let block_size = layout.block_size;
        let new_block = target / block_size;
        self.goto_block(blocks, layout, entry, new_block)?;
        self.cursor_offset = target % block_size;
        Ok(target)
    }

    /// Releases the pinned block view. Does not touch the open table.
    pub fn close(mut self, blocks: &BlockSpace) -> Result<()> {
        if let Some(view) = self.current.take() {
            blocks.unpin(view)?;
        }
        Ok(())
    }
}
