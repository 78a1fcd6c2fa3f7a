//! Translates a logical block index within an inode to a physical
//! [`BlockAddress`] through the direct / single-indirect / double-indirect
//! pointer chain, and extends or releases an inode's blocks.

use crate::block::BlockSpace;
use crate::error::{Error, Result};
use crate::inode::{BlockAddress, Inode};
use crate::layout::{Layout, DIRECT_BLOCKS};

fn read_indirect(blocks: &BlockSpace, addr: BlockAddress, slot: u64) -> Result<BlockAddress> {
    let view = blocks.pin(addr)?;
    let bytes = view.as_slice();
    let offset = slot as usize * std::mem::size_of::<BlockAddress>();
    let mut buf = [0u8; std::mem::size_of::<BlockAddress>()];
    let len = buf.len();
    buf.copy_from_slice(&bytes[offset..offset + len]);
    let result = unsafe { std::mem::transmute_copy::<_, BlockAddress>(&buf) };
    blocks.unpin(view)?;
    Ok(result)
}

fn write_indirect(blocks: &BlockSpace, addr: BlockAddress, slot: u64, value: BlockAddress) -> Result<()> {
    let mut view = blocks.pin(addr)?;
    let offset = slot as usize * std::mem::size_of::<BlockAddress>();
    let buf: [u8; std::mem::size_of::<BlockAddress>()] = unsafe { std::mem::transmute_copy(&value) };
    view.as_mut_slice()[offset..offset + buf.len()].copy_from_slice(&buf);
    blocks.unpin(view)
}

fn zero_block(blocks: &BlockSpace, addr: BlockAddress) -> Result<()> {
    let mut view = blocks.pin(addr)?;
    view.as_mut_slice().fill(0);
    blocks.unpin(view)
}

/// Looks up the address of logical block `n` of `inode`. `n` must be
/// `< inode.blk_size`.
pub fn get(blocks: &BlockSpace, layout: &Layout, inode: &Inode, n: u64) -> Result<BlockAddress> {
    if n < DIRECT_BLOCKS as u64 {
        return Ok(inode.block[n as usize]);
    }
    let a = layout.addrs_per_block();
    if n < DIRECT_BLOCKS as u64 + a {
        let single = inode.block[DIRECT_BLOCKS];
        return read_indirect(blocks, single, n - DIRECT_BLOCKS as u64);
    }
    let n2 = n - DIRECT_BLOCKS as u64 - a;
    let double = inode.block[DIRECT_BLOCKS + 1];
    let single = read_indirect(blocks, double, n2 / a)?;
    read_indirect(blocks, single, n2 % a)
}

/// Allocates a new data block and attaches it as the next logical block of
/// `inode` (at index `inode.blk_size`), lazily allocating any indirection
/// levels the transition requires. Returns the new block's address.
pub fn append(blocks: &BlockSpace, layout: &Layout, inode: &mut Inode) -> Result<BlockAddress> {
    let n = inode.blk_size;
    if n >= layout.max_blocks() {
        return Err(Error::Exhausted("inode has reached its maximum size"));
    }

    let data = blocks.alloc()?;
    zero_block(blocks, data)?;

    if n < DIRECT_BLOCKS as u64 {
        inode.block[n as usize] = data;
        inode.blk_size += 1;
        return Ok(data);
    }

    let a = layout.addrs_per_block();
    if n < DIRECT_BLOCKS as u64 + a {
        if inode.block[DIRECT_BLOCKS].is_none() {
            let single = blocks.alloc()?;
            zero_block(blocks, single)?;
            inode.block[DIRECT_BLOCKS] = single;
        }
        let single = inode.block[DIRECT_BLOCKS];
        write_indirect(blocks, single, n - DIRECT_BLOCKS as u64, data)?;
        inode.blk_size += 1;
        return Ok(data);
    }

    if inode.block[DIRECT_BLOCKS + 1].is_none() {
        let double = blocks.alloc()?;
        zero_block(blocks, double)?;
        inode.block[DIRECT_BLOCKS + 1] = double;
    }
    let double = inode.block[DIRECT_BLOCKS + 1];
    let n2 = n - DIRECT_BLOCKS as u64 - a;
    let lev1_idx = n2 / a;
    let lev2_idx = n2 % a;

    let mut single = read_indirect(blocks, double, lev1_idx)?;
    if single.is_none() {
        single = blocks.alloc()?;
        zero_block(blocks, single)?;
        write_indirect(blocks, double, lev1_idx, single)?;
    }
    write_indirect(blocks, single, lev2_idx, data)?;
    inode.blk_size += 1;
    Ok(data)
}

/// Frees every data and indirection block owned by `inode` and resets its
/// size fields to zero.
pub fn release_all(blocks: &BlockSpace, layout: &Layout, inode: &mut Inode) -> Result<()> {
    let n = inode.blk_size;
    let a = layout.addrs_per_block();

    let direct_count = n.min(DIRECT_BLOCKS as u64);
    for i in 0..direct_count {
        blocks.free(inode.block[i as usize])?;
        inode.block[i as usize] = BlockAddress::NONE;
    }

    if n > DIRECT_BLOCKS as u64 {
        let single = inode.block[DIRECT_BLOCKS];
        if !single.is_none() {
            let single_count = (n - DIRECT_BLOCKS as u64).min(a);
            for i in 0..single_count {
                let data = read_indirect(blocks, single, i)?;
                if !data.is_none() {
                    blocks.free(data)?;
                }
            }
            blocks.free(single)?;
            inode.block[DIRECT_BLOCKS] = BlockAddress::NONE;
        }
    }

    if n > DIRECT_BLOCKS as u64 + a {
        let double = inode.block[DIRECT_BLOCKS + 1];
        if !double.is_none() {
            let remaining = n - DIRECT_BLOCKS as u64 - a;
            let lev1_count = (remaining + a - 1) / a;
            for l1 in 0..lev1_count {
                let single = read_indirect(blocks, double, l1)?;
                if single.is_none() {
                    continue;
                }
                let lev2_count = if l1 + 1 == lev1_count {
                    remaining - l1 * a
                } else {
                    a
                };
                for l2 in 0..lev2_count {
                    let data = read_indirect(blocks, single, l2)?;
                    if !data.is_none() {
                        blocks.free(data)?;
                    }
                }
                blocks.free(single)?;
            }
            blocks.free(double)?;
            inode.block[DIRECT_BLOCKS + 1] = BlockAddress::NONE;
        }
    }

    inode.byte_size = 0;
    inode.blk_size = 0;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::Inode;
    use std::path::PathBuf;

    fn temp_blocks(tag: &str, layout: Layout) -> (BlockSpace, PathBuf) {
        let dir = std::env::temp_dir().join(format!("vfscore_blockmap_test_{tag}_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        BlockSpace::format(&dir, &layout).unwrap();
        (BlockSpace::init(&dir, layout).unwrap(), dir)
    }

    #[test]
    fn appends_direct_then_indirect() {
        let layout = Layout {
            storage_amount: 1,
            storage_size: 4096,
            block_size: 512,
            max_file_amount: 16,
        };
        let (blocks, dir) = temp_blocks("direct_indirect", layout);
        let mut inode = Inode::empty(false);
        let a = layout.addrs_per_block();
        for i in 0..(DIRECT_BLOCKS as u64 + a + 1) {
            let addr = append(&blocks, &layout, &mut inode).unwrap();
            let fetched = get(&blocks, &layout, &inode, i).unwrap();
            assert_eq!(addr, fetched);
        }
        assert_eq!(inode.blk_size, DIRECT_BLOCKS as u64 + a + 1);
        release_all(&blocks, &layout, &mut inode).unwrap();
        assert_eq!(inode.blk_size, 0);
        assert_eq!(blocks.free_blocks(), layout.total_blocks());
        std::fs::remove_dir_all(&dir).ok();
    }
}
