use std::sync::Mutex;

use log::debug;
use zerocopy::FromZeroes;

use crate::cache::{lock, BlockCache};
use crate::error::{Result, VerFSError};
use crate::fs::VerFS;
use crate::io::BlockStorage;
use crate::node::InodeRecord;
use crate::BITS_PER_BLOCK;

#[derive(Debug, PartialEq)]
pub enum State {
    Free,
    Used,
}

/// Bits are numbered from the most significant bit of each byte, so bit 0 is
/// `0x80` of byte 0.
fn mask(pos: usize) -> u8 {
    0x80 >> (pos % 8)
}

pub fn get(buf: &[u8], pos: usize) -> State {
    if buf[pos / 8] & mask(pos) == 0 {
        State::Free
    } else {
        State::Used
    }
}

pub fn set_reserved(buf: &mut [u8], pos: usize) {
    buf[pos / 8] |= mask(pos);
}

pub fn set_free(buf: &mut [u8], pos: usize) {
    buf[pos / 8] &= !mask(pos);
}

/// Finds the first byte with a clear bit, then the first clear bit inside it.
pub fn find_first_zero_bit(buf: &[u8]) -> Option<usize> {
    let byte = buf.iter().position(|&b| b != 0xFF)?;
    Some(byte * 8 + buf[byte].leading_ones() as usize)
}

/// A contiguous run of bitmap blocks. The lock is held across every
/// scan-then-set so no two allocations can claim the same bit.
pub struct BitmapRegion {
    start: u32,
    blocks: u32,
    lock: Mutex<()>,
}

impl BitmapRegion {
    pub fn new(start: u32, blocks: u32) -> Self {
        Self {
            start,
            blocks,
            lock: Mutex::new(()),
        }
    }

    /// Scans the region one block at a time starting at `hint_block` and wrapping
    /// around, sets the first clear bit and returns its global index.
    pub fn alloc_bit<T: BlockStorage>(&self, cache: &BlockCache<T>, hint_block: u32) -> Result<u32> {
        let _guard = lock(&self.lock);
        let first = hint_block % self.blocks;
        for step in 0..self.blocks {
            let offset = (first + step) % self.blocks;
            let block = cache.get(self.start + offset)?;
            if let Some(bit) = block.read(|b| find_first_zero_bit(&b[..])) {
                block.modify(|b| set_reserved(&mut b[..], bit));
                return Ok(offset * BITS_PER_BLOCK as u32 + bit as u32);
            }
        }
        Err(VerFSError::NoSpace)
    }

    /// Clears a bit. Whether the bit was set is not checked.
    pub fn free_bit<T: BlockStorage>(&self, cache: &BlockCache<T>, bit: u32) -> Result<()> {
        let _guard = lock(&self.lock);
        let (block, local) = self.locate(bit)?;
        cache
            .get(block)?
            .modify(|b| set_free(&mut b[..], local));
        Ok(())
    }

    /// Marks every bit in `from..to` as used.
    pub fn reserve_range<T: BlockStorage>(&self, cache: &BlockCache<T>, from: u32, to: u32) -> Result<()> {
        let _guard = lock(&self.lock);
        let mut bit = from;
        while bit < to {
            let (block, local) = self.locate(bit)?;
            let run = (to - bit).min((BITS_PER_BLOCK - local) as u32);
            cache.get(block)?.modify(|b| {
                for pos in local..local + run as usize {
                    set_reserved(&mut b[..], pos);
                }
            });
            bit += run;
        }
        Ok(())
    }

    /// Counts clear bits among the first `valid` bits of the region.
    pub fn count_free<T: BlockStorage>(&self, cache: &BlockCache<T>, valid: u32) -> Result<u32> {
        let _guard = lock(&self.lock);
        let mut free = 0;
        for offset in 0..self.blocks {
            let base = offset * BITS_PER_BLOCK as u32;
            if base >= valid {
                break;
            }
            let bits = (valid - base).min(BITS_PER_BLOCK as u32) as usize;
            free += cache.get(self.start + offset)?.read(|b| {
                (0..bits)
                    .filter(|&pos| get(&b[..], pos) == State::Free)
                    .count() as u32
            });
        }
        Ok(free)
    }

    fn locate(&self, bit: u32) -> Result<(u32, usize)> {
        let block = bit / BITS_PER_BLOCK as u32;
        if block >= self.blocks {
            return Err(VerFSError::invalid(format!("bit {} is outside the bitmap", bit)));
        }
        Ok((self.start + block, bit as usize % BITS_PER_BLOCK))
    }
}

impl<T: BlockStorage> VerFS<T> {
    /// Allocates a data block and returns it zero filled.
    pub(crate) fn alloc_data_block(&self) -> Result<u32> {
        let hint = {
            let sb = lock(&self.super_block);
            if sb.n_blocks_free == 0 {
                return Err(VerFSError::NoSpace);
            }
            sb.next_free_block / BITS_PER_BLOCK as u32
        };

        let blocknr = self.data_bmp.alloc_bit(&self.cache, hint)?;
        {
            let mut sb = lock(&self.super_block);
            if blocknr >= sb.n_blocks {
                // Bitmap padding is reserved at format time, so this is a damaged image.
                return Err(VerFSError::NoSpace);
            }
            sb.n_blocks_free = sb.n_blocks_free.saturating_sub(1);
            sb.next_free_block = (blocknr + 1) % sb.n_blocks;
            self.store_super_block(&sb)?;
        }

        self.cache.get(blocknr)?.modify(|b| b.fill(0));
        debug!("alloc_data_block: found blknum {}", blocknr);
        Ok(blocknr)
    }

    pub(crate) fn free_data_block(&self, blocknr: u32) -> Result<()> {
        self.data_bmp.free_bit(&self.cache, blocknr)?;
        let mut sb = lock(&self.super_block);
        sb.n_blocks_free = (sb.n_blocks_free + 1).min(sb.n_blocks);
        self.store_super_block(&sb)?;
        debug!("free_data_block: freed blk {}", blocknr);
        Ok(())
    }

    /// Allocates an inode number and zeroes its inode table slot.
    pub(crate) fn alloc_inode(&self) -> Result<u32> {
        let hint = {
            let sb = lock(&self.super_block);
            if sb.n_inodes_free == 0 {
                return Err(VerFSError::NoSpace);
            }
            sb.next_free_inode / BITS_PER_BLOCK as u32
        };

        let inum = self.inode_bmp.alloc_bit(&self.cache, hint)?;
        {
            let mut sb = lock(&self.super_block);
            if inum >= sb.n_inodes {
                return Err(VerFSError::NoSpace);
            }
            sb.n_inodes_free = sb.n_inodes_free.saturating_sub(1);
            sb.next_free_inode = (inum + 1) % sb.n_inodes;
            self.store_super_block(&sb)?;
        }

        self.write_record(inum, &InodeRecord::new_zeroed())?;
        debug!("alloc_inode: found inum {}", inum);
        Ok(inum)
    }

    /// Zeroes the on-disk record and returns the inode number to the bitmap.
    pub(crate) fn free_inode(&self, inum: u32) -> Result<()> {
        self.write_record(inum, &InodeRecord::new_zeroed())?;
        self.inode_bmp.free_bit(&self.cache, inum)?;
        let mut sb = lock(&self.super_block);
        sb.n_inodes_free = (sb.n_inodes_free + 1).min(sb.n_inodes);
        self.store_super_block(&sb)?;
        debug!("free_inode: freed inum {}", inum);
        Ok(())
    }
}
