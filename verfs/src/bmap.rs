//! Logical to physical block translation through the inode block map.
//!
//! Slots `0..12` of an inode map file blocks directly. Slots 12, 13 and 14 point
//! at a single, double and triple indirect block. Every indirect block holds
//! 1024 native endian `u32` block numbers, and a zero slot is unmapped.

use log::debug;

use crate::cache::Block;
use crate::error::{Result, VerFSError};
use crate::fs::VerFS;
use crate::io::BlockStorage;
use crate::node::Inode;
use crate::BLOCK_SIZE;

pub const DIRECT_BLOCKS: usize = 12;
pub const PTRS_PER_BLOCK: usize = BLOCK_SIZE / 4;
pub const MAX_INDIRECT_LEVEL: usize = 3;

/// Number of logical blocks mapped by `level` of the map.
fn level_capacity(level: usize) -> u64 {
    if level == 0 {
        DIRECT_BLOCKS as u64
    } else {
        (PTRS_PER_BLOCK as u64).pow(level as u32)
    }
}

/// Number of logical blocks under one slot of an indirect block with `depth`
/// indirect levels below it.
fn span(depth: usize) -> u64 {
    (PTRS_PER_BLOCK as u64).pow(depth as u32)
}

/// Finds the map level owning a logical block and the index inside that level.
fn locate(logical: u32) -> Result<(usize, u64)> {
    let mut residual = logical as u64;
    for level in 0..=MAX_INDIRECT_LEVEL {
        let capacity = level_capacity(level);
        if residual < capacity {
            return Ok((level, residual));
        }
        residual -= capacity;
    }
    Err(VerFSError::invalid(format!(
        "logical block {} is beyond the block map",
        logical
    )))
}

fn slot(block: &Block, idx: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&block[idx * 4..idx * 4 + 4]);
    u32::from_ne_bytes(raw)
}

fn set_slot(block: &mut Block, idx: usize, value: u32) {
    block[idx * 4..idx * 4 + 4].copy_from_slice(&value.to_ne_bytes());
}

impl<T: BlockStorage> VerFS<T> {
    /// Returns the physical block backing `logical`, or 0 when it is unmapped.
    /// A missing indirect block anywhere on the way down also reads as 0.
    pub(crate) fn logical_to_physical(&self, inode: &Inode, logical: u32) -> Result<u32> {
        let (level, mut residual) = locate(logical)?;
        if level == 0 {
            return Ok(inode.disk.blocks[residual as usize]);
        }

        let mut blocknr = inode.disk.blocks[DIRECT_BLOCKS + level - 1];
        for depth in (0..level).rev() {
            if blocknr == 0 {
                return Ok(0);
            }
            let idx = (residual / span(depth)) as usize;
            residual %= span(depth);
            blocknr = self.cache.get(blocknr)?.read(|b| slot(b, idx));
        }
        Ok(blocknr)
    }

    /// Points `logical` at `physical`, allocating indirect blocks on the way
    /// down. The inode record is not persisted here, callers write it back.
    pub(crate) fn update_block_map(&self, inode: &mut Inode, logical: u32, physical: u32) -> Result<()> {
        let (level, mut residual) = locate(logical)?;
        if level == 0 {
            inode.disk.blocks[residual as usize] = physical;
            return Ok(());
        }

        let top = DIRECT_BLOCKS + level - 1;
        if inode.disk.blocks[top] == 0 {
            inode.disk.blocks[top] = self.alloc_data_block()?;
            debug!(
                "update_block_map: inum {} new level {} indirect block {}",
                inode.inum, level, inode.disk.blocks[top]
            );
        }

        let mut blocknr = inode.disk.blocks[top];
        for depth in (0..level).rev() {
            let idx = (residual / span(depth)) as usize;
            residual %= span(depth);

            if depth == 0 {
                self.cache
                    .get(blocknr)?
                    .modify(|b| set_slot(b, idx, physical));
                return Ok(());
            }

            let mut next = self.cache.get(blocknr)?.read(|b| slot(b, idx));
            if next == 0 {
                next = self.alloc_data_block()?;
                self.cache.get(blocknr)?.modify(|b| set_slot(b, idx, next));
            }
            blocknr = next;
        }
        Ok(())
    }

    /// Frees every data and indirect block reachable from the inode's block map
    /// and clears the map. Returns the number of blocks released.
    pub(crate) fn free_block_tree(&self, inode: &mut Inode) -> Result<u32> {
        let mut freed = 0;
        for idx in 0..DIRECT_BLOCKS {
            let blocknr = inode.disk.blocks[idx];
            if blocknr != 0 {
                self.free_data_block(blocknr)?;
                inode.disk.blocks[idx] = 0;
                freed += 1;
            }
        }
        for level in 1..=MAX_INDIRECT_LEVEL {
            let idx = DIRECT_BLOCKS + level - 1;
            let blocknr = inode.disk.blocks[idx];
            if blocknr != 0 {
                freed += self.free_indirect(blocknr, level - 1)?;
                inode.disk.blocks[idx] = 0;
            }
        }
        Ok(freed)
    }

    /// Frees every data block at logical index `keep` or above, along with
    /// indirect blocks left with nothing under them. Returns the number of
    /// blocks released.
    pub(crate) fn free_block_tail(&self, inode: &mut Inode, keep: u32) -> Result<u32> {
        let keep = keep as u64;
        let mut freed = 0;
        for idx in (keep as usize).min(DIRECT_BLOCKS)..DIRECT_BLOCKS {
            let blocknr = inode.disk.blocks[idx];
            if blocknr != 0 {
                self.free_data_block(blocknr)?;
                inode.disk.blocks[idx] = 0;
                freed += 1;
            }
        }

        let mut base = DIRECT_BLOCKS as u64;
        for level in 1..=MAX_INDIRECT_LEVEL {
            let top = DIRECT_BLOCKS + level - 1;
            let blocknr = inode.disk.blocks[top];
            if blocknr != 0 && keep < base + level_capacity(level) {
                let first = keep.saturating_sub(base);
                if first == 0 {
                    freed += self.free_indirect(blocknr, level - 1)?;
                    inode.disk.blocks[top] = 0;
                } else {
                    freed += self.trim_indirect(blocknr, level - 1, first)?;
                }
            }
            base += level_capacity(level);
        }
        debug!(
            "free_block_tail: inum {} from block {} freed {}",
            inode.inum, keep, freed
        );
        Ok(freed)
    }

    /// Frees the part of an indirect subtree at or past index `first`, which is
    /// relative to the subtree and non-zero, so the block itself stays.
    fn trim_indirect(&self, blocknr: u32, depth: usize, first: u64) -> Result<u32> {
        let start = (first / span(depth)) as usize;
        let rem = first % span(depth);
        let children: Vec<(usize, u32)> = self.cache.get(blocknr)?.read(|b| {
            (start..PTRS_PER_BLOCK)
                .map(|idx| (idx, slot(b, idx)))
                .filter(|&(_, n)| n != 0)
                .collect()
        });

        let mut freed = 0;
        for (idx, child) in children {
            if idx == start && rem != 0 {
                // Only reachable with depth > 0, a leaf slot spans one block.
                freed += self.trim_indirect(child, depth - 1, rem)?;
                continue;
            }
            if depth == 0 {
                self.free_data_block(child)?;
                freed += 1;
            } else {
                freed += self.free_indirect(child, depth - 1)?;
            }
            self.cache.get(blocknr)?.modify(|b| set_slot(b, idx, 0));
        }
        Ok(freed)
    }

    /// Frees an indirect block and everything below it. `depth` is the number of
    /// indirect levels still under this block, so recursion stops at 0.
    fn free_indirect(&self, blocknr: u32, depth: usize) -> Result<u32> {
        let children: Vec<u32> = self.cache.get(blocknr)?.read(|b| {
            (0..PTRS_PER_BLOCK)
                .map(|idx| slot(b, idx))
                .filter(|&n| n != 0)
                .collect()
        });

        let mut freed = 0;
        for child in children {
            if depth == 0 {
                self.free_data_block(child)?;
                freed += 1;
            } else {
                freed += self.free_indirect(child, depth - 1)?;
            }
        }
        self.free_data_block(blocknr)?;
        Ok(freed + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testutil::test_fs;
    use crate::node::{Inode, InodeKind};

    #[test]
    fn locate_crosses_level_boundaries() {
        assert_eq!(locate(11).unwrap(), (0, 11));
        assert_eq!(locate(12).unwrap(), (1, 0));
        assert_eq!(locate(1035).unwrap(), (1, 1023));
        assert_eq!(locate(1036).unwrap(), (2, 0));
        assert_eq!(locate(1_049_612).unwrap(), (3, 0));
        assert!(locate(u32::MAX).is_err());
    }

    #[test]
    fn mapping_round_trips_across_levels() {
        let fs = test_fs(256);
        let mut inode = Inode::new(2, InodeKind::File);

        for (logical, physical) in [(0, 100), (11, 111), (12, 112), (1035, 135), (1036, 136), (5000, 150)] {
            fs.update_block_map(&mut inode, logical, physical).unwrap();
            assert_eq!(fs.logical_to_physical(&inode, logical).unwrap(), physical);
        }
        // Earlier mappings survive later indirect allocations.
        assert_eq!(fs.logical_to_physical(&inode, 0).unwrap(), 100);
        assert_eq!(fs.logical_to_physical(&inode, 12).unwrap(), 112);
        assert_eq!(fs.logical_to_physical(&inode, 1035).unwrap(), 135);
        assert_ne!(inode.disk.blocks[DIRECT_BLOCKS], 0);
        assert_ne!(inode.disk.blocks[DIRECT_BLOCKS + 1], 0);
    }

    #[test]
    fn triple_indirect_mapping_round_trips() {
        let fs = test_fs(256);
        let mut inode = Inode::new(2, InodeKind::File);
        let before = fs.stats().free_blocks;

        fs.update_block_map(&mut inode, 1_049_612, 77).unwrap();
        fs.update_block_map(&mut inode, 1_049_612 + 1024 * 1024 + 5, 78).unwrap();
        assert_eq!(fs.logical_to_physical(&inode, 1_049_612).unwrap(), 77);
        assert_eq!(fs.logical_to_physical(&inode, 1_049_612 + 1024 * 1024 + 5).unwrap(), 78);
        // One triple, two double and two single indirect blocks.
        assert_eq!(fs.stats().free_blocks, before - 5);
    }

    #[test]
    fn unmapped_blocks_read_as_zero() {
        let fs = test_fs(256);
        let mut inode = Inode::new(2, InodeKind::File);
        assert_eq!(fs.logical_to_physical(&inode, 3).unwrap(), 0);
        assert_eq!(fs.logical_to_physical(&inode, 2000).unwrap(), 0);

        fs.update_block_map(&mut inode, 1036, 99).unwrap();
        // Same double indirect block, different single indirect slot.
        assert_eq!(fs.logical_to_physical(&inode, 1036 + 1024).unwrap(), 0);
        // Same single indirect block, different slot.
        assert_eq!(fs.logical_to_physical(&inode, 1037).unwrap(), 0);
    }

    #[test]
    fn freeing_the_tree_returns_every_block() {
        let fs = test_fs(256);
        let mut inode = Inode::new(2, InodeKind::File);
        let before = fs.stats().free_blocks;

        for logical in [0, 5, 12, 40, 1036, 3000] {
            let blocknr = fs.alloc_data_block().unwrap();
            fs.update_block_map(&mut inode, logical, blocknr).unwrap();
        }
        // Six data blocks, one single indirect, one double with two singles below it.
        assert_eq!(fs.stats().free_blocks, before - 10);

        assert_eq!(fs.free_block_tree(&mut inode).unwrap(), 10);
        assert_eq!(fs.stats().free_blocks, before);
        assert!(inode.disk.blocks.iter().all(|&b| b == 0));
        fs.check().unwrap();
    }

    #[test]
    fn freeing_the_tail_keeps_the_prefix() {
        let fs = test_fs(256);
        let mut inode = Inode::new(2, InodeKind::File);
        let deep = 1036 + 1024;
        for logical in [0, 11, 12, 20, 1036, deep + 5, deep + 9] {
            let blocknr = fs.alloc_data_block().unwrap();
            fs.update_block_map(&mut inode, logical, blocknr).unwrap();
        }

        // Leaf 9 under the second level-2 child goes, leaf 5 stays.
        assert_eq!(fs.free_block_tail(&mut inode, deep + 7).unwrap(), 1);
        assert_ne!(fs.logical_to_physical(&inode, deep + 5).unwrap(), 0);
        assert_eq!(fs.logical_to_physical(&inode, deep + 9).unwrap(), 0);

        // Logical 20 plus the whole level-2 tree: 1036's leaf, its indirect
        // block, deep + 5, its indirect block and the top block.
        assert_eq!(fs.free_block_tail(&mut inode, 13).unwrap(), 6);
        assert_eq!(inode.disk.blocks[DIRECT_BLOCKS + 1], 0);
        assert_ne!(inode.disk.blocks[DIRECT_BLOCKS], 0);
        assert_ne!(fs.logical_to_physical(&inode, 12).unwrap(), 0);
        assert_eq!(fs.logical_to_physical(&inode, 20).unwrap(), 0);
        assert_eq!(fs.logical_to_physical(&inode, 1036).unwrap(), 0);
        assert_ne!(fs.logical_to_physical(&inode, 11).unwrap(), 0);

        // Everything left: 0, 11, 12 and the level-1 block.
        assert_eq!(fs.free_block_tree(&mut inode).unwrap(), 4);
        fs.check().unwrap();
    }
}
