use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::cache::Block;
use crate::error::{Result, VerFSError};
use crate::node::{INODE_SIZE, NODES_PER_BLOCK};
use crate::{BITS_PER_BLOCK, BLOCK_SIZE};

pub const SB_MAGIC: u32 = 0x5646_5342; // VFSB
const NAME_LEN: usize = 16;

/// The first block of the file system storing information critical for mounting
/// the file system and verifying the underlying disk is formatted correctly.
///
/// Every region is addressed by its first block and its length in blocks:
///
/// ==========================================================================
/// | SuperBlock | Bitmap (data blocks) | Bitmap (inodes) | Inodes | Data ...
/// ==========================================================================
///
/// The data bitmap has one bit per device block, metadata blocks included, so a
/// bit index is also a block number. The inode bitmap has one bit per inode.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    pub magic: u32,
    /// Volume name, NUL padded.
    pub name: [u8; NAME_LEN],
    pub sb_start: u32,
    pub sb_size: u32,
    pub data_bmap_start: u32,
    pub data_bmap_size: u32,
    pub inode_bmap_start: u32,
    pub inode_bmap_size: u32,
    pub inode_tbl_start: u32,
    pub inode_tbl_size: u32,
    /// First block of the data area.
    pub data_start: u32,
    pub n_blocks: u32,
    pub n_blocks_free: u32,
    pub n_inodes: u32,
    pub n_inodes_free: u32,
    /// Allocation hint: a block number, scanning starts from its bitmap block.
    pub next_free_block: u32,
    /// Allocation hint: an inode number, scanning starts from its bitmap block.
    pub next_free_inode: u32,
}

fn blocks_for(bytes: u64) -> u32 {
    ((bytes + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64) as u32
}

impl SuperBlock {
    /// Computes the region layout for a device of `n_blocks` blocks holding
    /// `n_inodes` inodes. Only the data area's first block is accounted as used
    /// beyond the metadata, it holds the root directory.
    pub fn layout(name: &str, n_blocks: u32, n_inodes: u32) -> Result<Self> {
        if n_inodes < 2 {
            return Err(VerFSError::invalid("at least two inodes are required"));
        }
        let mut sb = SuperBlock::new_zeroed();
        sb.magic = SB_MAGIC;
        let bytes = name.as_bytes();
        let len = bytes.len().min(NAME_LEN);
        sb.name[..len].copy_from_slice(&bytes[..len]);

        sb.sb_start = 0;
        sb.sb_size = 1;
        sb.data_bmap_start = sb.sb_start + sb.sb_size;
        sb.data_bmap_size = blocks_for((n_blocks as u64 + 7) / 8);
        sb.inode_bmap_start = sb.data_bmap_start + sb.data_bmap_size;
        sb.inode_bmap_size = blocks_for((n_inodes as u64 + 7) / 8);
        sb.inode_tbl_start = sb.inode_bmap_start + sb.inode_bmap_size;
        sb.inode_tbl_size = blocks_for(n_inodes as u64 * INODE_SIZE as u64);
        sb.data_start = sb.inode_tbl_start + sb.inode_tbl_size;

        // The root directory block plus at least one block for user data.
        if sb.data_start as u64 + 2 > n_blocks as u64 {
            return Err(VerFSError::invalid(format!(
                "device of {} blocks cannot hold {} metadata blocks",
                n_blocks, sb.data_start
            )));
        }

        sb.n_blocks = n_blocks;
        sb.n_blocks_free = n_blocks - sb.data_start - 1;
        sb.next_free_block = sb.data_start + 1;
        sb.n_inodes = n_inodes;
        // Inode 0 is never handed out and inode 1 is the root directory.
        sb.n_inodes_free = n_inodes - 2;
        sb.next_free_inode = 2;
        Ok(sb)
    }

    /// Reads the super block from the start of a block buffer, checking that the
    /// recorded geometry fits a device of `device_blocks` blocks.
    pub fn parse(buf: &[u8], device_blocks: usize) -> Result<Self> {
        let sb = SuperBlock::read_from_prefix(buf)
            .ok_or_else(|| VerFSError::InvalidSuperblock("short super block".into()))?;
        if sb.magic != SB_MAGIC {
            return Err(VerFSError::InvalidSuperblock(format!(
                "bad magic {:#010x}",
                sb.magic
            )));
        }
        sb.validate(device_blocks)?;
        Ok(sb)
    }

    fn validate(&self, device_blocks: usize) -> Result<()> {
        let bad = |what: &str| Err(VerFSError::InvalidSuperblock(what.to_string()));
        if self.n_blocks as usize > device_blocks {
            return bad("file system is larger than the device");
        }
        if (self.data_bmap_size as u64) * (BITS_PER_BLOCK as u64) < self.n_blocks as u64 {
            return bad("data bitmap too small");
        }
        if (self.inode_bmap_size as u64) * (BITS_PER_BLOCK as u64) < self.n_inodes as u64 {
            return bad("inode bitmap too small");
        }
        if (self.inode_tbl_size as u64) * (NODES_PER_BLOCK as u64) < self.n_inodes as u64 {
            return bad("inode table too small");
        }
        let regions_in_order = self.data_bmap_start == self.sb_start + self.sb_size
            && self.inode_bmap_start == self.data_bmap_start + self.data_bmap_size
            && self.inode_tbl_start == self.inode_bmap_start + self.inode_bmap_size
            && self.data_start == self.inode_tbl_start + self.inode_tbl_size;
        if !regions_in_order || self.data_start >= self.n_blocks {
            return bad("regions overlap or exceed the device");
        }
        if self.n_blocks_free > self.n_blocks || self.n_inodes_free > self.n_inodes {
            return bad("free counters exceed totals");
        }
        Ok(())
    }

    /// Serializes the SuperBlock into the front of a block buffer, zeroing the rest.
    pub fn serialize_into(&self, buf: &mut Block) {
        let bytes = self.as_bytes();
        buf.fill(0);
        buf[..bytes.len()].copy_from_slice(bytes);
    }

    pub fn name(&self) -> String {
        let end = self.name.iter().position(|&c| c == 0).unwrap_or(NAME_LEN);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }
}
