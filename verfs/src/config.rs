use std::fmt;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};

/// Default number of device bytes backing each inode when no explicit inode
/// count is given.
pub const DEFAULT_BYTES_PER_INODE: u64 = 8192;
const MIN_INODES: u32 = 16;
const DEFAULT_CACHE_BLOCKS: usize = 256;

/// Parameters for laying out a fresh file system on a device.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    /// Human readable volume name, at most 16 bytes are kept.
    pub name: String,
    /// Exact number of inodes. Takes precedence over `bytes_per_inode`.
    pub inode_count: Option<u32>,
    /// One inode is reserved for every this many bytes of device.
    pub bytes_per_inode: u64,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            name: "verfs".to_string(),
            inode_count: None,
            bytes_per_inode: DEFAULT_BYTES_PER_INODE,
        }
    }
}

impl FormatOptions {
    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_inode_count(mut self, inodes: u32) -> Self {
        self.inode_count = Some(inodes);
        self
    }

    pub fn with_bytes_per_inode(mut self, bytes: u64) -> Self {
        self.bytes_per_inode = bytes;
        self
    }

    /// Resolves the number of inodes to create on a device of `total_blocks`.
    pub(crate) fn inodes_for(&self, total_blocks: u32) -> u32 {
        if let Some(count) = self.inode_count {
            return count.max(MIN_INODES);
        }
        let bytes = total_blocks as u64 * crate::BLOCK_SIZE as u64;
        let ratio = self.bytes_per_inode.max(crate::node::INODE_SIZE as u64);
        ((bytes / ratio) as u32).max(MIN_INODES)
    }
}

/// Runtime knobs for a mounted file system.
#[derive(Clone)]
pub struct MountOptions {
    /// Soft upper bound on blocks held by the block cache.
    pub cache_blocks: usize,
    /// Time source for version timestamps.
    pub clock: Arc<dyn Clock>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            cache_blocks: DEFAULT_CACHE_BLOCKS,
            clock: Arc::new(SystemClock),
        }
    }
}

impl fmt::Debug for MountOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountOptions")
            .field("cache_blocks", &self.cache_blocks)
            .finish_non_exhaustive()
    }
}

impl MountOptions {
    pub fn with_cache_blocks(mut self, blocks: usize) -> Self {
        self.cache_blocks = blocks.max(1);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}
