use std::collections::HashMap;
use std::path::{Component, Path};
use std::sync::{Arc, Mutex, Weak};

use log::{info, warn};

use crate::alloc::BitmapRegion;
use crate::cache::{lock, BlockCache};
use crate::clock::Clock;
use crate::config::{FormatOptions, MountOptions};
use crate::error::{Result, VerFSError};
use crate::handle::{DirNode, FileNode, Node};
use crate::io::BlockStorage;
use crate::node::{Inode, InodeKind, ROOT_INODE};
use crate::sb::SuperBlock;
use crate::{BITS_PER_BLOCK, BLOCK_SIZE};

/// Usage summary of a mounted file system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsStats {
    pub name: String,
    pub block_size: usize,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub total_inodes: u32,
    pub free_inodes: u32,
    /// First block of the data area.
    pub data_start: u32,
    /// Blocks currently held by the block cache.
    pub cached_blocks: usize,
}

/// A mounted file system on owned block storage.
///
/// # Layout
/// ==============================================================================
/// | SuperBlock | Bitmap (all blocks) | Bitmap (inodes) | Inodes | Data Region |
/// ==============================================================================
///
/// Every region is sized at format time from the device capacity, see
/// [`SuperBlock::layout`].
pub struct VerFS<T: BlockStorage> {
    pub(crate) cache: BlockCache<T>,
    pub(crate) super_block: Mutex<SuperBlock>,
    pub(crate) data_bmp: BitmapRegion,
    pub(crate) inode_bmp: BitmapRegion,
    /// In-core inodes currently referenced by a handle.
    inodes: Mutex<HashMap<u32, Weak<Mutex<Inode>>>>,
    clock: Arc<dyn Clock>,
}

impl<T: BlockStorage> VerFS<T> {
    fn with_super_block(cache: BlockCache<T>, sb: SuperBlock, clock: Arc<dyn Clock>) -> Self {
        VerFS {
            cache,
            data_bmp: BitmapRegion::new(sb.data_bmap_start, sb.data_bmap_size),
            inode_bmp: BitmapRegion::new(sb.inode_bmap_start, sb.inode_bmap_size),
            super_block: Mutex::new(sb),
            inodes: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Initializes the file system onto owned block storage with default options.
    pub fn create(dev: T) -> Result<Self> {
        Self::format(dev, &FormatOptions::default(), MountOptions::default())
    }

    /// Lays out a fresh file system over the whole device and mounts it.
    pub fn format(dev: T, opts: &FormatOptions, mount: MountOptions) -> Result<Self> {
        let device_blocks = dev.block_count();
        let n_blocks = u32::try_from(device_blocks).map_err(|_| {
            VerFSError::invalid(format!("device of {} blocks is too large", device_blocks))
        })?;
        let sb = SuperBlock::layout(&opts.name, n_blocks, opts.inodes_for(n_blocks))?;

        let cache = BlockCache::new(dev, mount.cache_blocks);
        // Metadata plus the root directory's first block.
        for blocknr in 0..=sb.data_start {
            cache.get(blocknr)?.modify(|b| b.fill(0));
        }

        let fs = Self::with_super_block(cache, sb, mount.clock);
        fs.store_super_block(&sb)?;

        let data_bits = sb.data_bmap_size * BITS_PER_BLOCK as u32;
        fs.data_bmp.reserve_range(&fs.cache, 0, sb.data_start + 1)?;
        fs.data_bmp.reserve_range(&fs.cache, sb.n_blocks, data_bits)?;
        let inode_bits = sb.inode_bmap_size * BITS_PER_BLOCK as u32;
        fs.inode_bmp.reserve_range(&fs.cache, 0, ROOT_INODE + 1)?;
        fs.inode_bmp.reserve_range(&fs.cache, sb.n_inodes, inode_bits)?;

        let mut root = Inode::new(ROOT_INODE, InodeKind::Directory);
        root.disk.blocks[0] = sb.data_start;
        fs.write_inode(&mut root)?;
        fs.seed_directory(&mut root, ROOT_INODE)?;

        fs.sync()?;
        info!(
            "format: {:?} with {} blocks ({} free) and {} inodes, data starts at {}",
            sb.name(),
            sb.n_blocks,
            sb.n_blocks_free,
            sb.n_inodes,
            sb.data_start
        );
        Ok(fs)
    }

    pub fn open(dev: T) -> Result<Self> {
        Self::open_with(dev, MountOptions::default())
    }

    /// Mounts an already formatted device.
    pub fn open_with(dev: T, opts: MountOptions) -> Result<Self> {
        let cache = BlockCache::new(dev, opts.cache_blocks);
        let device_blocks = cache.block_count();
        let sb = cache
            .get(0)?
            .read(|b| SuperBlock::parse(&b[..], device_blocks))?;

        let fs = Self::with_super_block(cache, sb, opts.clock);
        if !fs.read_inode(ROOT_INODE)?.is_dir() {
            return Err(VerFSError::InvalidSuperblock(
                "root inode is not a directory".into(),
            ));
        }
        info!(
            "mount: {:?} with {}/{} blocks and {}/{} inodes free",
            sb.name(),
            sb.n_blocks_free,
            sb.n_blocks,
            sb.n_inodes_free,
            sb.n_inodes
        );
        Ok(fs)
    }

    /// Copies the super block into block 0 of the cache.
    pub(crate) fn store_super_block(&self, sb: &SuperBlock) -> Result<()> {
        self.cache.get(0)?.modify(|b| sb.serialize_into(b));
        Ok(())
    }

    pub(crate) fn now(&self) -> u32 {
        self.clock.now()
    }

    /// Returns the shared in-core inode, loading it on first use. The table
    /// lock is never held while an inode lock is taken.
    pub(crate) fn inode_cell(&self, inum: u32) -> Result<Arc<Mutex<Inode>>> {
        let cached = lock(&self.inodes).get(&inum).and_then(Weak::upgrade);
        let cell = match cached {
            Some(cell) => cell,
            None => {
                let loaded = self.read_inode(inum)?;
                let mut inodes = lock(&self.inodes);
                // Another caller may have loaded it meanwhile.
                match inodes.get(&inum).and_then(Weak::upgrade) {
                    Some(cell) => cell,
                    None => {
                        inodes.retain(|_, cell| cell.strong_count() > 0);
                        let cell = Arc::new(Mutex::new(loaded));
                        inodes.insert(inum, Arc::downgrade(&cell));
                        cell
                    }
                }
            }
        };
        if !lock(&cell).is_live() {
            return Err(VerFSError::DoesNotExist);
        }
        Ok(cell)
    }

    /// Publishes a freshly created inode, replacing any stale cell left behind
    /// by a deleted inode with the same number.
    pub(crate) fn install_inode(&self, inode: Inode) -> Arc<Mutex<Inode>> {
        let inum = inode.inum;
        let cell = Arc::new(Mutex::new(inode));
        lock(&self.inodes).insert(inum, Arc::downgrade(&cell));
        cell
    }

    pub fn node(&self, inum: u32) -> Result<Node<'_, T>> {
        let cell = self.inode_cell(inum)?;
        let kind = lock(&cell).kind()?;
        Ok(match kind {
            InodeKind::File => Node::File(FileNode::new(self, inum, cell)),
            InodeKind::Directory => Node::Directory(DirNode::new(self, inum, cell)),
        })
    }

    pub fn root(&self) -> Result<DirNode<'_, T>> {
        self.node(ROOT_INODE)?.into_dir()
    }

    /// Resolves an absolute path one component at a time.
    pub fn lookup_path<P: AsRef<Path>>(&self, path: P) -> Result<Node<'_, T>> {
        let mut parts = path.as_ref().components();
        if Some(Component::RootDir) != parts.next() {
            return Err(VerFSError::invalid("path must start with \"/\""));
        }

        let mut node = Node::Directory(self.root()?);
        for part in parts {
            let name = match part {
                Component::CurDir => continue,
                Component::ParentDir => "..",
                Component::Normal(name) => name
                    .to_str()
                    .ok_or_else(|| VerFSError::invalid("path is not valid UTF-8"))?,
                _ => return Err(VerFSError::invalid("unexpected path component")),
            };
            let dir = node.into_dir()?;
            node = dir.open(name)?;
        }
        Ok(node)
    }

    /// Splits a path into its parent directory and final name.
    fn parent_of<'p>(&self, path: &'p Path) -> Result<(DirNode<'_, T>, &'p str)> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| VerFSError::invalid(format!("no file name in {:?}", path)))?;
        let parent = path.parent().unwrap_or_else(|| Path::new("/"));
        Ok((self.lookup_path(parent)?.into_dir()?, name))
    }

    /// Creates an empty file at `path`.
    pub fn create_file<P: AsRef<Path>>(&self, path: P) -> Result<FileNode<'_, T>> {
        let (dir, name) = self.parent_of(path.as_ref())?;
        dir.create_file(name)
    }

    pub fn mkdir<P: AsRef<Path>>(&self, path: P) -> Result<DirNode<'_, T>> {
        let (dir, name) = self.parent_of(path.as_ref())?;
        dir.mkdir(name)
    }

    /// Unlinks the file or empty directory at `path`.
    pub fn remove<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let (dir, name) = self.parent_of(path.as_ref())?;
        dir.remove(name)
    }

    pub fn stats(&self) -> FsStats {
        let sb = lock(&self.super_block);
        FsStats {
            name: sb.name(),
            block_size: BLOCK_SIZE,
            total_blocks: sb.n_blocks,
            free_blocks: sb.n_blocks_free,
            total_inodes: sb.n_inodes,
            free_inodes: sb.n_inodes_free,
            data_start: sb.data_start,
            cached_blocks: self.cache.cached_blocks(),
        }
    }

    /// Recounts both bitmaps and compares them with the super block counters.
    pub fn check(&self) -> Result<()> {
        let sb = *lock(&self.super_block);
        let free_blocks = self.data_bmp.count_free(&self.cache, sb.n_blocks)?;
        let free_inodes = self.inode_bmp.count_free(&self.cache, sb.n_inodes)?;
        if free_blocks != sb.n_blocks_free {
            return Err(VerFSError::InvalidSuperblock(format!(
                "data bitmap has {} free blocks, super block records {}",
                free_blocks, sb.n_blocks_free
            )));
        }
        if free_inodes != sb.n_inodes_free {
            return Err(VerFSError::InvalidSuperblock(format!(
                "inode bitmap has {} free inodes, super block records {}",
                free_inodes, sb.n_inodes_free
            )));
        }
        Ok(())
    }

    /// Flushes every dirty block to the device. Returns the number of blocks written.
    pub fn sync(&self) -> Result<usize> {
        let sb = *lock(&self.super_block);
        self.store_super_block(&sb)?;
        let written = self.cache.sync()?;
        info!("sync: wrote {} blocks", written);
        Ok(written)
    }
}

impl<T: BlockStorage> Drop for VerFS<T> {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            warn!("failed to sync file system on drop: {}", e);
        }
    }
}
