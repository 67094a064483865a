//! Reference counted cache of device blocks.
//!
//! Every block read from the device lives in the cache as a shared
//! [`CachedBlock`]. Callers hold a [`BlockRef`] for as long as they need the
//! block and release it by dropping the handle. A block is only evicted when
//! the cache holds the last reference to it, and a dirty block is written back
//! before it leaves the cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, warn};

use crate::io::BlockStorage;
use crate::BLOCK_SIZE;

pub type Block = [u8; BLOCK_SIZE];

/// Locks a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn read_lock<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|e| e.into_inner())
}

fn write_lock<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|e| e.into_inner())
}

pub struct CachedBlock {
    blocknr: u32,
    data: RwLock<Box<Block>>,
    dirty: AtomicBool,
}

/// A scoped acquisition of one cached block.
pub struct BlockRef {
    block: Arc<CachedBlock>,
}

impl BlockRef {
    /// Acquire the block for reading.
    pub fn read<R>(&self, f: impl FnOnce(&Block) -> R) -> R {
        let data = read_lock(&self.block.data);
        f(&data)
    }

    /// Acquire the block for writing. The block is marked dirty.
    pub fn modify<R>(&self, f: impl FnOnce(&mut Block) -> R) -> R {
        let mut data = write_lock(&self.block.data);
        let out = f(&mut data);
        self.block.dirty.store(true, Ordering::Release);
        out
    }
}

pub struct BlockCache<T: BlockStorage> {
    dev: Mutex<T>,
    blocks: Mutex<HashMap<u32, Arc<CachedBlock>>>,
    capacity: usize,
}

impl<T: BlockStorage> BlockCache<T> {
    pub fn new(dev: T, capacity: usize) -> Self {
        Self {
            dev: Mutex::new(dev),
            blocks: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn block_count(&self) -> usize {
        lock(&self.dev).block_count()
    }

    /// Returns the cached block, reading it from the device on a miss.
    pub fn get(&self, blocknr: u32) -> std::io::Result<BlockRef> {
        let mut blocks = lock(&self.blocks);
        if let Some(block) = blocks.get(&blocknr) {
            return Ok(BlockRef {
                block: Arc::clone(block),
            });
        }

        if blocks.len() >= self.capacity {
            self.evict(&mut blocks)?;
        }

        let mut data = Box::new([0u8; BLOCK_SIZE]);
        lock(&self.dev).read_block(blocknr as usize, &mut data[..])?;
        let block = Arc::new(CachedBlock {
            blocknr,
            data: RwLock::new(data),
            dirty: AtomicBool::new(false),
        });
        blocks.insert(blocknr, Arc::clone(&block));
        Ok(BlockRef { block })
    }

    /// Drops every unreferenced block, writing dirty ones back first.
    fn evict(&self, blocks: &mut HashMap<u32, Arc<CachedBlock>>) -> std::io::Result<()> {
        let idle: Vec<u32> = blocks
            .iter()
            .filter(|(_, b)| Arc::strong_count(b) == 1)
            .map(|(&n, _)| n)
            .collect();
        if idle.is_empty() {
            warn!(
                "block cache over capacity ({} blocks), every block is in use",
                blocks.len()
            );
            return Ok(());
        }
        for blocknr in idle {
            if let Some(block) = blocks.get(&blocknr) {
                self.write_back(block)?;
            }
            blocks.remove(&blocknr);
        }
        debug!("block cache evicted down to {} blocks", blocks.len());
        Ok(())
    }

    fn write_back(&self, block: &CachedBlock) -> std::io::Result<()> {
        let data = read_lock(&block.data);
        if block.dirty.swap(false, Ordering::AcqRel) {
            if let Err(e) = lock(&self.dev).write_block(block.blocknr as usize, &data[..]) {
                block.dirty.store(true, Ordering::Release);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Writes back every dirty block and syncs the device. Returns the number of
    /// blocks written.
    pub fn sync(&self) -> std::io::Result<usize> {
        let snapshot: Vec<Arc<CachedBlock>> = lock(&self.blocks).values().cloned().collect();
        let mut written = 0;
        for block in snapshot.iter() {
            if block.dirty.load(Ordering::Acquire) {
                self.write_back(block)?;
                written += 1;
            }
        }
        lock(&self.dev).sync_disk()?;
        Ok(written)
    }

    pub fn cached_blocks(&self) -> usize {
        lock(&self.blocks).len()
    }
}
