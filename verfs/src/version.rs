//! Block level version history.
//!
//! Before a mapped block of a versioned inode is overwritten its old content is
//! copied into a freshly allocated block and a [`VersionEntry`] pointing at the
//! copy is appended to the inode's metadata chain. The chain is a singly linked
//! list of [`VersionMetaBlock`]s, newest first, headed by `ver_meta_block` in
//! the inode record. Inside a block entries are ordered oldest to newest and
//! everything below `start` has been pruned.

use log::{debug, warn};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::cache::{lock, Block};
use crate::error::{Result, VerFSError};
use crate::fs::VerFS;
use crate::io::BlockStorage;
use crate::node::Inode;
use crate::BLOCK_SIZE;

pub const VERSION_NONE: u32 = 0;
pub const VERSION_KEEP_ALL: u32 = 1;
pub const VERSION_KEEP_SAFE_VERSIONS: u32 = 2;
pub const VERSION_KEEP_SAFE_TIME: u32 = 3;

pub const ENTRIES_PER_META_BLOCK: usize = 255;

/// Retention policy of a versioned inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionPolicy {
    /// Never prune.
    KeepAll,
    /// Keep the given number of most recent versions.
    KeepSafeVersions(u32),
    /// Keep versions younger than the given number of seconds.
    KeepSafeTime(u32),
}

impl VersionPolicy {
    /// Decodes the `version_type`/`version_param` pair of an inode record.
    /// `None` means versioning is off.
    pub fn from_raw(kind: u32, param: u32) -> Result<Option<Self>> {
        match kind {
            VERSION_NONE => Ok(None),
            VERSION_KEEP_ALL => Ok(Some(VersionPolicy::KeepAll)),
            VERSION_KEEP_SAFE_VERSIONS => Ok(Some(VersionPolicy::KeepSafeVersions(param))),
            VERSION_KEEP_SAFE_TIME => Ok(Some(VersionPolicy::KeepSafeTime(param))),
            _ => Err(VerFSError::invalid(format!("unknown version type {}", kind))),
        }
    }

    pub fn to_raw(self) -> (u32, u32) {
        match self {
            VersionPolicy::KeepAll => (VERSION_KEEP_ALL, 0),
            VersionPolicy::KeepSafeVersions(n) => (VERSION_KEEP_SAFE_VERSIONS, n),
            VersionPolicy::KeepSafeTime(secs) => (VERSION_KEEP_SAFE_TIME, secs),
        }
    }
}

#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionEntry {
    pub logical_block: u32,
    /// Block holding the saved copy.
    pub version_block: u32,
    pub timestamp: u32,
    /// How many bytes of the saved copy were inside the file when it was taken.
    pub bytes_valid: u32,
}

#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Debug, Clone, Copy)]
pub struct VersionMetaBlock {
    pub entry_count: u32,
    /// Index of the oldest entry that has not been pruned.
    pub start: u32,
    /// Next older metadata block, 0 at the end of the chain.
    pub next: u32,
    _pad: u32,
    pub entries: [VersionEntry; ENTRIES_PER_META_BLOCK],
}

const _: () = assert!(std::mem::size_of::<VersionMetaBlock>() == BLOCK_SIZE);

impl VersionMetaBlock {
    fn count(&self) -> usize {
        (self.entry_count as usize).min(ENTRIES_PER_META_BLOCK)
    }

    /// Entries that survived pruning, oldest first.
    pub fn live(&self) -> &[VersionEntry] {
        let end = self.count();
        let start = (self.start as usize).min(end);
        &self.entries[start..end]
    }

    fn is_full(&self) -> bool {
        self.count() == ENTRIES_PER_META_BLOCK
    }

    fn last_timestamp(&self) -> Option<u32> {
        self.count()
            .checked_sub(1)
            .map(|last| self.entries[last].timestamp)
    }
}

impl<T: BlockStorage> VerFS<T> {
    fn read_meta(&self, blocknr: u32) -> Result<VersionMetaBlock> {
        self.cache
            .get(blocknr)?
            .read(|b| VersionMetaBlock::read_from(&b[..]))
            .ok_or_else(|| VerFSError::invalid("short version metadata block"))
    }

    fn write_meta(&self, blocknr: u32, meta: &VersionMetaBlock) -> Result<()> {
        self.cache
            .get(blocknr)?
            .modify(|b| b.copy_from_slice(meta.as_bytes()));
        Ok(())
    }

    /// Calls `f` with every metadata block of the chain starting at `head`,
    /// newest first, until it returns false.
    fn walk_chain<F>(&self, head: u32, mut f: F) -> Result<()>
    where
        F: FnMut(u32, &VersionMetaBlock) -> Result<bool>,
    {
        let limit = lock(&self.super_block).n_blocks;
        let mut blocknr = head;
        let mut steps = 0;
        while blocknr != 0 {
            steps += 1;
            if steps > limit {
                return Err(VerFSError::InvalidSuperblock(format!(
                    "version chain starting at block {} does not terminate",
                    head
                )));
            }
            let meta = self.read_meta(blocknr)?;
            if !f(blocknr, &meta)? {
                break;
            }
            blocknr = meta.next;
        }
        Ok(())
    }

    /// Turns versioning on. An existing metadata chain is reused, otherwise an
    /// empty one is started.
    pub(crate) fn enable_versioning(&self, inode: &mut Inode, policy: VersionPolicy) -> Result<()> {
        if inode.disk.ver_meta_block == 0 {
            // A zeroed block is an empty metadata block.
            inode.disk.ver_meta_block = self.alloc_data_block()?;
        }
        let (kind, param) = policy.to_raw();
        inode.disk.version_type = kind;
        inode.disk.version_param = param;
        self.write_inode(inode)?;
        debug!(
            "enable_versioning: inum {} policy {:?} chain head {}",
            inode.inum, policy, inode.disk.ver_meta_block
        );
        Ok(())
    }

    /// Turns versioning off. The chain stays allocated and can still be read.
    pub(crate) fn disable_versioning(&self, inode: &mut Inode) -> Result<()> {
        inode.disk.version_type = VERSION_NONE;
        inode.disk.version_param = 0;
        self.write_inode(inode)?;
        debug!("disable_versioning: inum {}", inode.inum);
        Ok(())
    }

    /// Starts a new, empty head block in front of the current one.
    fn push_meta_block(&self, inode: &mut Inode) -> Result<u32> {
        let blocknr = self.alloc_data_block()?;
        let mut meta = VersionMetaBlock::new_zeroed();
        meta.next = inode.disk.ver_meta_block;
        self.write_meta(blocknr, &meta)?;
        inode.disk.ver_meta_block = blocknr;
        self.write_inode(inode)?;
        debug!(
            "push_meta_block: inum {} new head {} -> {}",
            inode.inum, blocknr, meta.next
        );
        Ok(blocknr)
    }

    /// Saves `old` as the pre-write content of `logical`. At most one version is
    /// recorded per inode per second, later calls in the same second are
    /// dropped. Returns whether a version was recorded.
    pub(crate) fn record_version(&self, inode: &mut Inode, logical: u32, old: &Block) -> Result<bool> {
        if inode.policy()?.is_none() {
            return Ok(false);
        }
        if inode.disk.ver_meta_block == 0 {
            self.push_meta_block(inode)?;
        }

        let mut head = inode.disk.ver_meta_block;
        let mut meta = self.read_meta(head)?;
        let last = match meta.last_timestamp() {
            Some(ts) => Some(ts),
            None if meta.next != 0 => self.read_meta(meta.next)?.last_timestamp(),
            None => None,
        };

        let mut now = self.now();
        if let Some(last) = last {
            // Timestamps never go backwards, even when the clock does.
            now = now.max(last);
            if now == last {
                debug!(
                    "record_version: inum {} already versioned at {}, skipping block {}",
                    inode.inum, now, logical
                );
                return Ok(false);
            }
        }

        if meta.is_full() {
            // A previous roll over could not allocate, try again before appending.
            head = self.push_meta_block(inode)?;
            meta = self.read_meta(head)?;
        }

        let block_start = logical as u64 * BLOCK_SIZE as u64;
        let bytes_valid = (inode.size as u64)
            .saturating_sub(block_start)
            .min(BLOCK_SIZE as u64) as u32;

        let version_block = self.alloc_data_block()?;
        self.cache
            .get(version_block)?
            .modify(|b| b.copy_from_slice(old));

        let idx = meta.count();
        meta.entries[idx] = VersionEntry {
            logical_block: logical,
            version_block,
            timestamp: now,
            bytes_valid,
        };
        meta.entry_count = idx as u32 + 1;
        self.write_meta(head, &meta)?;
        debug!(
            "record_version: inum {} block {} saved to {} at {} ({} bytes)",
            inode.inum, logical, version_block, now, bytes_valid
        );

        if meta.is_full() {
            if let Err(e) = self.push_meta_block(inode) {
                warn!(
                    "record_version: inum {} metadata block {} is full and no new one could be allocated: {}",
                    inode.inum, head, e
                );
            }
        }
        Ok(true)
    }

    /// Finds the version of `logical` to serve for time `at`: the oldest entry
    /// with a timestamp at or after `at` that is newer than every entry before
    /// `at`. `None` means the live data is current for that time.
    pub(crate) fn find_version(&self, inode: &Inode, logical: u32, at: u32) -> Result<Option<VersionEntry>> {
        let mut candidate = None;
        self.walk_chain(inode.disk.ver_meta_block, |_, meta| {
            for entry in meta.live().iter().rev() {
                if entry.logical_block != logical {
                    continue;
                }
                if entry.timestamp < at {
                    return Ok(false);
                }
                candidate = Some(*entry);
            }
            Ok(true)
        })?;
        Ok(candidate)
    }

    /// Returns the content of the block holding `offset` as it was at time `at`.
    /// Without a saved version the live block is returned, which is empty past
    /// the end of the file.
    pub(crate) fn retrieve_version(&self, inode: &Inode, offset: u32, at: u32) -> Result<Vec<u8>> {
        if inode.policy()?.is_none() && inode.disk.ver_meta_block == 0 {
            return Err(VerFSError::invalid(format!(
                "inode {} has no version history",
                inode.inum
            )));
        }

        let logical = offset / BLOCK_SIZE as u32;
        if let Some(entry) = self.find_version(inode, logical, at)? {
            debug!(
                "retrieve_version: inum {} block {} at {} served from version {} ({})",
                inode.inum, logical, at, entry.version_block, entry.timestamp
            );
            let len = (entry.bytes_valid as usize).min(BLOCK_SIZE);
            return Ok(self
                .cache
                .get(entry.version_block)?
                .read(|b| b[..len].to_vec()));
        }

        let start = logical * BLOCK_SIZE as u32;
        if start >= inode.size {
            return Ok(Vec::new());
        }
        let len = (inode.size - start).min(BLOCK_SIZE as u32) as usize;
        let mut data = vec![0u8; len];
        self.read_data(inode, start, &mut data)?;
        Ok(data)
    }

    /// Reassembles the content of the inode as of time `at`, block by block
    /// until the first short block.
    pub(crate) fn snapshot(&self, inode: &Inode, at: u32) -> Result<Vec<u8>> {
        let mut content = Vec::new();
        let mut offset: u32 = 0;
        loop {
            let block = self.retrieve_version(inode, offset, at)?;
            let short = block.len() < BLOCK_SIZE;
            content.extend_from_slice(&block);
            if short {
                break;
            }
            offset = match offset.checked_add(BLOCK_SIZE as u32) {
                Some(next) => next,
                None => break,
            };
        }
        Ok(content)
    }

    /// Applies the inode's retention policy and returns the number of version
    /// blocks freed.
    ///
    /// Both policies keep a run of the newest entries, so pruning only ever cuts
    /// the chain at one point: the block holding the newest pruned entry gets a
    /// new `start`, and every older metadata block is freed with its versions.
    pub(crate) fn prune_versions(&self, inode: &mut Inode) -> Result<u32> {
        let policy = inode.policy()?.ok_or_else(|| {
            VerFSError::invalid(format!("inode {} is not versioned", inode.inum))
        })?;
        let now = self.now();
        let mut kept: u32 = 0;
        let keep = |entry: &VersionEntry, kept: u32| match policy {
            VersionPolicy::KeepAll => true,
            VersionPolicy::KeepSafeVersions(n) => kept < n,
            VersionPolicy::KeepSafeTime(secs) => entry.timestamp >= now.saturating_sub(secs),
        };

        // (previous block, cut block, index of the newest pruned entry)
        let mut cut: Option<(u32, u32, usize)> = None;
        let mut prev = 0;
        self.walk_chain(inode.disk.ver_meta_block, |blocknr, meta| {
            let start = (meta.start as usize).min(meta.count());
            for idx in (start..meta.count()).rev() {
                if !keep(&meta.entries[idx], kept) {
                    cut = Some((prev, blocknr, idx));
                    return Ok(false);
                }
                kept += 1;
            }
            prev = blocknr;
            Ok(true)
        })?;

        let (prev, blocknr, idx) = match cut {
            Some(cut) => cut,
            None => return Ok(0),
        };

        let mut meta = self.read_meta(blocknr)?;
        let start = (meta.start as usize).min(meta.count());
        let mut freed = 0;
        for entry in &meta.entries[start..=idx] {
            self.free_data_block(entry.version_block)?;
            freed += 1;
        }
        let older = meta.next;
        meta.start = idx as u32 + 1;
        meta.next = 0;

        let (older_versions, mut meta_freed) = self.free_meta_chain(older)?;
        freed += older_versions;

        if meta.live().is_empty() && prev != 0 {
            let mut newer = self.read_meta(prev)?;
            newer.next = 0;
            self.write_meta(prev, &newer)?;
            self.free_data_block(blocknr)?;
            meta_freed += 1;
        } else {
            self.write_meta(blocknr, &meta)?;
        }

        debug!(
            "prune_versions: inum {} policy {:?} kept {} freed {} versions and {} metadata blocks",
            inode.inum, policy, kept, freed, meta_freed
        );
        Ok(freed)
    }

    /// Frees every live version block and every metadata block from `head` to
    /// the end of the chain. Returns (versions freed, metadata blocks freed).
    fn free_meta_chain(&self, head: u32) -> Result<(u32, u32)> {
        let mut blocks = Vec::new();
        let mut versions = Vec::new();
        self.walk_chain(head, |blocknr, meta| {
            blocks.push(blocknr);
            versions.extend(meta.live().iter().map(|e| e.version_block));
            Ok(true)
        })?;
        for &version_block in &versions {
            self.free_data_block(version_block)?;
        }
        for &blocknr in &blocks {
            self.free_data_block(blocknr)?;
        }
        Ok((versions.len() as u32, blocks.len() as u32))
    }

    /// Releases the whole history of an inode and turns versioning off. The
    /// inode record is not persisted here.
    pub(crate) fn free_version_chain(&self, inode: &mut Inode) -> Result<u32> {
        let (versions, _) = self.free_meta_chain(inode.disk.ver_meta_block)?;
        inode.disk.ver_meta_block = 0;
        inode.disk.version_type = VERSION_NONE;
        inode.disk.version_param = 0;
        Ok(versions)
    }

    /// Every reachable version entry, newest first.
    pub(crate) fn version_entries(&self, inode: &Inode) -> Result<Vec<VersionEntry>> {
        let mut entries = Vec::new();
        self.walk_chain(inode.disk.ver_meta_block, |_, meta| {
            entries.extend(meta.live().iter().rev().copied());
            Ok(true)
        })?;
        Ok(entries)
    }

    /// Block numbers of the metadata chain, newest first.
    pub(crate) fn version_chain(&self, inode: &Inode) -> Result<Vec<u32>> {
        let mut chain = Vec::new();
        self.walk_chain(inode.disk.ver_meta_block, |blocknr, _| {
            chain.push(blocknr);
            Ok(true)
        })?;
        Ok(chain)
    }
}
