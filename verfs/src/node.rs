use log::debug;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::cache::lock;
use crate::error::{Result, VerFSError};
use crate::fs::VerFS;
use crate::io::BlockStorage;
use crate::version::VersionPolicy;
use crate::BLOCK_SIZE;

pub const INODE_SIZE: usize = 128;
pub const NODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;
/// 12 direct slots followed by the single, double and triple indirect slots.
pub const N_BLOCK_SLOTS: usize = 15;
pub const ROOT_INODE: u32 = 1;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    File = 1,
    Directory = 2,
}

impl TryFrom<u32> for InodeKind {
    type Error = VerFSError;

    fn try_from(raw: u32) -> Result<Self> {
        match raw {
            1 => Ok(InodeKind::File),
            2 => Ok(InodeKind::Directory),
            _ => Err(VerFSError::DoesNotExist),
        }
    }
}

#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Debug, Copy, Clone, PartialEq, Eq)]
/// This structure __must be exactly 128 bytes.__ An all zero record is a free inode.
pub struct InodeRecord {
    /// The total size of the file in bytes.
    pub size: u32,
    pub kind: u32,
    /// The number of links to this file.
    pub nlink: u32,
    /// Pointers for the data blocks that belong to the file.
    pub blocks: [u32; N_BLOCK_SLOTS],
    /// Newest block of the version metadata chain, 0 when there is none.
    pub ver_meta_block: u32,
    pub version_type: u32,
    pub version_param: u32,
    /// Reserved for future expansion of file attributes up to the 128 byte limit.
    pub reserved: [u8; 44],
}

const _: () = assert!(std::mem::size_of::<InodeRecord>() == INODE_SIZE);

/// The in-core copy of an inode. `size` is the live size and is folded back
/// into the record every time the inode is written.
#[derive(Debug, Clone)]
pub struct Inode {
    pub(crate) inum: u32,
    pub(crate) size: u32,
    pub(crate) disk: InodeRecord,
}

impl Inode {
    pub(crate) fn new(inum: u32, kind: InodeKind) -> Self {
        let mut disk = InodeRecord::new_zeroed();
        disk.kind = kind as u32;
        disk.nlink = match kind {
            InodeKind::File => 1,
            // Its entry in the parent plus its own ".".
            InodeKind::Directory => 2,
        };
        Inode {
            inum,
            size: 0,
            disk,
        }
    }

    fn from_record(inum: u32, disk: InodeRecord) -> Self {
        Inode {
            inum,
            size: disk.size,
            disk,
        }
    }

    pub fn kind(&self) -> Result<InodeKind> {
        InodeKind::try_from(self.disk.kind)
    }

    pub fn is_dir(&self) -> bool {
        self.disk.kind == InodeKind::Directory as u32
    }

    /// A deleted inode keeps an all zero record until the last handle drops it.
    pub fn is_live(&self) -> bool {
        self.kind().is_ok()
    }

    pub fn policy(&self) -> Result<Option<VersionPolicy>> {
        VersionPolicy::from_raw(self.disk.version_type, self.disk.version_param)
    }
}

impl<T: BlockStorage> VerFS<T> {
    /// Block number and byte offset of an inode inside the inode table.
    pub(crate) fn inode_location(&self, inum: u32) -> Result<(u32, usize)> {
        let sb = lock(&self.super_block);
        if inum == 0 || inum >= sb.n_inodes {
            return Err(VerFSError::invalid(format!("inode {} out of range", inum)));
        }
        let block = sb.inode_tbl_start + inum / NODES_PER_BLOCK as u32;
        let offset = (inum as usize % NODES_PER_BLOCK) * INODE_SIZE;
        Ok((block, offset))
    }

    pub(crate) fn read_inode(&self, inum: u32) -> Result<Inode> {
        let (block, offset) = self.inode_location(inum)?;
        let disk = self
            .cache
            .get(block)?
            .read(|b| InodeRecord::read_from(&b[offset..offset + INODE_SIZE]))
            .ok_or_else(|| VerFSError::invalid("short inode record"))?;
        Ok(Inode::from_record(inum, disk))
    }

    pub(crate) fn write_record(&self, inum: u32, record: &InodeRecord) -> Result<()> {
        let (block, offset) = self.inode_location(inum)?;
        self.cache
            .get(block)?
            .modify(|b| b[offset..offset + INODE_SIZE].copy_from_slice(record.as_bytes()));
        Ok(())
    }

    /// Writes the in-core inode back to the inode table.
    pub(crate) fn write_inode(&self, inode: &mut Inode) -> Result<()> {
        inode.disk.size = inode.size;
        self.write_record(inode.inum, &inode.disk)
    }

    /// Releases everything an inode owns: its block tree, its version chain and
    /// finally the inode itself. The in-core copy is left as a dead record.
    pub(crate) fn destroy_inode(&self, inode: &mut Inode) -> Result<()> {
        let blocks = self.free_block_tree(inode)?;
        let versions = self.free_version_chain(inode)?;
        self.free_inode(inode.inum)?;
        debug!(
            "destroy_inode: inum {} released {} blocks and {} versions",
            inode.inum, blocks, versions
        );
        inode.disk = InodeRecord::new_zeroed();
        inode.size = 0;
        Ok(())
    }
}
