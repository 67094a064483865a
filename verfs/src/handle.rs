//! Handles on files and directories of a mounted [`VerFS`].
//!
//! A handle borrows the file system and shares the in-core inode with every
//! other handle on the same inode number, so all mutations of one inode are
//! serialized on its lock. Operations that touch two inodes lock the parent
//! directory before the child.

use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;

use crate::cache::lock;
use crate::dir::{parse_entries, validate_name, DIR_ENTRY_SIZE};
use crate::error::{Result, VerFSError};
use crate::fs::VerFS;
use crate::io::BlockStorage;
use crate::node::{Inode, InodeKind};
use crate::version::{VersionEntry, VersionPolicy};

/// Operations shared by every kind of node.
pub trait NodeOps {
    fn inum(&self) -> u32;
    fn kind(&self) -> InodeKind;
    fn size(&self) -> Result<u32>;
    fn nlink(&self) -> Result<u32>;

    /// Reads raw content starting at `pos`. Fails when `pos` is at or past the
    /// end of the node.
    fn read(&self, pos: u32, buf: &mut [u8]) -> Result<usize>;
    fn write(&self, pos: u32, data: &[u8]) -> Result<usize>;
    fn lookup(&self, name: &str) -> Result<u32>;
    /// Live `(name, inode)` pairs of a directory.
    fn entries(&self) -> Result<Vec<(String, u32)>>;

    fn set_versioning(&self, policy: VersionPolicy) -> Result<()>;
    fn clear_versioning(&self) -> Result<()>;
    fn versioning(&self) -> Result<Option<VersionPolicy>>;
    /// Content of the block holding `offset` as of time `at`.
    fn retrieve(&self, offset: u32, at: u32) -> Result<Vec<u8>>;
    /// Applies the retention policy, returning how many versions were dropped.
    fn prune(&self) -> Result<u32>;
    /// Recorded versions, newest first.
    fn versions(&self) -> Result<Vec<VersionEntry>>;
    /// Metadata blocks holding the version history, newest first.
    fn history_blocks(&self) -> Result<Vec<u32>>;
}

struct Handle<'a, T: BlockStorage> {
    fs: &'a VerFS<T>,
    inum: u32,
    cell: Arc<Mutex<Inode>>,
}

impl<'a, T: BlockStorage> Handle<'a, T> {
    /// Locks the inode, failing if it was deleted through another handle.
    fn locked(&self) -> Result<MutexGuard<'_, Inode>> {
        let inode = lock(&self.cell);
        if !inode.is_live() {
            return Err(VerFSError::DoesNotExist);
        }
        Ok(inode)
    }

    fn size(&self) -> Result<u32> {
        Ok(self.locked()?.size)
    }

    fn nlink(&self) -> Result<u32> {
        Ok(self.locked()?.disk.nlink)
    }

    fn read(&self, pos: u32, buf: &mut [u8]) -> Result<usize> {
        self.fs.read_data(&*self.locked()?, pos, buf)
    }

    fn write(&self, pos: u32, data: &[u8]) -> Result<usize> {
        self.fs.write_data(&mut *self.locked()?, pos, data)
    }

    fn set_versioning(&self, policy: VersionPolicy) -> Result<()> {
        self.fs.enable_versioning(&mut *self.locked()?, policy)
    }

    fn clear_versioning(&self) -> Result<()> {
        self.fs.disable_versioning(&mut *self.locked()?)
    }

    fn versioning(&self) -> Result<Option<VersionPolicy>> {
        self.locked()?.policy()
    }

    fn retrieve(&self, offset: u32, at: u32) -> Result<Vec<u8>> {
        self.fs.retrieve_version(&*self.locked()?, offset, at)
    }

    fn prune(&self) -> Result<u32> {
        self.fs.prune_versions(&mut *self.locked()?)
    }

    fn versions(&self) -> Result<Vec<VersionEntry>> {
        self.fs.version_entries(&*self.locked()?)
    }

    fn history_blocks(&self) -> Result<Vec<u32>> {
        self.fs.version_chain(&*self.locked()?)
    }
}

/// Implements the [`NodeOps`] methods that behave the same for every kind.
macro_rules! common_node_ops {
    () => {
        fn inum(&self) -> u32 {
            self.handle.inum
        }
        fn size(&self) -> Result<u32> {
            self.handle.size()
        }
        fn nlink(&self) -> Result<u32> {
            self.handle.nlink()
        }
        fn read(&self, pos: u32, buf: &mut [u8]) -> Result<usize> {
            self.handle.read(pos, buf)
        }
        fn set_versioning(&self, policy: VersionPolicy) -> Result<()> {
            self.handle.set_versioning(policy)
        }
        fn clear_versioning(&self) -> Result<()> {
            self.handle.clear_versioning()
        }
        fn versioning(&self) -> Result<Option<VersionPolicy>> {
            self.handle.versioning()
        }
        fn retrieve(&self, offset: u32, at: u32) -> Result<Vec<u8>> {
            self.handle.retrieve(offset, at)
        }
        fn prune(&self) -> Result<u32> {
            self.handle.prune()
        }
        fn versions(&self) -> Result<Vec<VersionEntry>> {
            self.handle.versions()
        }
        fn history_blocks(&self) -> Result<Vec<u32>> {
            self.handle.history_blocks()
        }
    };
}

pub struct FileNode<'a, T: BlockStorage> {
    handle: Handle<'a, T>,
}

impl<'a, T: BlockStorage> FileNode<'a, T> {
    pub(crate) fn new(fs: &'a VerFS<T>, inum: u32, cell: Arc<Mutex<Inode>>) -> Self {
        FileNode {
            handle: Handle { fs, inum, cell },
        }
    }

    /// Reads the whole file.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let inode = self.handle.locked()?;
        let mut data = vec![0u8; inode.size as usize];
        if !data.is_empty() {
            self.handle.fs.read_data(&inode, 0, &mut data)?;
        }
        Ok(data)
    }

    /// The whole file as it was at time `at`.
    pub fn read_at(&self, at: u32) -> Result<Vec<u8>> {
        self.handle.fs.snapshot(&*self.handle.locked()?, at)
    }

    /// Rewrites the file with its content as of time `at` and cuts it to the
    /// recovered length, freeing blocks past it. The rewrite is itself
    /// versioned when versioning is on.
    /// Returns the new size.
    pub fn rollback(&self, at: u32) -> Result<u32> {
        let fs = self.handle.fs;
        let mut inode = self.handle.locked()?;
        let content = fs.snapshot(&inode, at)?;
        fs.write_data(&mut inode, 0, &content)?;
        fs.truncate_data(&mut inode, content.len() as u32)?;
        debug!("rollback: inum {} to {} is {} bytes", inode.inum, at, inode.size);
        Ok(inode.size)
    }
}

impl<'a, T: BlockStorage> NodeOps for FileNode<'a, T> {
    common_node_ops!();

    fn kind(&self) -> InodeKind {
        InodeKind::File
    }

    fn write(&self, pos: u32, data: &[u8]) -> Result<usize> {
        self.handle.write(pos, data)
    }

    fn lookup(&self, _name: &str) -> Result<u32> {
        Err(VerFSError::NotADirectory)
    }

    fn entries(&self) -> Result<Vec<(String, u32)>> {
        Err(VerFSError::NotADirectory)
    }
}

pub struct DirNode<'a, T: BlockStorage> {
    handle: Handle<'a, T>,
}

impl<'a, T: BlockStorage> DirNode<'a, T> {
    pub(crate) fn new(fs: &'a VerFS<T>, inum: u32, cell: Arc<Mutex<Inode>>) -> Self {
        DirNode {
            handle: Handle { fs, inum, cell },
        }
    }

    /// Opens the entry called `name`.
    pub fn open(&self, name: &str) -> Result<Node<'a, T>> {
        let inum = self.lookup(name)?;
        self.handle.fs.node(inum)
    }

    /// Fails with `AlreadyExists` when `name` is taken.
    fn ensure_absent(&self, dir: &Inode, name: &str) -> Result<()> {
        validate_name(name)?;
        match self.handle.fs.dir_lookup(dir, name) {
            Ok(_) => Err(VerFSError::AlreadyExists),
            Err(VerFSError::DoesNotExist) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn create_file(&self, name: &str) -> Result<FileNode<'a, T>> {
        let fs = self.handle.fs;
        let mut dir = self.handle.locked()?;
        self.ensure_absent(&dir, name)?;

        let inum = fs.alloc_inode()?;
        let mut inode = Inode::new(inum, InodeKind::File);
        let linked = fs
            .write_inode(&mut inode)
            .and_then(|_| fs.dir_insert(&mut dir, name, inum));
        if let Err(e) = linked {
            fs.free_inode(inum)?;
            return Err(e);
        }

        debug!("create_file: {:?} is inode {} in dir {}", name, inum, dir.inum);
        Ok(FileNode::new(fs, inum, fs.install_inode(inode)))
    }

    pub fn mkdir(&self, name: &str) -> Result<DirNode<'a, T>> {
        let fs = self.handle.fs;
        let mut dir = self.handle.locked()?;
        self.ensure_absent(&dir, name)?;

        let inum = fs.alloc_inode()?;
        let mut child = Inode::new(inum, InodeKind::Directory);
        let linked = fs
            .write_inode(&mut child)
            .and_then(|_| fs.seed_directory(&mut child, dir.inum))
            .and_then(|_| fs.dir_insert(&mut dir, name, inum));
        if let Err(e) = linked {
            fs.destroy_inode(&mut child)?;
            return Err(e);
        }

        debug!("mkdir: {:?} is inode {} in dir {}", name, inum, dir.inum);
        Ok(DirNode::new(fs, inum, fs.install_inode(child)))
    }

    /// Unlinks `name`. Directories must be empty. The target is destroyed, with
    /// its blocks and version history, once nothing links to it.
    pub fn remove(&self, name: &str) -> Result<()> {
        if name == "." || name == ".." {
            return Err(VerFSError::invalid(format!("cannot remove {:?}", name)));
        }
        let fs = self.handle.fs;
        let mut dir = self.handle.locked()?;
        let inum = fs.dir_lookup(&dir, name)?;
        if inum == dir.inum {
            return Err(VerFSError::invalid(format!("{:?} links to its own directory", name)));
        }

        let cell = fs.inode_cell(inum)?;
        let mut target = lock(&cell);
        if target.is_dir() && !fs.dir_is_empty(&target)? {
            return Err(VerFSError::DirectoryNotEmpty);
        }

        fs.dir_remove(&mut dir, name)?;
        target.disk.nlink = target.disk.nlink.saturating_sub(1);
        if target.disk.nlink == 0 || target.is_dir() {
            fs.destroy_inode(&mut target)?;
        } else {
            fs.write_inode(&mut target)?;
        }
        debug!("remove: {:?} (inode {}) from dir {}", name, inum, dir.inum);
        Ok(())
    }

    /// Live entries as they were at time `at`.
    pub fn entries_at(&self, at: u32) -> Result<Vec<(String, u32)>> {
        let raw = self.handle.fs.snapshot(&*self.handle.locked()?, at)?;
        Ok(parse_entries(&raw))
    }

    /// Writes back the directory image as of time `at` over the current one.
    /// Entries appended after `at` are left in place. Returns the image length.
    pub fn rollback(&self, at: u32) -> Result<u32> {
        let fs = self.handle.fs;
        let mut dir = self.handle.locked()?;
        let image = fs.snapshot(&dir, at)?;
        fs.write_data(&mut dir, 0, &image)?;
        debug!("rollback: dir {} to {} is {} bytes", dir.inum, at, image.len());
        Ok(image.len() as u32)
    }

    /// Overwrites raw directory content at `offset`, used to restore an earlier
    /// image of the directory. `offset` and the length of `data` must both be
    /// multiples of the entry size.
    pub fn rollback_directory(&self, offset: u32, data: &[u8]) -> Result<usize> {
        if offset as usize % DIR_ENTRY_SIZE != 0 {
            return Err(VerFSError::invalid(format!(
                "offset {} is not on a directory entry boundary",
                offset
            )));
        }
        if data.len() % DIR_ENTRY_SIZE != 0 {
            return Err(VerFSError::invalid(format!(
                "{} bytes is not a whole number of directory entries",
                data.len()
            )));
        }
        let fs = self.handle.fs;
        let mut dir = self.handle.locked()?;
        fs.write_data(&mut dir, offset, data)
    }
}

impl<'a, T: BlockStorage> NodeOps for DirNode<'a, T> {
    common_node_ops!();

    fn kind(&self) -> InodeKind {
        InodeKind::Directory
    }

    /// Directory content only changes through entry operations and
    /// [`DirNode::rollback_directory`].
    fn write(&self, _pos: u32, _data: &[u8]) -> Result<usize> {
        Err(VerFSError::IsADirectory)
    }

    fn lookup(&self, name: &str) -> Result<u32> {
        self.handle.fs.dir_lookup(&*self.handle.locked()?, name)
    }

    fn entries(&self) -> Result<Vec<(String, u32)>> {
        self.handle.fs.dir_entries(&*self.handle.locked()?)
    }
}

/// A file system entry of either kind.
pub enum Node<'a, T: BlockStorage> {
    File(FileNode<'a, T>),
    Directory(DirNode<'a, T>),
}

impl<'a, T: BlockStorage> Node<'a, T> {
    pub fn into_file(self) -> Result<FileNode<'a, T>> {
        match self {
            Node::File(file) => Ok(file),
            Node::Directory(_) => Err(VerFSError::IsADirectory),
        }
    }

    pub fn into_dir(self) -> Result<DirNode<'a, T>> {
        match self {
            Node::Directory(dir) => Ok(dir),
            Node::File(_) => Err(VerFSError::NotADirectory),
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Node::Directory(_))
    }
}

macro_rules! dispatch {
    ($self:ident, $node:ident => $call:expr) => {
        match $self {
            Node::File($node) => $call,
            Node::Directory($node) => $call,
        }
    };
}

impl<'a, T: BlockStorage> NodeOps for Node<'a, T> {
    fn inum(&self) -> u32 {
        dispatch!(self, n => n.inum())
    }
    fn kind(&self) -> InodeKind {
        dispatch!(self, n => n.kind())
    }
    fn size(&self) -> Result<u32> {
        dispatch!(self, n => n.size())
    }
    fn nlink(&self) -> Result<u32> {
        dispatch!(self, n => n.nlink())
    }
    fn read(&self, pos: u32, buf: &mut [u8]) -> Result<usize> {
        dispatch!(self, n => n.read(pos, buf))
    }
    fn write(&self, pos: u32, data: &[u8]) -> Result<usize> {
        dispatch!(self, n => n.write(pos, data))
    }
    fn lookup(&self, name: &str) -> Result<u32> {
        dispatch!(self, n => n.lookup(name))
    }
    fn entries(&self) -> Result<Vec<(String, u32)>> {
        dispatch!(self, n => n.entries())
    }
    fn set_versioning(&self, policy: VersionPolicy) -> Result<()> {
        dispatch!(self, n => n.set_versioning(policy))
    }
    fn clear_versioning(&self) -> Result<()> {
        dispatch!(self, n => n.clear_versioning())
    }
    fn versioning(&self) -> Result<Option<VersionPolicy>> {
        dispatch!(self, n => n.versioning())
    }
    fn retrieve(&self, offset: u32, at: u32) -> Result<Vec<u8>> {
        dispatch!(self, n => n.retrieve(offset, at))
    }
    fn prune(&self) -> Result<u32> {
        dispatch!(self, n => n.prune())
    }
    fn versions(&self) -> Result<Vec<VersionEntry>> {
        dispatch!(self, n => n.versions())
    }
    fn history_blocks(&self) -> Result<Vec<u32>> {
        dispatch!(self, n => n.history_blocks())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testutil::{test_fs, test_fs_with_clock};
    use crate::node::ROOT_INODE;
    use crate::BLOCK_SIZE;

    #[test]
    fn create_and_open_by_name() {
        let fs = test_fs(128);
        let root = fs.root().unwrap();
        let file = root.create_file("a.txt").unwrap();
        assert_eq!(file.kind(), InodeKind::File);
        assert_eq!(file.nlink().unwrap(), 1);
        assert_eq!(root.lookup("a.txt").unwrap(), file.inum());
        assert_eq!(root.open("a.txt").unwrap().inum(), file.inum());
        match root.create_file("a.txt") {
            Err(VerFSError::AlreadyExists) => (),
            Err(e) => panic!("unexpected error {:?}", e),
            Ok(_) => panic!("created a duplicate"),
        }
    }

    #[test]
    fn new_directories_link_back_to_their_parent() {
        let fs = test_fs(128);
        let root = fs.root().unwrap();
        let sub = root.mkdir("sub").unwrap();
        assert_eq!(sub.nlink().unwrap(), 2);
        assert_eq!(
            sub.entries().unwrap(),
            vec![(".".to_string(), sub.inum()), ("..".to_string(), ROOT_INODE)]
        );
        assert!(sub.write(0, b"x").is_err());
    }

    #[test]
    fn files_do_not_act_as_directories() {
        let fs = test_fs(128);
        let file = fs.root().unwrap().create_file("f").unwrap();
        assert!(matches!(file.lookup("x"), Err(VerFSError::NotADirectory)));
        assert!(matches!(file.entries(), Err(VerFSError::NotADirectory)));
        assert!(matches!(fs.node(file.inum()).unwrap().into_dir(), Err(VerFSError::NotADirectory)));
    }

    #[test]
    fn removing_a_file_frees_blocks_and_inode() {
        let fs = test_fs(256);
        let before = fs.stats();
        let root = fs.root().unwrap();
        let file = root.create_file("big").unwrap();
        file.write(0, &vec![9u8; 20 * BLOCK_SIZE]).unwrap();
        drop(file);

        root.remove("big").unwrap();
        assert!(matches!(root.lookup("big"), Err(VerFSError::DoesNotExist)));
        let after = fs.stats();
        assert_eq!(after.free_blocks, before.free_blocks);
        assert_eq!(after.free_inodes, before.free_inodes);
        fs.check().unwrap();
    }

    #[test]
    fn removing_a_versioned_file_frees_its_history() {
        let (fs, clock) = test_fs_with_clock(256, 1000);
        let before = fs.stats().free_blocks;
        let root = fs.root().unwrap();
        let file = root.create_file("v").unwrap();
        file.write(0, b"one").unwrap();
        file.set_versioning(VersionPolicy::KeepAll).unwrap();
        for fill in [b"two", b"333", b"444"] {
            clock.advance(1);
            file.write(0, fill).unwrap();
        }
        assert_eq!(file.versions().unwrap().len(), 3);

        root.remove("v").unwrap();
        assert_eq!(fs.stats().free_blocks, before);
        assert!(file.size().is_err());
        fs.check().unwrap();
    }

    #[test]
    fn only_empty_directories_can_be_removed() {
        let fs = test_fs(128);
        let root = fs.root().unwrap();
        let sub = root.mkdir("sub").unwrap();
        sub.create_file("inner").unwrap();
        assert!(matches!(root.remove("sub"), Err(VerFSError::DirectoryNotEmpty)));

        sub.remove("inner").unwrap();
        root.remove("sub").unwrap();
        assert!(matches!(root.remove("."), Err(VerFSError::InvalidArgument(_))));
        assert!(matches!(root.remove("missing"), Err(VerFSError::DoesNotExist)));
        fs.check().unwrap();
    }

    #[test]
    fn file_rollback_restores_old_content_and_size() {
        let (fs, clock) = test_fs_with_clock(256, 1000);
        let file = fs.root().unwrap().create_file("r").unwrap();
        file.write(0, b"original").unwrap();
        file.set_versioning(VersionPolicy::KeepAll).unwrap();

        clock.advance(1);
        file.write(0, b"changed and longer").unwrap();
        assert_eq!(file.read_all().unwrap(), b"changed and longer");

        clock.advance(1);
        assert_eq!(file.rollback(1000).unwrap(), 8);
        assert_eq!(file.read_all().unwrap(), b"original");
        // The rollback overwrite was versioned too.
        assert_eq!(file.versions().unwrap().len(), 2);
        assert_eq!(file.retrieve(0, 1002).unwrap(), b"changed and longer");
    }

    #[test]
    fn directory_rollback_restores_a_deleted_entry() {
        let (fs, clock) = test_fs_with_clock(256, 1000);
        let root = fs.root().unwrap();
        root.set_versioning(VersionPolicy::KeepAll).unwrap();
        let file = root.create_file("keep").unwrap();
        let inum = file.inum();
        drop(file);
        let image_time = clock.advance(1);

        // Clear the entry in place, the inode itself stays allocated.
        let entry_offset = 2 * DIR_ENTRY_SIZE as u32;
        clock.advance(1);
        root.rollback_directory(entry_offset, &[0u8; DIR_ENTRY_SIZE]).unwrap();
        assert!(matches!(root.lookup("keep"), Err(VerFSError::DoesNotExist)));

        assert_eq!(root.rollback(image_time).unwrap(), 3 * DIR_ENTRY_SIZE as u32);
        assert_eq!(root.lookup("keep").unwrap(), inum);
        assert!(matches!(root.rollback_directory(3, b"x"), Err(VerFSError::InvalidArgument(_))));
    }

    #[test]
    fn past_content_spans_several_blocks() {
        let (fs, clock) = test_fs_with_clock(256, 1000);
        let file = fs.root().unwrap().create_file("multi").unwrap();
        let mut old = vec![1u8; 2 * BLOCK_SIZE];
        old.extend_from_slice(b"tail");
        file.write(0, &old).unwrap();
        file.set_versioning(VersionPolicy::KeepAll).unwrap();

        clock.advance(1);
        file.write(BLOCK_SIZE as u32, &vec![2u8; BLOCK_SIZE]).unwrap();
        assert_eq!(file.read_at(1000).unwrap(), old);
        assert_eq!(file.read_at(1002).unwrap(), file.read_all().unwrap());
    }

    #[test]
    fn past_directory_listing() {
        let (fs, clock) = test_fs_with_clock(256, 1000);
        let root = fs.root().unwrap();
        root.set_versioning(VersionPolicy::KeepAll).unwrap();
        let inum = root.create_file("gone").unwrap().inum();

        clock.advance(1);
        root.remove("gone").unwrap();
        let then = root.entries_at(1001).unwrap();
        assert!(then.contains(&("gone".to_string(), inum)));
        assert!(!root.entries().unwrap().iter().any(|(name, _)| name == "gone"));
    }

    #[test]
    fn rolled_back_files_do_not_leak_newer_bytes() {
        let (fs, clock) = test_fs_with_clock(256, 1000);
        let file = fs.root().unwrap().create_file("r").unwrap();
        file.write(0, b"original").unwrap();
        file.set_versioning(VersionPolicy::KeepAll).unwrap();
        clock.advance(1);
        file.write(0, &vec![b'n'; 2 * BLOCK_SIZE + 100]).unwrap();
        let free = fs.stats().free_blocks;

        clock.advance(1);
        assert_eq!(file.rollback(1000).unwrap(), 8);
        // The two blocks past the first one are released.
        assert_eq!(fs.stats().free_blocks, free + 2 - 1);

        file.write(20, b"!").unwrap();
        let mut expected = b"original".to_vec();
        expected.extend_from_slice(&[0u8; 12]);
        expected.push(b'!');
        assert_eq!(file.read_all().unwrap(), expected);
        fs.check().unwrap();
    }

    #[test]
    fn raw_directory_writes_must_be_whole_entries() {
        let fs = test_fs(128);
        let root = fs.root().unwrap();
        let size = root.size().unwrap();
        assert!(matches!(
            root.rollback_directory(size, b"x"),
            Err(VerFSError::InvalidArgument(_))
        ));
        assert_eq!(root.size().unwrap(), size);

        root.create_file("n").unwrap();
        assert_eq!(root.lookup("n").unwrap(), root.open("n").unwrap().inum());
        assert_eq!(root.entries().unwrap().len(), 3);
    }
}
