use log::debug;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{Result, VerFSError};
use crate::fs::VerFS;
use crate::io::BlockStorage;
use crate::node::Inode;
use crate::BLOCK_SIZE;

pub const DIR_NAME_MAX: usize = 60;
pub const DIR_ENTRY_SIZE: usize = 64;

/// One slot of a directory file. An inode number of 0 marks a deleted slot.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub inum: u32,
    /// NUL padded, not NUL terminated when the name is exactly 60 bytes.
    pub name: [u8; DIR_NAME_MAX],
}

const _: () = assert!(std::mem::size_of::<DirEntry>() == DIR_ENTRY_SIZE);

/// Checks that `name` can be stored in a directory entry.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name.contains('\0') {
        return Err(VerFSError::invalid(format!("bad file name {:?}", name)));
    }
    if name.len() > DIR_NAME_MAX {
        return Err(VerFSError::NameTooLong);
    }
    Ok(())
}

impl DirEntry {
    pub fn new(name: &str, inum: u32) -> Result<Self> {
        validate_name(name)?;
        let mut entry = DirEntry::new_zeroed();
        entry.inum = inum;
        entry.name[..name.len()].copy_from_slice(name.as_bytes());
        Ok(entry)
    }

    pub fn name_bytes(&self) -> &[u8] {
        let end = self
            .name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(DIR_NAME_MAX);
        &self.name[..end]
    }

    pub fn name(&self) -> String {
        String::from_utf8_lossy(self.name_bytes()).into_owned()
    }

    pub fn is_free(&self) -> bool {
        self.inum == 0
    }
}

/// Decodes the live entries of a raw directory image.
pub(crate) fn parse_entries(raw: &[u8]) -> Vec<(String, u32)> {
    raw.chunks_exact(DIR_ENTRY_SIZE)
        .filter_map(DirEntry::read_from)
        .filter(|e| !e.is_free())
        .map(|e| (e.name(), e.inum))
        .collect()
}

impl<T: BlockStorage> VerFS<T> {
    /// Walks the directory one block at a time, calling `f` with the byte offset
    /// of every record. Stops at the first record `f` accepts and returns it.
    fn scan_dir<F>(&self, dir: &Inode, mut f: F) -> Result<Option<(u32, DirEntry)>>
    where
        F: FnMut(u32, &DirEntry) -> bool,
    {
        let mut buf = vec![0u8; BLOCK_SIZE];
        let mut pos = 0;
        while pos < dir.size {
            let n = self.read_data(dir, pos, &mut buf)?;
            for (i, raw) in buf[..n].chunks_exact(DIR_ENTRY_SIZE).enumerate() {
                let offset = pos + (i * DIR_ENTRY_SIZE) as u32;
                if let Some(entry) = DirEntry::read_from(raw) {
                    if f(offset, &entry) {
                        return Ok(Some((offset, entry)));
                    }
                }
            }
            pos += n as u32;
        }
        Ok(None)
    }

    fn find_entry(&self, dir: &Inode, name: &str) -> Result<(u32, DirEntry)> {
        self.scan_dir(dir, |_, e| !e.is_free() && e.name_bytes() == name.as_bytes())?
            .ok_or(VerFSError::DoesNotExist)
    }

    pub(crate) fn dir_lookup(&self, dir: &Inode, name: &str) -> Result<u32> {
        Ok(self.find_entry(dir, name)?.1.inum)
    }

    /// Stores `name -> inum` in the first deleted slot, or appends it at the end
    /// of the directory, and bumps the directory's link count.
    pub(crate) fn dir_insert(&self, dir: &mut Inode, name: &str, inum: u32) -> Result<()> {
        let entry = DirEntry::new(name, inum)?;
        let offset = match self.scan_dir(dir, |_, e| e.is_free())? {
            Some((offset, _)) => offset,
            None => dir.size,
        };
        self.write_data(dir, offset, entry.as_bytes())?;
        dir.disk.nlink += 1;
        self.write_inode(dir)?;
        debug!(
            "dir_insert: {:?} -> {} at offset {} of dir {}",
            name, inum, offset, dir.inum
        );
        Ok(())
    }

    /// Clears the record for `name` in place and returns the inode it named.
    /// Deleted slots are never compacted, only reused by later inserts.
    pub(crate) fn dir_remove(&self, dir: &mut Inode, name: &str) -> Result<u32> {
        let (offset, entry) = self.find_entry(dir, name)?;
        self.write_data(dir, offset, DirEntry::new_zeroed().as_bytes())?;
        dir.disk.nlink = dir.disk.nlink.saturating_sub(1);
        self.write_inode(dir)?;
        debug!(
            "dir_remove: {:?} ({}) at offset {} of dir {}",
            name, entry.inum, offset, dir.inum
        );
        Ok(entry.inum)
    }

    /// Lists the live entries, "." and ".." included.
    pub(crate) fn dir_entries(&self, dir: &Inode) -> Result<Vec<(String, u32)>> {
        let mut entries = Vec::new();
        self.scan_dir(dir, |_, e| {
            if !e.is_free() {
                entries.push((e.name(), e.inum));
            }
            false
        })?;
        Ok(entries)
    }

    pub(crate) fn dir_is_empty(&self, dir: &Inode) -> Result<bool> {
        let other = self.scan_dir(dir, |_, e| {
            !e.is_free() && e.name_bytes() != b"." && e.name_bytes() != b".."
        })?;
        Ok(other.is_none())
    }

    /// Writes the "." and ".." records of a fresh directory. Link counts are
    /// set by the caller.
    pub(crate) fn seed_directory(&self, dir: &mut Inode, parent: u32) -> Result<()> {
        let dot = DirEntry::new(".", dir.inum)?;
        let dotdot = DirEntry::new("..", parent)?;
        self.write_data(dir, 0, dot.as_bytes())?;
        self.write_data(dir, DIR_ENTRY_SIZE as u32, dotdot.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testutil::test_fs;
    use crate::node::{InodeKind, ROOT_INODE};

    #[test]
    fn entry_names_are_validated() {
        assert!(DirEntry::new("ok", 3).is_ok());
        assert!(DirEntry::new(&"x".repeat(DIR_NAME_MAX), 3).is_ok());
        match DirEntry::new(&"x".repeat(DIR_NAME_MAX + 1), 3) {
            Err(VerFSError::NameTooLong) => (),
            other => panic!("unexpected result {:?}", other),
        }
        assert!(DirEntry::new("", 3).is_err());
        assert!(DirEntry::new("a/b", 3).is_err());
    }

    #[test]
    fn full_length_names_survive_encoding() {
        let name = "n".repeat(DIR_NAME_MAX);
        let entry = DirEntry::new(&name, 9).unwrap();
        let decoded = DirEntry::read_from(entry.as_bytes()).unwrap();
        assert_eq!(decoded.name(), name);
        assert_eq!(decoded.inum, 9);
    }

    #[test]
    fn root_is_seeded_with_dot_entries() {
        let fs = test_fs(128);
        let root = fs.read_inode(ROOT_INODE).unwrap();
        assert_eq!(
            fs.dir_entries(&root).unwrap(),
            vec![(".".to_string(), 1), ("..".to_string(), 1)]
        );
        assert!(fs.dir_is_empty(&root).unwrap());
    }

    #[test]
    fn insert_then_lookup_then_remove() {
        let fs = test_fs(128);
        let mut root = fs.read_inode(ROOT_INODE).unwrap();
        let nlink = root.disk.nlink;

        fs.dir_insert(&mut root, "a.txt", 7).unwrap();
        assert_eq!(fs.dir_lookup(&root, "a.txt").unwrap(), 7);
        assert_eq!(root.disk.nlink, nlink + 1);
        assert_eq!(root.size, 3 * DIR_ENTRY_SIZE as u32);
        assert!(!fs.dir_is_empty(&root).unwrap());

        assert_eq!(fs.dir_remove(&mut root, "a.txt").unwrap(), 7);
        assert_eq!(root.disk.nlink, nlink);
        match fs.dir_lookup(&root, "a.txt") {
            Err(VerFSError::DoesNotExist) => (),
            other => panic!("unexpected result {:?}", other),
        }
        // The slot is only cleared, never reclaimed.
        assert_eq!(root.size, 3 * DIR_ENTRY_SIZE as u32);
    }

    #[test]
    fn deleted_slots_are_reused_before_appending() {
        let fs = test_fs(128);
        let mut root = fs.read_inode(ROOT_INODE).unwrap();
        fs.dir_insert(&mut root, "a", 2).unwrap();
        fs.dir_insert(&mut root, "b", 3).unwrap();
        fs.dir_remove(&mut root, "a").unwrap();

        fs.dir_insert(&mut root, "c", 4).unwrap();
        assert_eq!(root.size, 4 * DIR_ENTRY_SIZE as u32);
        let names: Vec<String> = fs
            .dir_entries(&root)
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec![".", "..", "c", "b"]);
    }

    #[test]
    fn directories_grow_past_one_block() {
        let fs = test_fs(256);
        let inum = fs.alloc_inode().unwrap();
        let mut dir = crate::node::Inode::new(inum, InodeKind::Directory);
        fs.write_inode(&mut dir).unwrap();
        fs.seed_directory(&mut dir, ROOT_INODE).unwrap();

        let per_block = BLOCK_SIZE / DIR_ENTRY_SIZE;
        for i in 0..per_block {
            fs.dir_insert(&mut dir, &format!("f{}", i), 100 + i as u32).unwrap();
        }
        assert!(dir.size as usize > BLOCK_SIZE);
        assert_ne!(dir.disk.blocks[1], 0);
        assert_eq!(fs.dir_lookup(&dir, &format!("f{}", per_block - 1)).unwrap(), 100 + per_block as u32 - 1);
        assert_eq!(fs.dir_lookup(&dir, "..").unwrap(), ROOT_INODE);
    }
}
