use log::debug;

use crate::cache::Block;
use crate::error::{Result, VerFSError};
use crate::fs::VerFS;
use crate::io::BlockStorage;
use crate::node::Inode;
use crate::BLOCK_SIZE;

impl<T: BlockStorage> VerFS<T> {
    /// Reads up to `buf.len()` bytes starting at `pos`, stopping at the end of
    /// the file. Unmapped blocks inside the file read as zeros.
    pub(crate) fn read_data(&self, inode: &Inode, pos: u32, buf: &mut [u8]) -> Result<usize> {
        if pos >= inode.size {
            return Err(VerFSError::invalid(format!(
                "read at {} past end of inode {} ({} bytes)",
                pos, inode.inum, inode.size
            )));
        }

        let len = buf.len().min((inode.size - pos) as usize);
        let mut done = 0;
        while done < len {
            let at = pos as usize + done;
            let logical = (at / BLOCK_SIZE) as u32;
            let offset = at % BLOCK_SIZE;
            let n = (BLOCK_SIZE - offset).min(len - done);
            let out = &mut buf[done..done + n];

            match self.logical_to_physical(inode, logical)? {
                0 => out.fill(0),
                blocknr => self
                    .cache
                    .get(blocknr)?
                    .read(|b| out.copy_from_slice(&b[offset..offset + n])),
            }
            done += n;
        }
        Ok(len)
    }

    /// Writes `data` at `pos`, allocating blocks for unmapped ranges. Mapped
    /// blocks of a versioned inode have their old content recorded before they
    /// are overwritten. The inode is written back when its size or map changes.
    pub(crate) fn write_data(&self, inode: &mut Inode, pos: u32, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        if pos as u64 + data.len() as u64 > u32::MAX as u64 {
            return Err(VerFSError::invalid(format!(
                "write of {} bytes at {} exceeds the maximum file size",
                data.len(),
                pos
            )));
        }

        let mut dirty = false;
        let written = self.write_blocks(inode, pos, data, &mut dirty);
        if let Ok(n) = written {
            let end = pos as u64 + n as u64;
            if end > inode.size as u64 {
                inode.size = end as u32;
                dirty = true;
            }
        }
        // Blocks mapped before a failure stay reachable from the inode.
        if dirty {
            self.write_inode(inode)?;
        }
        written
    }

    /// Cuts the file down to `size` bytes. The rest of the last kept block is
    /// zeroed and every block past it is freed. Growing is not supported, a
    /// larger `size` leaves the inode alone.
    pub(crate) fn truncate_data(&self, inode: &mut Inode, size: u32) -> Result<()> {
        if size >= inode.size {
            return Ok(());
        }
        let offset = size as usize % BLOCK_SIZE;
        if offset != 0 {
            let blocknr = self.logical_to_physical(inode, size / BLOCK_SIZE as u32)?;
            if blocknr != 0 {
                self.cache.get(blocknr)?.modify(|b| b[offset..].fill(0));
            }
        }
        let keep = (size as u64).div_ceil(BLOCK_SIZE as u64) as u32;
        let freed = self.free_block_tail(inode, keep)?;
        inode.size = size;
        self.write_inode(inode)?;
        debug!(
            "truncate_data: inum {} to {} bytes, freed {} blocks",
            inode.inum, size, freed
        );
        Ok(())
    }

    fn write_blocks(&self, inode: &mut Inode, pos: u32, data: &[u8], dirty: &mut bool) -> Result<usize> {
        let versioned = inode.policy()?.is_some();
        let mut done = 0;
        while done < data.len() {
            let at = pos as usize + done;
            let logical = (at / BLOCK_SIZE) as u32;
            let offset = at % BLOCK_SIZE;
            let n = (BLOCK_SIZE - offset).min(data.len() - done);

            let mut blocknr = self.logical_to_physical(inode, logical)?;
            if blocknr == 0 {
                blocknr = self.alloc_data_block()?;
                if let Err(e) = self.update_block_map(inode, logical, blocknr) {
                    self.free_data_block(blocknr)?;
                    return Err(e);
                }
                *dirty = true;
                debug!(
                    "write_data: inum {} mapped block {} to {}",
                    inode.inum, logical, blocknr
                );
            } else if versioned {
                let old: Box<Block> = self.cache.get(blocknr)?.read(|b| Box::new(*b));
                self.record_version(inode, logical, &old)?;
            }

            let src = &data[done..done + n];
            self.cache
                .get(blocknr)?
                .modify(|b| b[offset..offset + n].copy_from_slice(src));
            done += n;
        }
        Ok(done)
    }
}
