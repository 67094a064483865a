//! A block device file system that keeps point-in-time history of file and
//! directory blocks.
//!
//! Mount or format a [`VerFS`] over any [`io::BlockStorage`], then work through
//! [`FileNode`] and [`DirNode`] handles. Turning versioning on for a node makes
//! every in-place overwrite save the old block first, which can later be read
//! back with [`NodeOps::retrieve`] and trimmed with [`NodeOps::prune`].

mod alloc;
mod bmap;
mod cache;
mod clock;
mod config;
mod data;
mod dir;
mod error;
mod fs;
mod handle;
pub mod io;
mod node;
mod sb;
mod version;

pub const BLOCK_SIZE: usize = 4096;
pub const BITS_PER_BLOCK: usize = BLOCK_SIZE * 8;

pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::{FormatOptions, MountOptions, DEFAULT_BYTES_PER_INODE};
pub use crate::dir::{DIR_ENTRY_SIZE, DIR_NAME_MAX};
pub use crate::error::{Result, VerFSError};
pub use crate::fs::{FsStats, VerFS};
pub use crate::handle::{DirNode, FileNode, Node, NodeOps};
pub use crate::node::{InodeKind, ROOT_INODE};
pub use crate::version::{VersionEntry, VersionPolicy, ENTRIES_PER_META_BLOCK};
