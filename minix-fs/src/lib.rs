//! A Minix v3 file system isolated from the kernel
#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

// minix-fs talks to the disk driver only through the `BlockDevice` trait, so it
// can be developed and tested on the host and linked into the kernel unchanged.
//
// Layers, bottom up:
// 1. block device interface: read/write one device block
// 2. block cache: device blocks cached in memory, written back when dirty
// 3. on-disk layout: superblock, inode, directory entry (layout.rs) and the
//    numbers derived from them (geometry.rs)
// 4. allocation and addressing: bitmaps (bitmap.rs), zone translation and
//    truncation (zone.rs)
// 5. objects: vnodes (vnode.rs), directories (dir.rs), byte-range I/O (file.rs)
// 6. namespace handles exposed to the kernel (vfs.rs)
//
// Disk layout in 1024-byte format blocks:
// 0 boot | 1 superblock | inode bitmap | zone bitmap | inode table | data zones

extern crate alloc;
#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

mod bitmap;
mod block_cache;
mod block_dev;
mod dir;
mod error;
mod file;
mod geometry;
mod layout;
mod mfs;
#[cfg(test)]
mod test_device;
mod vfs;
mod vnode;
mod zone;

/// Use a device block size of 512 bytes
pub const BLOCK_SZ: usize = 512;
/// Minix v3 format block size
pub const FORMAT_BLOCK_SZ: usize = 1024;
/// Device blocks making up one format block
pub const BLOCKS_PER_FORMAT_BLOCK: usize = FORMAT_BLOCK_SZ / BLOCK_SZ;

use bitmap::Bitmap;
use block_cache::{block_cache_sync_all, get_block_cache};
pub use block_dev::BlockDevice;
pub use dir::DirOp;
pub use error::{FsError, FsResult};
pub use file::{open_file, File, OpenFlags, SeekFrom};
pub use geometry::{Band, Geometry};
use layout::*;
pub use layout::{
    DiskInode, InodeMode, SuperBlock, DIRENT_SZ, MINIX3_MAX_LINK, NAME_LENGTH_LIMIT, ROOT_INODE,
};
pub use mfs::{MinixFileSystem, StatFs};
pub use vfs::{FileSystemType, Inode, Minix3, Stat, VnodeOps};
use vnode::VnodeCache;
pub use vnode::{Vnode, VnodeInner, VnodeState, VNODE_CACHE_SIZE};
