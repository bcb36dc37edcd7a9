use super::{
    get_block_cache, DataBlock, FsError, FsResult, Inode, InodeMode, MinixFileSystem, VnodeInner,
    BLOCK_SZ,
};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

impl MinixFileSystem {
    /// Read from a locked file at `offset`, never past its size. Stops early
    /// at the first hole.
    pub fn read_vnode(
        &self,
        inner: &mut VnodeInner,
        offset: u64,
        buf: &mut [u8],
    ) -> FsResult<usize> {
        inner.check_live()?;
        let size = inner.disk.size as u64;
        if offset >= size {
            return Ok(0);
        }
        let end = (offset + buf.len() as u64).min(size);
        let zone_size = self.geometry().zone_size as u64;
        let mut pos = offset;
        let mut read_size = 0usize;
        while pos < end {
            let zone = match self.resolve(inner, pos / zone_size, false)? {
                Some(zone) => zone,
                None => break,
            };
            let in_zone = (pos % zone_size) as usize;
            let block_id = self.geometry().zone_block(zone) + in_zone / BLOCK_SZ;
            let block_offset = in_zone % BLOCK_SZ;
            let chunk = (BLOCK_SZ - block_offset).min((end - pos) as usize);
            let dst = &mut buf[read_size..read_size + chunk];
            get_block_cache(block_id, Arc::clone(&self.block_device))
                .lock()
                .read(0, |data_block: &DataBlock| {
                    dst.copy_from_slice(&data_block[block_offset..block_offset + chunk]);
                });
            read_size += chunk;
            pos += chunk as u64;
        }
        Ok(read_size)
    }

    /// Write to a locked file at `offset`, allocating zones as needed and
    /// extending its size. Only the maximum file size clips the transfer.
    pub fn write_vnode(
        &self,
        inner: &mut VnodeInner,
        offset: u64,
        buf: &[u8],
    ) -> FsResult<usize> {
        inner.check_live()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let max_size = self.geometry().max_file_size;
        if offset >= max_size {
            return Err(FsError::CapacityExceeded);
        }
        let end = (offset + buf.len() as u64).min(max_size);
        let zone_size = self.geometry().zone_size as u64;
        let mut pos = offset;
        let mut write_size = 0usize;
        while pos < end {
            let zone = match self.resolve(inner, pos / zone_size, true) {
                Ok(Some(zone)) => zone,
                Ok(None) => break,
                Err(err) if write_size == 0 => return Err(err),
                Err(err) => {
                    warn!("short write of {} bytes at {}: {}", write_size, offset, err);
                    break;
                }
            };
            let in_zone = (pos % zone_size) as usize;
            let block_id = self.geometry().zone_block(zone) + in_zone / BLOCK_SZ;
            let block_offset = in_zone % BLOCK_SZ;
            let chunk = (BLOCK_SZ - block_offset).min((end - pos) as usize);
            let src = &buf[write_size..write_size + chunk];
            let block_cache = get_block_cache(block_id, Arc::clone(&self.block_device));
            if chunk == BLOCK_SZ {
                block_cache
                    .lock()
                    .overwrite(|data_block| data_block.copy_from_slice(src));
            } else {
                block_cache
                    .lock()
                    .modify(0, |data_block: &mut DataBlock| {
                        data_block[block_offset..block_offset + chunk].copy_from_slice(src);
                    });
            }
            write_size += chunk;
            pos += chunk as u64;
            if pos > inner.disk.size as u64 {
                inner.disk.size = pos as u32;
                inner.mark_dirty();
            }
        }
        Ok(write_size)
    }
}

bitflags! {
    /// Open file flags
    pub struct OpenFlags: u32 {
        /// Read only
        const RDONLY = 0;
        /// Write only
        const WRONLY = 1 << 0;
        /// Read & Write
        const RDWR = 1 << 1;
        /// Allow create
        const CREATE = 1 << 9;
        /// Clear file and return an empty one
        const TRUNC = 1 << 10;
    }
}

impl OpenFlags {
    /// Return (readable, writable) from the access mode bits
    pub fn read_write(&self) -> (bool, bool) {
        let access = *self & (Self::WRONLY | Self::RDWR);
        if access.is_empty() {
            (true, false)
        } else if self.contains(Self::WRONLY) {
            (false, true)
        } else {
            (true, true)
        }
    }
}

/// Where a seek is measured from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    /// from the start of the file
    Start(u64),
    /// from the current offset
    Current(i64),
    /// from the end of the file
    End(i64),
}

/// An opened file: an inode, an offset and the directions it was opened for
pub struct File {
    readable: bool,
    writable: bool,
    offset: Mutex<u64>,
    inode: Arc<Inode>,
}

impl File {
    /// Open `inode` for reading and/or writing from offset 0
    pub fn new(readable: bool, writable: bool, inode: Arc<Inode>) -> Self {
        Self {
            readable,
            writable,
            offset: Mutex::new(0),
            inode,
        }
    }

    /// The file readable?
    pub fn readable(&self) -> bool {
        self.readable
    }

    /// The file writable?
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// The inode behind this file
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// Read at the current offset and advance it
    pub fn read(&self, buf: &mut [u8]) -> FsResult<usize> {
        if !self.readable {
            return Err(FsError::AccessDenied);
        }
        let mut offset = self.offset.lock();
        let read_size = self.inode.read_at(*offset, buf)?;
        *offset += read_size as u64;
        Ok(read_size)
    }

    /// Write at the current offset and advance it
    pub fn write(&self, buf: &[u8]) -> FsResult<usize> {
        if !self.writable {
            return Err(FsError::AccessDenied);
        }
        let mut offset = self.offset.lock();
        let write_size = self.inode.write_at(*offset, buf)?;
        *offset += write_size as u64;
        Ok(write_size)
    }

    /// Move the offset; landing before the start is `InvalidArgument`
    pub fn seek(&self, pos: SeekFrom) -> FsResult<u64> {
        let mut offset = self.offset.lock();
        let (base, delta) = match pos {
            SeekFrom::Start(start) => (start as i128, 0),
            SeekFrom::Current(delta) => (*offset as i128, delta),
            SeekFrom::End(delta) => (self.inode.size()? as i128, delta),
        };
        let target = base + delta as i128;
        if target < 0 || target > u64::MAX as i128 {
            return Err(FsError::InvalidArgument);
        }
        *offset = target as u64;
        Ok(*offset)
    }

    /// Set the file size
    pub fn truncate(&self, size: u64) -> FsResult<()> {
        if !self.writable {
            return Err(FsError::AccessDenied);
        }
        self.inode.truncate(size)
    }

    /// Flush the inode and its blocks
    pub fn sync(&self) -> FsResult<()> {
        self.inode.sync()
    }

    /// Sync and let go of the file
    pub fn close(self) -> FsResult<()> {
        self.sync()
    }

    /// Read everything from the current offset to the end
    pub fn read_all(&self) -> FsResult<Vec<u8>> {
        let mut buffer = [0u8; BLOCK_SZ];
        let mut v: Vec<u8> = Vec::new();
        loop {
            let len = self.read(&mut buffer)?;
            if len == 0 {
                break;
            }
            v.extend_from_slice(&buffer[..len]);
        }
        Ok(v)
    }
}

/// Open the file at `path` below `root`
pub fn open_file(root: &Inode, path: &str, flags: OpenFlags) -> FsResult<File> {
    let (readable, writable) = flags.read_write();
    let (inode, created) = match root.find_path(path) {
        Ok(inode) => (inode, false),
        Err(FsError::NotFound) if flags.contains(OpenFlags::CREATE) => {
            let path = path.trim_end_matches('/');
            let (parent, name) = match path.rsplit_once('/') {
                Some((parent, name)) => (root.find_path(parent)?, name),
                None => (root.find_path("")?, path),
            };
            let mode = InodeMode::FILE | InodeMode::from_bits_truncate(0o644);
            (parent.mknod(name, mode, 0)?, true)
        }
        Err(err) => return Err(err),
    };
    let mode = inode.stat()?.mode;
    if mode.is_device() {
        return Err(FsError::InvalidArgument);
    }
    if writable && mode.is_dir() {
        return Err(FsError::IsDirectory);
    }
    // clear size
    if writable && !created && flags.intersects(OpenFlags::CREATE | OpenFlags::TRUNC) {
        inode.clear()?;
    }
    Ok(File::new(readable, writable, inode))
}
