use super::{
    block_cache_sync_all, get_block_cache, Bitmap, BlockDevice, DirOp, FsError, FsResult,
    Geometry, Inode, InodeMode, SuperBlock, VnodeCache, BLOCKS_PER_FORMAT_BLOCK,
    FORMAT_BLOCK_SZ, INODE_MAP_BLOCK, INODE_SZ, MAX_LOG_ZONE_SIZE, ROOT_INODE, SUPERBLOCK_BLOCK,
    VNODE_CACHE_SIZE,
};
use alloc::sync::Arc;
use spin::Mutex;

/// Bits held by one format block of a bitmap
const FORMAT_BLOCK_BITS: usize = FORMAT_BLOCK_SZ * 8;

/// A mounted Minix v3 file system.
///
/// The inode bitmap, the zone bitmap and the vnode cache each sit behind
/// their own lock. Callers holding a vnode lock may take any of them, never
/// the other way round.
pub struct MinixFileSystem {
    /// Real device
    pub block_device: Arc<dyn BlockDevice>,
    sb: SuperBlock,
    geometry: Geometry,
    inode_bitmap: Mutex<Bitmap>,
    zone_bitmap: Mutex<Bitmap>,
    pub(crate) vnodes: Mutex<VnodeCache>,
}

/// File system statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    /// bytes per zone
    pub zone_size: usize,
    /// data zones
    pub total_zones: usize,
    /// data zones not in use
    pub free_zones: usize,
    /// inode numbers
    pub total_inodes: usize,
    /// inode numbers not in use
    pub free_inodes: usize,
}

fn div_ceil(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

impl MinixFileSystem {
    fn from_superblock(block_device: Arc<dyn BlockDevice>, sb: SuperBlock) -> Self {
        let geometry = Geometry::new(&sb);
        // bit 0 is reserved, bit N tracks inode N
        let inode_bitmap = Bitmap::new(
            geometry.imap_start,
            geometry.imap_blocks,
            geometry.ninodes as usize + 1,
        );
        let zone_bitmap = Bitmap::new(
            geometry.zmap_start,
            geometry.zmap_blocks,
            geometry.data_zones as usize + 1,
        );
        Self {
            block_device,
            sb,
            geometry,
            inode_bitmap: Mutex::new(inode_bitmap),
            zone_bitmap: Mutex::new(zone_bitmap),
            vnodes: Mutex::new(VnodeCache::new(VNODE_CACHE_SIZE)),
        }
    }

    /// Open a block device holding a Minix v3 file system
    pub fn mount(block_device: Arc<dyn BlockDevice>) -> FsResult<Arc<Self>> {
        let sb = get_block_cache(
            SUPERBLOCK_BLOCK * BLOCKS_PER_FORMAT_BLOCK,
            Arc::clone(&block_device),
        )
        .lock()
        .read(0, |super_block: &SuperBlock| *super_block);
        if !sb.is_valid() {
            error!("mount: bad superblock magic, not a minix3 file system");
            return Err(FsError::InvalidSuperblock);
        }
        if sb.log_zone_size > MAX_LOG_ZONE_SIZE {
            error!("mount: zone size shift {} out of range", sb.log_zone_size);
            return Err(FsError::InvalidSuperblock);
        }
        if sb.block_size as usize != FORMAT_BLOCK_SZ {
            warn!(
                "mount: block size {} in superblock, using {}",
                sb.block_size, FORMAT_BLOCK_SZ
            );
        }
        let fs = Self::from_superblock(block_device, sb);
        debug!("mount: {:?}", fs.sb);
        Ok(Arc::new(fs))
    }

    /// Write an empty file system of `total_blocks` device blocks with room
    /// for `inode_count` inodes and zones of `1024 << log_zone_size` bytes,
    /// then mount it
    pub fn format(
        block_device: Arc<dyn BlockDevice>,
        total_blocks: usize,
        inode_count: u32,
        log_zone_size: u16,
    ) -> FsResult<Arc<Self>> {
        if inode_count == 0 || log_zone_size > MAX_LOG_ZONE_SIZE {
            return Err(FsError::InvalidArgument);
        }
        let format_blocks = total_blocks / BLOCKS_PER_FORMAT_BLOCK;
        let zones = format_blocks >> log_zone_size;
        let blocks_per_zone = 1usize << log_zone_size;
        let imap_blocks = div_ceil(inode_count as usize + 1, FORMAT_BLOCK_BITS);
        let inode_table_blocks = div_ceil(inode_count as usize * INODE_SZ, FORMAT_BLOCK_SZ);
        let meta_blocks = INODE_MAP_BLOCK + imap_blocks + inode_table_blocks;

        // the zone bitmap shrinks the data area it describes
        let mut zmap_blocks = 1;
        let first_data_zone = loop {
            let first_data_zone = div_ceil(meta_blocks + zmap_blocks, blocks_per_zone);
            let data_zones = zones.saturating_sub(first_data_zone);
            let needed = div_ceil(data_zones + 1, FORMAT_BLOCK_BITS);
            if needed <= zmap_blocks {
                break first_data_zone;
            }
            zmap_blocks = needed;
        };
        if first_data_zone >= zones
            || first_data_zone > u16::MAX as usize
            || zmap_blocks > u16::MAX as usize
            || imap_blocks > u16::MAX as usize
        {
            return Err(FsError::InvalidArgument);
        }

        // clear all blocks
        for i in 0..total_blocks {
            get_block_cache(i, Arc::clone(&block_device))
                .lock()
                .overwrite(|data_block| data_block.fill(0));
        }
        let mut sb = SuperBlock::default();
        sb.initialize(
            inode_count,
            imap_blocks as u16,
            zmap_blocks as u16,
            first_data_zone as u16,
            log_zone_size,
            zones as u32,
        );
        get_block_cache(
            SUPERBLOCK_BLOCK * BLOCKS_PER_FORMAT_BLOCK,
            Arc::clone(&block_device),
        )
        .lock()
        .modify(0, |super_block: &mut SuperBlock| *super_block = sb);

        let fs = Self::from_superblock(block_device, sb);
        fs.inode_bitmap.lock().initialize(&fs.block_device);
        fs.zone_bitmap.lock().initialize(&fs.block_device);

        // create the root directory "/"
        let root = fs.alloc_vnode(InodeMode::DIR | InodeMode::from_bits_truncate(0o755))?;
        if root.number() != ROOT_INODE {
            error!("format: root got inode {}", root.number());
            return Err(FsError::InvalidArgument);
        }
        {
            let mut inner = root.lock();
            inner.disk.nlinks = 2;
            fs.dir_scan_locked(&mut inner, ".", DirOp::Add(ROOT_INODE))?;
            fs.dir_scan_locked(&mut inner, "..", DirOp::Add(ROOT_INODE))?;
        }
        drop(root);
        fs.sync();
        debug!(
            "format: {} zones, {} inodes, first data zone {}",
            zones, inode_count, first_data_zone
        );
        Ok(Arc::new(fs))
    }

    /// Get the root inode of the filesystem
    pub fn root_inode(fs: &Arc<Self>) -> FsResult<Inode> {
        let vnode = fs.get_vnode(ROOT_INODE)?;
        Ok(Inode::new(vnode, Arc::clone(fs)))
    }

    /// Layout figures of this file system
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// The superblock read at mount time
    pub fn superblock(&self) -> &SuperBlock {
        &self.sb
    }

    /// Allocate an inode number
    pub fn alloc_inode(&self) -> FsResult<u32> {
        let mut bitmap = self.inode_bitmap.lock();
        let bit = match bitmap.alloc(&self.block_device) {
            // bit 0 is reserved even on images that leave it clear
            Some(0) => bitmap.alloc(&self.block_device),
            bit => bit,
        };
        let number = bit.ok_or(FsError::ResourceExhausted)? as u32;
        trace!("alloc inode {}", number);
        Ok(number)
    }

    /// Release an inode number
    pub fn dealloc_inode(&self, number: u32) {
        if number == 0 || !self.inode_bitmap.lock().dealloc(&self.block_device, number as usize) {
            warn!("free of inode {} out of range ignored", number);
        }
    }

    /// Allocate a zone, zero filled
    pub fn alloc_zone(&self) -> FsResult<u32> {
        let mut bitmap = self.zone_bitmap.lock();
        let bit = match bitmap.alloc(&self.block_device) {
            Some(0) => bitmap.alloc(&self.block_device),
            bit => bit,
        };
        drop(bitmap);
        let zone = self.geometry.bit_zone(bit.ok_or(FsError::ResourceExhausted)?);
        let first_block = self.geometry.zone_block(zone);
        for block_id in first_block..first_block + self.geometry.blocks_per_zone {
            get_block_cache(block_id, Arc::clone(&self.block_device))
                .lock()
                .overwrite(|data_block| data_block.fill(0));
        }
        trace!("alloc zone {}", zone);
        Ok(zone)
    }

    /// Release a zone; zone 0 means "none" and is ignored
    pub fn dealloc_zone(&self, zone: u32) {
        if zone == 0 {
            return;
        }
        match self.geometry.zone_bit(zone) {
            Some(bit) => {
                self.zone_bitmap.lock().dealloc(&self.block_device, bit);
            }
            None => warn!("free of zone {} outside the data area ignored", zone),
        }
    }

    /// Write back every dirty vnode and every dirty block
    pub fn sync(&self) {
        // the cache lock is released before any vnode lock is taken
        let vnodes = self.vnodes.lock().values();
        for vnode in vnodes {
            let mut inner = vnode.lock();
            self.sync_vnode(&vnode, &mut inner);
        }
        block_cache_sync_all();
    }

    /// Flush everything and forget the cached vnodes
    pub fn unmount(&self) {
        self.sync();
        self.vnodes.lock().drop_unused();
        debug!("unmount");
    }

    /// Totals and free counts of zones and inodes
    pub fn statfs(&self) -> StatFs {
        StatFs {
            zone_size: self.geometry.zone_size,
            total_zones: self.geometry.data_zones as usize,
            free_zones: self.zone_bitmap.lock().count_free(&self.block_device),
            total_inodes: self.geometry.ninodes as usize,
            free_inodes: self.inode_bitmap.lock().count_free(&self.block_device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_device::MemBlockDevice;
    use crate::BLOCK_SZ;

    #[test]
    fn format_then_mount() {
        let device: Arc<dyn BlockDevice> = MemBlockDevice::new(4096);
        let fs = MinixFileSystem::format(Arc::clone(&device), 4096, 256, 0).unwrap();
        let stat = fs.statfs();
        assert_eq!(stat.total_inodes, 256);
        // the root directory holds one inode and one zone
        assert_eq!(stat.free_inodes, 255);
        assert_eq!(stat.free_zones, stat.total_zones - 1);
        let first_data_zone = fs.geometry().first_data_zone;
        drop(fs);

        let fs = MinixFileSystem::mount(device).unwrap();
        assert_eq!(fs.geometry().first_data_zone, first_data_zone);
        assert_eq!(fs.geometry().zone_size, 1024);
        let root = fs.get_vnode(ROOT_INODE).unwrap();
        let inner = root.lock();
        assert!(inner.disk.is_dir());
        assert_eq!(inner.disk.nlinks, 2);
        assert_eq!(inner.disk.size, 1024);
    }

    #[test]
    fn bad_magic_is_refused() {
        let device = MemBlockDevice::new(64);
        let dev: Arc<dyn BlockDevice> = device.clone();
        assert_eq!(
            MinixFileSystem::mount(dev).err(),
            Some(FsError::InvalidSuperblock)
        );
    }

    #[test]
    fn oversized_zone_shift_is_refused() {
        let device: Arc<dyn BlockDevice> = MemBlockDevice::new(1024);
        MinixFileSystem::format(Arc::clone(&device), 1024, 16, 0).unwrap();
        get_block_cache(
            SUPERBLOCK_BLOCK * BLOCKS_PER_FORMAT_BLOCK,
            Arc::clone(&device),
        )
        .lock()
        .modify(0, |sb: &mut SuperBlock| sb.log_zone_size = 60);
        assert_eq!(
            MinixFileSystem::mount(device).err(),
            Some(FsError::InvalidSuperblock)
        );
    }

    #[test]
    fn concurrent_allocations_are_unique() {
        use std::collections::BTreeSet;

        let device: Arc<dyn BlockDevice> = MemBlockDevice::new(4096);
        let fs = MinixFileSystem::format(device, 4096, 256, 0).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let fs = Arc::clone(&fs);
                std::thread::spawn(move || {
                    let zones: Vec<u32> = (0..40).map(|_| fs.alloc_zone().unwrap()).collect();
                    let inodes: Vec<u32> = (0..20).map(|_| fs.alloc_inode().unwrap()).collect();
                    (zones, inodes)
                })
            })
            .collect();
        let mut zones = BTreeSet::new();
        let mut inodes = BTreeSet::new();
        for handle in handles {
            let (z, i) = handle.join().unwrap();
            zones.extend(z);
            inodes.extend(i);
        }
        assert_eq!(zones.len(), 8 * 40);
        assert_eq!(inodes.len(), 8 * 20);
        assert!(!inodes.contains(&ROOT_INODE));
        let stat = fs.statfs();
        assert_eq!(stat.free_zones, stat.total_zones - 1 - 8 * 40);
        assert_eq!(stat.free_inodes, 255 - 8 * 20);
    }

    #[test]
    fn layout_matches_mkfs() {
        let device = MemBlockDevice::new(2880);
        let dev: Arc<dyn BlockDevice> = device.clone();
        let fs = MinixFileSystem::format(dev, 2880, 480, 0).unwrap();
        let sb = fs.superblock();
        assert_eq!(sb.ninodes, 480);
        assert_eq!(sb.imap_blocks, 1);
        assert_eq!(sb.zmap_blocks, 1);
        assert_eq!(sb.zones, 1440);
        // boot, super, imap, zmap and 30 blocks of inodes
        assert_eq!(sb.first_data_zone, 34);
        assert_eq!(device.read_raw(2, 24, 2), vec![0x5a, 0x4d]);
        // bit 0 reserved and bit 1 for the root
        assert_eq!(device.read_raw(4, 0, 1), vec![0b11]);
        assert_eq!(device.read_raw(6, 0, 1), vec![0b11]);
    }

    #[test]
    fn zones_are_zero_filled_and_freed() {
        let device: Arc<dyn BlockDevice> = MemBlockDevice::new(1024);
        let fs = MinixFileSystem::format(Arc::clone(&device), 1024, 32, 1).unwrap();
        let zone = fs.alloc_zone().unwrap();
        let block = fs.geometry().zone_block(zone);
        assert_eq!(fs.geometry().blocks_per_zone, 4);
        get_block_cache(block + 3, Arc::clone(&device))
            .lock()
            .modify(0, |data: &mut [u8; BLOCK_SZ]| data.fill(0xee));
        let free = fs.statfs().free_zones;
        fs.dealloc_zone(zone);
        assert_eq!(fs.statfs().free_zones, free + 1);
        // out-of-range and zero frees leave the bitmap alone
        fs.dealloc_zone(0);
        fs.dealloc_zone(1);
        fs.dealloc_inode(9999);
        assert_eq!(fs.statfs().free_zones, free + 1);

        let mut again = fs.alloc_zone().unwrap();
        while again != zone {
            again = fs.alloc_zone().unwrap();
        }
        get_block_cache(block + 3, Arc::clone(&device))
            .lock()
            .read(0, |data: &[u8; BLOCK_SZ]| assert!(data.iter().all(|b| *b == 0)));
    }

    #[test]
    fn exhaustion() {
        let device: Arc<dyn BlockDevice> = MemBlockDevice::new(256);
        let fs = MinixFileSystem::format(device, 256, 8, 0).unwrap();
        for _ in 0..7 {
            fs.alloc_inode().unwrap();
        }
        assert_eq!(fs.alloc_inode(), Err(FsError::ResourceExhausted));
        while fs.alloc_zone().is_ok() {}
        assert_eq!(fs.statfs().free_zones, 0);
    }
}
