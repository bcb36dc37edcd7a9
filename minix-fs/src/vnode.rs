use super::{
    get_block_cache, DiskInode, FsError, FsResult, InodeMode, MinixFileSystem, MINIX3_MAX_LINK,
};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, MutexGuard};

/// Vnodes kept in memory per mounted file system
pub const VNODE_CACHE_SIZE: usize = 64;

/// Whether the inode behind a vnode still exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VnodeState {
    /// backed by an allocated inode
    Live,
    /// the last link went away and the inode was reclaimed
    Freed,
}

/// In-memory copy of an inode
pub struct Vnode {
    number: u32,
    inner: Mutex<VnodeInner>,
}

/// The part of a vnode guarded by its lock
pub struct VnodeInner {
    /// copy of the inode table slot
    pub disk: DiskInode,
    dirty: bool,
    state: VnodeState,
}

impl Vnode {
    fn new(number: u32, disk: DiskInode) -> Self {
        Self {
            number,
            inner: Mutex::new(VnodeInner {
                disk,
                dirty: false,
                state: VnodeState::Live,
            }),
        }
    }

    /// Inode number
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Lock the inode copy
    pub fn lock(&self) -> MutexGuard<'_, VnodeInner> {
        self.inner.lock()
    }
}

impl VnodeInner {
    /// The inode copy differs from the table slot
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Whether a sync would write anything
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Lifecycle state
    pub fn state(&self) -> VnodeState {
        self.state
    }

    /// `Stale` once the inode was reclaimed
    pub fn check_live(&self) -> FsResult<()> {
        match self.state {
            VnodeState::Live => Ok(()),
            VnodeState::Freed => Err(FsError::Stale),
        }
    }
}

/// Vnodes of one file system keyed by inode number, at most one per number
pub struct VnodeCache {
    map: BTreeMap<u32, Arc<Vnode>>,
    capacity: usize,
}

impl VnodeCache {
    /// An empty cache holding up to `capacity` vnodes
    pub fn new(capacity: usize) -> Self {
        Self {
            map: BTreeMap::new(),
            capacity,
        }
    }

    fn find(&self, number: u32) -> Option<Arc<Vnode>> {
        self.map.get(&number).cloned()
    }

    fn is_full(&self) -> bool {
        self.map.len() >= self.capacity
    }

    fn add(&mut self, vnode: Arc<Vnode>) {
        self.map.insert(vnode.number, vnode);
    }

    /// Drop `vnode` from the cache if it is the registered one
    fn remove(&mut self, vnode: &Arc<Vnode>) {
        if let Some(cached) = self.map.get(&vnode.number) {
            if Arc::ptr_eq(cached, vnode) {
                self.map.remove(&vnode.number);
            }
        }
    }

    /// Forget every vnode nobody else references
    pub fn drop_unused(&mut self) {
        self.map.retain(|_, vnode| Arc::strong_count(vnode) > 1);
    }

    /// Number of cached vnodes
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Clone every cached vnode
    pub fn values(&self) -> Vec<Arc<Vnode>> {
        self.map.values().cloned().collect()
    }
}

impl MinixFileSystem {
    /// Fetch the vnode of inode `number`, loading it from the inode table on
    /// a miss. An unreferenced vnode is written back and evicted when the
    /// cache is full.
    pub fn get_vnode(&self, number: u32) -> FsResult<Arc<Vnode>> {
        if number == 0 || number > self.geometry().ninodes {
            return Err(FsError::InvalidArgument);
        }
        let mut vnodes = self.vnodes.lock();
        if let Some(vnode) = vnodes.find(number) {
            return Ok(vnode);
        }
        if vnodes.is_full() {
            self.evict_unused(&mut vnodes)?;
        }
        let (block_id, offset) = self.geometry().inode_pos(number);
        let disk = get_block_cache(block_id, Arc::clone(&self.block_device))
            .lock()
            .read(offset, |disk_inode: &DiskInode| *disk_inode);
        let vnode = Arc::new(Vnode::new(number, disk));
        vnodes.add(Arc::clone(&vnode));
        Ok(vnode)
    }

    /// Evict the first vnode only the cache references
    fn evict_unused(&self, vnodes: &mut VnodeCache) -> FsResult<()> {
        let victim = vnodes
            .map
            .values()
            .find(|vnode| Arc::strong_count(vnode) == 1)
            .cloned()
            .ok_or(FsError::CacheFull)?;
        // nobody else holds a reference, so the lock is free
        if let Some(mut inner) = victim.inner.try_lock() {
            self.sync_vnode(&victim, &mut inner);
        } else {
            return Err(FsError::CacheFull);
        }
        trace!("vnode cache: evict inode {}", victim.number);
        vnodes.remove(&victim);
        Ok(())
    }

    /// Allocate an inode number and hand out its vnode set up as an empty
    /// `mode` object with no links
    pub fn alloc_vnode(&self, mode: InodeMode) -> FsResult<Arc<Vnode>> {
        let number = self.alloc_inode()?;
        let vnode = match self.get_vnode(number) {
            Ok(vnode) => vnode,
            Err(err) => {
                self.dealloc_inode(number);
                return Err(err);
            }
        };
        let mut inner = vnode.lock();
        inner.disk = DiskInode::new(mode);
        inner.state = VnodeState::Live;
        inner.mark_dirty();
        drop(inner);
        Ok(vnode)
    }

    /// Write the inode copy back to its table slot
    pub fn write_inode(&self, number: u32, disk: &DiskInode) {
        let (block_id, offset) = self.geometry().inode_pos(number);
        get_block_cache(block_id, Arc::clone(&self.block_device))
            .lock()
            .modify(offset, |disk_inode: &mut DiskInode| *disk_inode = *disk);
    }

    /// Write back a dirty live vnode and clear its dirty flag
    pub fn sync_vnode(&self, vnode: &Vnode, inner: &mut VnodeInner) {
        if inner.dirty && inner.state == VnodeState::Live {
            self.write_inode(vnode.number, &inner.disk);
            inner.dirty = false;
        }
    }

    /// Add a link, refused at the format's maximum
    pub fn link_inc(&self, inner: &mut VnodeInner) -> FsResult<()> {
        inner.check_live()?;
        if inner.disk.nlinks >= MINIX3_MAX_LINK {
            return Err(FsError::LinkLimit);
        }
        inner.disk.nlinks += 1;
        inner.mark_dirty();
        Ok(())
    }

    /// Drop a link, destroying the inode when none are left
    pub fn link_dec(&self, vnode: &Arc<Vnode>, inner: &mut VnodeInner) -> FsResult<()> {
        inner.check_live()?;
        inner.disk.nlinks = inner.disk.nlinks.saturating_sub(1);
        inner.mark_dirty();
        if inner.disk.nlinks == 0 {
            self.destroy(vnode, inner)?;
        }
        Ok(())
    }

    /// Reclaim an inode: free its zones, clear its table slot and its bitmap
    /// bit. Later operations through any handle see `Stale`.
    pub fn destroy(&self, vnode: &Arc<Vnode>, inner: &mut VnodeInner) -> FsResult<()> {
        inner.check_live()?;
        self.vnodes.lock().remove(vnode);
        if inner.disk.mode().is_device() {
            // the device number is not a zone
            inner.disk.zone[0] = 0;
            inner.disk.size = 0;
        }
        self.truncate_locked(inner, 0)?;
        inner.disk = DiskInode::default();
        self.write_inode(vnode.number, &inner.disk);
        self.dealloc_inode(vnode.number);
        inner.state = VnodeState::Freed;
        inner.dirty = false;
        debug!("destroy inode {}", vnode.number);
        Ok(())
    }

    /// Give up a vnode reference. Once the cache holds the only other one
    /// the vnode is written back and dropped from the cache.
    pub fn release_vnode(&self, vnode: Arc<Vnode>) {
        let mut inner = vnode.lock();
        // get_vnode hands out new references under this lock only
        let mut vnodes = self.vnodes.lock();
        if Arc::strong_count(&vnode) <= 2 {
            self.sync_vnode(&vnode, &mut inner);
            vnodes.remove(&vnode);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_device::MemBlockDevice;
    use crate::BlockDevice;

    fn fs() -> Arc<MinixFileSystem> {
        let device: Arc<dyn BlockDevice> = MemBlockDevice::new(2048);
        MinixFileSystem::format(device, 2048, 128, 0).unwrap()
    }

    #[test]
    fn one_vnode_per_number() {
        let fs = fs();
        let a = fs.get_vnode(5).unwrap();
        let b = fs.get_vnode(5).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(fs.get_vnode(0).err(), Some(FsError::InvalidArgument));
        assert_eq!(fs.get_vnode(129).err(), Some(FsError::InvalidArgument));
    }

    #[test]
    fn full_cache_evicts_only_unused_vnodes() {
        let fs = fs();
        let held: Vec<_> = (1..=VNODE_CACHE_SIZE as u32)
            .map(|number| fs.get_vnode(number).unwrap())
            .collect();
        assert_eq!(
            fs.get_vnode(VNODE_CACHE_SIZE as u32 + 1).err(),
            Some(FsError::CacheFull)
        );
        drop(held);
        assert!(fs.get_vnode(VNODE_CACHE_SIZE as u32 + 1).is_ok());
        assert!(fs.vnodes.lock().len() <= VNODE_CACHE_SIZE);
    }

    #[test]
    fn eviction_writes_dirty_vnodes_back() {
        let fs = fs();
        let vnode = fs.alloc_vnode(InodeMode::FILE).unwrap();
        let number = vnode.number();
        vnode.lock().disk.size = 4321;
        drop(vnode);
        // push it out of the cache
        let held: Vec<_> = (1..=128u32)
            .filter(|n| *n != number)
            .take(VNODE_CACHE_SIZE)
            .map(|n| fs.get_vnode(n).unwrap())
            .collect();
        drop(held);
        assert_eq!(fs.get_vnode(number).unwrap().lock().disk.size, 4321);
    }

    #[test]
    fn link_limit() {
        let fs = fs();
        let vnode = fs.alloc_vnode(InodeMode::FILE).unwrap();
        let mut inner = vnode.lock();
        inner.disk.nlinks = MINIX3_MAX_LINK - 1;
        assert!(fs.link_inc(&mut inner).is_ok());
        assert_eq!(fs.link_inc(&mut inner), Err(FsError::LinkLimit));
        assert_eq!(inner.disk.nlinks, MINIX3_MAX_LINK);
    }

    #[test]
    fn last_link_destroys() {
        let fs = fs();
        let free_before = fs.statfs().free_inodes;
        let vnode = fs.alloc_vnode(InodeMode::FILE).unwrap();
        let number = vnode.number();
        let mut inner = vnode.lock();
        fs.link_inc(&mut inner).unwrap();
        fs.link_dec(&vnode, &mut inner).unwrap();
        assert_eq!(inner.state(), VnodeState::Freed);
        assert_eq!(fs.link_dec(&vnode, &mut inner), Err(FsError::Stale));
        drop(inner);
        assert_eq!(fs.statfs().free_inodes, free_before);
        // a fresh lookup sees the cleared slot, not the freed vnode
        let again = fs.get_vnode(number).unwrap();
        assert!(!Arc::ptr_eq(&again, &vnode));
        assert_eq!(again.lock().disk, DiskInode::default());
    }

    #[test]
    fn racing_lookups_share_one_vnode() {
        let fs = fs();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let fs = Arc::clone(&fs);
                std::thread::spawn(move || {
                    (1..=16u32)
                        .map(|number| fs.get_vnode(number).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let results: Vec<Vec<Arc<Vnode>>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        for vnodes in &results[1..] {
            for (a, b) in vnodes.iter().zip(&results[0]) {
                assert!(Arc::ptr_eq(a, b));
            }
        }
    }

    #[test]
    fn release_keeps_shared_vnodes_cached() {
        let fs = fs();
        let vnode = fs.alloc_vnode(InodeMode::FILE).unwrap();
        let number = vnode.number();
        let other = fs.get_vnode(number).unwrap();
        fs.release_vnode(vnode);
        // still referenced elsewhere, so still the cached one
        assert!(Arc::ptr_eq(&fs.get_vnode(number).unwrap(), &other));

        {
            let mut inner = other.lock();
            inner.disk.size = 77;
            inner.mark_dirty();
        }
        fs.release_vnode(other);
        let again = fs.get_vnode(number).unwrap();
        assert_eq!(again.lock().disk.size, 77);
        assert!(!again.lock().is_dirty());
    }
}
