use super::{BlockDevice, BLOCK_SZ};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use lazy_static::*;
use spin::Mutex;

/// Block contents, aligned so on-disk structures can be viewed in place
#[repr(C, align(8))]
struct BlockData([u8; BLOCK_SZ]);

/// Cached block inside memory
pub struct BlockCache {
    /// cached block data
    cache: BlockData,
    /// underlying block id
    block_id: usize,
    /// underlying block device
    block_device: Arc<dyn BlockDevice>,
    /// whether `cache` holds the block contents yet
    uptodate: bool,
    /// whether the block is dirty
    modified: bool,
}

impl BlockCache {
    /// Bind a cache slot to a device block. Nothing is read until the
    /// contents are first accessed, so a full overwrite never touches the disk.
    pub fn new(block_id: usize, block_device: Arc<dyn BlockDevice>) -> Self {
        Self {
            cache: BlockData([0u8; BLOCK_SZ]),
            block_id,
            block_device,
            uptodate: false,
            modified: false,
        }
    }

    fn load(&mut self) {
        if !self.uptodate {
            self.block_device.read_block(self.block_id, &mut self.cache.0);
            self.uptodate = true;
        }
    }

    /// Get the address of an offset inside the cached block data
    fn addr_of_offset(&self, offset: usize) -> usize {
        &self.cache.0[offset] as *const _ as usize
    }

    fn check_view<T>(offset: usize) {
        let type_size = core::mem::size_of::<T>();
        assert!(offset + type_size <= BLOCK_SZ);
        assert_eq!(offset % core::mem::align_of::<T>(), 0);
    }

    /// View the on-disk structure of type `T` at `offset`
    pub fn get_ref<T>(&mut self, offset: usize) -> &T
    where
        T: Sized,
    {
        Self::check_view::<T>(offset);
        self.load();
        let addr = self.addr_of_offset(offset);
        unsafe { &*(addr as *const T) }
    }

    /// Mutable view of the structure at `offset`; marks the block dirty
    pub fn get_mut<T>(&mut self, offset: usize) -> &mut T
    where
        T: Sized,
    {
        Self::check_view::<T>(offset);
        self.load();
        self.modified = true;
        let addr = self.addr_of_offset(offset);
        unsafe { &mut *(addr as *mut T) }
    }

    /// Run `f` over the structure at `offset`
    pub fn read<T, V>(&mut self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        f(self.get_ref(offset))
    }

    /// Run `f` over the structure at `offset`, keeping its changes
    pub fn modify<T, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        f(self.get_mut(offset))
    }

    /// Replace the whole block without reading it first
    pub fn overwrite<V>(&mut self, f: impl FnOnce(&mut [u8; BLOCK_SZ]) -> V) -> V {
        self.uptodate = true;
        self.modified = true;
        f(&mut self.cache.0)
    }

    /// Write the block back if it is dirty
    pub fn sync(&mut self) {
        if self.modified {
            self.modified = false;
            self.block_device.write_block(self.block_id, &self.cache.0);
        }
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        self.sync()
    }
}

/// Use a block cache of 64 blocks
const BLOCK_CACHE_SIZE: usize = 64;

fn device_key(block_device: &Arc<dyn BlockDevice>) -> usize {
    Arc::as_ptr(block_device) as *const () as usize
}

/// FIFO manager of every cached block, shared by all mounted devices.
/// A slot is only replaced when the manager holds its sole reference.
pub struct BlockCacheManager {
    queue: VecDeque<(usize, usize, Arc<Mutex<BlockCache>>)>,
}

impl BlockCacheManager {
    /// An empty manager
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    /// Find the cache of `block_id` on `block_device`, binding a new slot on a miss
    pub fn get_block_cache(
        &mut self,
        block_id: usize,
        block_device: Arc<dyn BlockDevice>,
    ) -> Arc<Mutex<BlockCache>> {
        let device = device_key(&block_device);
        if let Some((_, _, cache)) = self
            .queue
            .iter()
            .find(|(dev, id, _)| *dev == device && *id == block_id)
        {
            Arc::clone(cache)
        } else {
            // substitute
            if self.queue.len() == BLOCK_CACHE_SIZE {
                // from front to tail
                if let Some((idx, _)) = self
                    .queue
                    .iter()
                    .enumerate()
                    .find(|(_, (_, _, cache))| Arc::strong_count(cache) == 1)
                {
                    self.queue.drain(idx..=idx);
                } else {
                    panic!("Run out of BlockCache!");
                }
            }
            let block_cache = Arc::new(Mutex::new(BlockCache::new(block_id, block_device)));
            self.queue
                .push_back((device, block_id, Arc::clone(&block_cache)));
            block_cache
        }
    }
}

lazy_static! {
    /// The global block cache manager
    pub static ref BLOCK_CACHE_MANAGER: Mutex<BlockCacheManager> =
        Mutex::new(BlockCacheManager::new());
}

/// Get the block cache corresponding to the given block id and block device
pub fn get_block_cache(
    block_id: usize,
    block_device: Arc<dyn BlockDevice>,
) -> Arc<Mutex<BlockCache>> {
    BLOCK_CACHE_MANAGER
        .lock()
        .get_block_cache(block_id, block_device)
}

/// Sync all block cache to block device
pub fn block_cache_sync_all() {
    // the manager lock is released before any block lock is taken
    let caches: Vec<Arc<Mutex<BlockCache>>> = BLOCK_CACHE_MANAGER
        .lock()
        .queue
        .iter()
        .map(|(_, _, cache)| Arc::clone(cache))
        .collect();
    for cache in caches {
        cache.lock().sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_device::MemBlockDevice;

    #[test]
    fn overwrite_skips_device_read() {
        let device = MemBlockDevice::new(4);
        device.write_raw(1, 0, &[0xAA; BLOCK_SZ]);
        let dev: Arc<dyn BlockDevice> = device.clone();
        let cache = get_block_cache(1, Arc::clone(&dev));
        cache.lock().overwrite(|data| data.fill(0x11));
        cache
            .lock()
            .read(0, |data: &[u8; BLOCK_SZ]| assert!(data.iter().all(|b| *b == 0x11)));
        assert_eq!(device.reads(), 0);
        drop(cache);
        block_cache_sync_all();
        assert_eq!(device.read_raw(1, 0, 4), vec![0x11; 4]);
    }

    #[test]
    fn caches_are_per_device() {
        let a: Arc<dyn BlockDevice> = MemBlockDevice::new(2);
        let b: Arc<dyn BlockDevice> = MemBlockDevice::new(2);
        get_block_cache(0, Arc::clone(&a))
            .lock()
            .modify(0, |v: &mut u32| *v = 7);
        let seen = get_block_cache(0, Arc::clone(&b))
            .lock()
            .read(0, |v: &u32| *v);
        assert_eq!(seen, 0);
    }
}
