use super::{
    get_block_cache, Band, DataBlock, FsError, FsResult, MinixFileSystem, VnodeInner, BLOCK_SZ,
    ZONES_PER_BLOCK,
};
use alloc::sync::Arc;
use alloc::vec::Vec;

impl MinixFileSystem {
    /// Device block and byte offset of entry `index` of an indirect table
    fn indirect_pos(&self, table: u32, index: usize) -> (usize, usize) {
        (
            self.geometry().zone_block(table) + index / ZONES_PER_BLOCK,
            (index % ZONES_PER_BLOCK) * 4,
        )
    }

    /// Entry `index` of the indirect table in zone `table`
    pub fn indirect_entry(&self, table: u32, index: usize) -> u32 {
        let (block_id, offset) = self.indirect_pos(table, index);
        get_block_cache(block_id, Arc::clone(&self.block_device))
            .lock()
            .read(offset, |zone: &u32| *zone)
    }

    /// Store `zone` as entry `index` of the indirect table in zone `table`
    pub fn set_indirect_entry(&self, table: u32, index: usize, zone: u32) {
        let (block_id, offset) = self.indirect_pos(table, index);
        get_block_cache(block_id, Arc::clone(&self.block_device))
            .lock()
            .modify(offset, |entry: &mut u32| *entry = zone);
    }

    fn band_of(&self, vzone: u64) -> FsResult<Band> {
        self.geometry().band(vzone).ok_or_else(|| {
            warn!(
                "logical zone {} beyond triple indirect capacity {}",
                vzone,
                self.geometry().boundary[3]
            );
            FsError::CapacityExceeded
        })
    }

    /// Zone holding logical zone `vzone` of a file.
    ///
    /// Reads report a hole as `None`. Writes allocate every missing table
    /// and the data zone on the way down, so they always yield a zone; when
    /// an allocation fails the tables this call added are released again.
    pub fn resolve(
        &self,
        inner: &mut VnodeInner,
        vzone: u64,
        for_write: bool,
    ) -> FsResult<Option<u32>> {
        let (slot, depth, mut offset) = match self.band_of(vzone)? {
            Band::Direct(slot) => (slot, 0, 0),
            Band::Indirect {
                depth,
                slot,
                offset,
            } => (slot, depth, offset),
        };
        // zones this descent allocated, and the table entry linking the
        // first of them when it is not the inode slot
        let mut fresh: Vec<u32> = Vec::new();
        let mut first_link: Option<(u32, usize)> = None;
        let mut zone = inner.disk.zone[slot];
        if zone == 0 {
            if !for_write {
                return Ok(None);
            }
            zone = self.alloc_zone()?;
            inner.disk.zone[slot] = zone;
            inner.mark_dirty();
            fresh.push(zone);
        }
        for level in (0..depth).rev() {
            let divisor = self.geometry().divisor[level];
            let index = (offset / divisor) as usize;
            offset %= divisor;
            let mut next = self.indirect_entry(zone, index);
            if next == 0 {
                if !for_write {
                    return Ok(None);
                }
                next = match self.alloc_zone() {
                    Ok(next) => next,
                    Err(err) => {
                        self.undo_descent(inner, slot, first_link, &fresh);
                        return Err(err);
                    }
                };
                if fresh.is_empty() {
                    first_link = Some((zone, index));
                }
                self.set_indirect_entry(zone, index, next);
                fresh.push(next);
            }
            zone = next;
        }
        Ok(Some(zone))
    }

    /// Unlink and free the tables a failed descent allocated
    fn undo_descent(
        &self,
        inner: &mut VnodeInner,
        slot: usize,
        first_link: Option<(u32, usize)>,
        fresh: &[u32],
    ) {
        if fresh.is_empty() {
            return;
        }
        match first_link {
            Some((table, index)) => self.set_indirect_entry(table, index, 0),
            None => {
                inner.disk.zone[slot] = 0;
                inner.mark_dirty();
            }
        }
        for zone in fresh {
            self.dealloc_zone(*zone);
        }
    }

    /// Zero zone `zone` from byte `from` to its end
    pub fn zero_zone_from(&self, zone: u32, from: usize) {
        let first_block = self.geometry().zone_block(zone);
        for block in from / BLOCK_SZ..self.geometry().blocks_per_zone {
            let cache = get_block_cache(first_block + block, Arc::clone(&self.block_device));
            let mut cache = cache.lock();
            if block == from / BLOCK_SZ && from % BLOCK_SZ != 0 {
                cache.modify(0, |data_block: &mut DataBlock| {
                    data_block[from % BLOCK_SZ..].fill(0)
                });
            } else {
                cache.overwrite(|data_block| data_block.fill(0));
            }
        }
    }

    /// Free the leaf of `offset` below a `depth`-level table, then report
    /// whether the table itself covers nothing that is kept
    fn free_indirect(&self, table: u32, depth: usize, offset: u64) -> bool {
        let level = depth - 1;
        let divisor = self.geometry().divisor[level];
        let index = (offset / divisor) as usize;
        let entry = self.indirect_entry(table, index);
        if entry != 0 {
            let release = level == 0 || self.free_indirect(entry, level, offset % divisor);
            if release {
                self.dealloc_zone(entry);
                self.set_indirect_entry(table, index, 0);
            }
        }
        // logical zones go away last to first, so the first entry going
        // means the whole table is unused
        offset == 0
    }

    /// Return logical zone `vzone` and every table left covering nothing
    fn free_logical_zone(&self, inner: &mut VnodeInner, vzone: u64) -> FsResult<()> {
        match self.band_of(vzone)? {
            Band::Direct(slot) => {
                let zone = inner.disk.zone[slot];
                if zone != 0 {
                    self.dealloc_zone(zone);
                    inner.disk.zone[slot] = 0;
                    inner.mark_dirty();
                }
            }
            Band::Indirect {
                depth,
                slot,
                offset,
            } => {
                let table = inner.disk.zone[slot];
                if table != 0 && self.free_indirect(table, depth, offset) {
                    self.dealloc_zone(table);
                    inner.disk.zone[slot] = 0;
                    inner.mark_dirty();
                }
            }
        }
        Ok(())
    }

    /// Set the size of a locked file, freeing zones past the new end. The
    /// kept part of a partial last zone is zero filled past the end.
    pub fn truncate_locked(&self, inner: &mut VnodeInner, new_size: u64) -> FsResult<()> {
        inner.check_live()?;
        if new_size > self.geometry().max_file_size {
            return Err(FsError::CapacityExceeded);
        }
        let size = inner.disk.size as u64;
        let allocated = self.geometry().zones_for(size);
        let needed = self.geometry().zones_for(new_size);
        for vzone in (needed..allocated).rev() {
            self.free_logical_zone(inner, vzone)?;
        }
        let zone_size = self.geometry().zone_size as u64;
        if new_size < size && new_size % zone_size != 0 {
            if let Some(zone) = self.resolve(inner, new_size / zone_size, false)? {
                self.zero_zone_from(zone, (new_size % zone_size) as usize);
            }
        }
        if new_size != size {
            inner.disk.size = new_size as u32;
            inner.mark_dirty();
        }
        Ok(())
    }
}
