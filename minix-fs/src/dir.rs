use super::{
    encode_name, get_block_cache, DirBlock, DirEntry, FsError, FsResult, MinixFileSystem, Vnode,
    VnodeInner, BLOCK_SZ, DIRENTS_PER_BLOCK, DIRENT_SZ, NAME_LENGTH_LIMIT,
};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// What a directory scan does with the records it walks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirOp {
    /// inode number of the entry named `name`
    Lookup,
    /// inode number of any entry besides "." and "..", `None` when empty
    EmptyCheck,
    /// insert `name` pointing at the given inode
    Add(u32),
    /// zero the entry named `name`, returning the inode it pointed at
    Remove,
}

/// First of the leading `count` records accepted by `pred`, with its index
fn find_record(
    dir_block: &DirBlock,
    count: usize,
    pred: impl Fn(&DirEntry) -> bool,
) -> Option<(usize, u32)> {
    dir_block[..count]
        .iter()
        .enumerate()
        .find(|(_, dirent)| pred(dirent))
        .map(|(i, dirent)| (i, dirent.inode()))
}

impl MinixFileSystem {
    /// Run `visit` over every allocated block of a directory with the number
    /// of records it holds below the directory size. Holes are skipped.
    fn visit_dir_blocks<R>(
        &self,
        inner: &mut VnodeInner,
        mut visit: impl FnMut(usize, usize) -> Option<R>,
    ) -> FsResult<Option<R>> {
        let geometry = self.geometry();
        let entries = inner.disk.size as u64 / DIRENT_SZ as u64;
        let entries_per_zone = (geometry.zone_size / DIRENT_SZ) as u64;
        for vzone in 0..geometry.zones_for(inner.disk.size as u64) {
            let zone = match self.resolve(inner, vzone, false)? {
                Some(zone) => zone,
                None => continue,
            };
            for block in 0..geometry.blocks_per_zone {
                let first = vzone * entries_per_zone + (block * DIRENTS_PER_BLOCK) as u64;
                if first >= entries {
                    break;
                }
                let count = (entries - first).min(DIRENTS_PER_BLOCK as u64) as usize;
                if let Some(hit) = visit(geometry.zone_block(zone) + block, count) {
                    return Ok(Some(hit));
                }
            }
        }
        Ok(None)
    }

    /// Scan a locked directory for `name` and apply `op`.
    ///
    /// `Add` refuses a name that is already present; when no slot is free
    /// the directory grows by one zone.
    pub fn dir_scan_locked(
        &self,
        inner: &mut VnodeInner,
        name: &str,
        op: DirOp,
    ) -> FsResult<Option<u32>> {
        inner.check_live()?;
        if !inner.disk.is_dir() {
            return Err(FsError::NotDirectory);
        }
        let field = match op {
            DirOp::EmptyCheck => [0u8; NAME_LENGTH_LIMIT],
            _ => encode_name(name)?,
        };
        let matches = |dirent: &DirEntry| !dirent.is_free() && dirent.name_field() == &field;
        let block_device = Arc::clone(&self.block_device);

        match op {
            DirOp::Lookup => self.visit_dir_blocks(inner, |block_id, count| {
                get_block_cache(block_id, Arc::clone(&block_device))
                    .lock()
                    .read(0, |dir_block: &DirBlock| find_record(dir_block, count, matches))
                    .map(|(_, inode)| inode)
            }),
            DirOp::EmptyCheck => self.visit_dir_blocks(inner, |block_id, count| {
                get_block_cache(block_id, Arc::clone(&block_device))
                    .lock()
                    .read(0, |dir_block: &DirBlock| {
                        find_record(dir_block, count, |dirent| {
                            !dirent.is_free() && !dirent.is_dot()
                        })
                    })
                    .map(|(_, inode)| inode)
            }),
            DirOp::Remove => self.visit_dir_blocks(inner, |block_id, count| {
                get_block_cache(block_id, Arc::clone(&block_device))
                    .lock()
                    .modify(0, |dir_block: &mut DirBlock| {
                        let hit = find_record(dir_block, count, matches);
                        if let Some((i, _)) = hit {
                            dir_block[i].clear();
                        }
                        hit.map(|(_, inode)| inode)
                    })
            }),
            DirOp::Add(number) => {
                let mut free_slot: Option<(usize, usize)> = None;
                let duplicate = self.visit_dir_blocks(inner, |block_id, count| {
                    get_block_cache(block_id, Arc::clone(&block_device))
                        .lock()
                        .read(0, |dir_block: &DirBlock| {
                            if free_slot.is_none() {
                                free_slot = find_record(dir_block, count, |dirent| {
                                    dirent.is_free()
                                })
                                .map(|(i, _)| (block_id, i * DIRENT_SZ));
                            }
                            find_record(dir_block, count, matches)
                        })
                })?;
                if duplicate.is_some() {
                    return Err(FsError::AlreadyExists);
                }
                let (block_id, offset) = match free_slot {
                    Some(slot) => slot,
                    None => self.grow_dir(inner)?,
                };
                get_block_cache(block_id, block_device)
                    .lock()
                    .modify(offset, |dirent: &mut DirEntry| {
                        *dirent = DirEntry::new(&field, number)
                    });
                Ok(Some(number))
            }
        }
    }

    /// Extend a directory by one zone, returning where its next record goes
    fn grow_dir(&self, inner: &mut VnodeInner) -> FsResult<(usize, usize)> {
        let zone_size = self.geometry().zone_size as u64;
        let size = inner.disk.size as u64;
        let pos = (size + DIRENT_SZ as u64 - 1) / DIRENT_SZ as u64 * DIRENT_SZ as u64;
        let vzone = pos / zone_size;
        let new_size = (vzone + 1) * zone_size;
        if new_size > self.geometry().max_file_size {
            return Err(FsError::CapacityExceeded);
        }
        let zone = self
            .resolve(inner, vzone, true)?
            .ok_or(FsError::ResourceExhausted)?;
        let in_zone = (pos % zone_size) as usize;
        if in_zone != 0 {
            self.zero_zone_from(zone, in_zone);
        }
        inner.disk.size = new_size as u32;
        inner.mark_dirty();
        Ok((
            self.geometry().zone_block(zone) + in_zone / BLOCK_SZ,
            in_zone % BLOCK_SZ,
        ))
    }

    /// Lock `dir` and scan it
    pub fn dir_scan(&self, dir: &Vnode, name: &str, op: DirOp) -> FsResult<Option<u32>> {
        self.dir_scan_locked(&mut dir.lock(), name, op)
    }

    /// Names and inode numbers of every used record, "." and ".." included
    pub fn list_entries(&self, inner: &mut VnodeInner) -> FsResult<Vec<(String, u32)>> {
        inner.check_live()?;
        if !inner.disk.is_dir() {
            return Err(FsError::NotDirectory);
        }
        let block_device = Arc::clone(&self.block_device);
        let mut entries = Vec::new();
        self.visit_dir_blocks(inner, |block_id, count| {
            get_block_cache(block_id, Arc::clone(&block_device))
                .lock()
                .read(0, |dir_block: &DirBlock| {
                    for dirent in dir_block[..count].iter().filter(|d| !d.is_free()) {
                        entries.push((
                            String::from_utf8_lossy(dirent.name()).into_owned(),
                            dirent.inode(),
                        ));
                    }
                });
            None::<()>
        })?;
        Ok(entries)
    }
}
