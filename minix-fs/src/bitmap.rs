use super::{get_block_cache, BlockDevice, BLOCK_SZ};
use alloc::sync::Arc;

/// A bitmap block, bit `i` is bit `i % 8` of byte `i / 8`
type BitmapBlock = [u8; BLOCK_SZ];
/// Number of bits in a block
const BLOCK_BITS: usize = BLOCK_SZ * 8;

/// A bitmap spread over consecutive device blocks, with a rotating search
/// cursor so allocation under churn does not rescan from the start.
pub struct Bitmap {
    start_block_id: usize,
    blocks: usize,
    /// bits past this one are never handed out
    limit: usize,
    /// where the next scan starts
    cursor: usize,
}

/// Decompose bits into (block_pos, byte_pos, inner_pos)
fn decomposition(mut bit: usize) -> (usize, usize, usize) {
    let block_pos = bit / BLOCK_BITS;
    bit %= BLOCK_BITS;
    (block_pos, bit / 8, bit % 8)
}

/// First clear bit of `bitmap_block` in `from..to`; full bytes are skipped whole
fn first_clear(bitmap_block: &BitmapBlock, from: usize, to: usize) -> Option<usize> {
    let mut bit = from;
    while bit < to {
        let byte = bitmap_block[bit / 8];
        if bit % 8 == 0 && byte == u8::MAX {
            bit += 8;
            continue;
        }
        if byte & (1u8 << (bit % 8)) == 0 {
            return Some(bit);
        }
        bit += 1;
    }
    None
}

impl Bitmap {
    /// A bitmap of `blocks` device blocks from `start_block_id`, tracking
    /// `limit` bits at most
    pub fn new(start_block_id: usize, blocks: usize, limit: usize) -> Self {
        Self {
            start_block_id,
            blocks,
            limit: limit.min(blocks * BLOCK_BITS),
            cursor: 0,
        }
    }

    /// Set the first clear bit at or after the cursor, wrapping around once.
    /// `None` once every bit is set.
    pub fn alloc(&mut self, block_device: &Arc<dyn BlockDevice>) -> Option<usize> {
        if self.limit == 0 {
            return None;
        }
        let start = if self.cursor < self.limit { self.cursor } else { 0 };
        for (from, to) in [(start, self.limit), (0, start)] {
            let mut bit = from;
            while bit < to {
                let block_pos = bit / BLOCK_BITS;
                let base = block_pos * BLOCK_BITS;
                let block_end = (base + BLOCK_BITS).min(to);
                let block_cache =
                    get_block_cache(self.start_block_id + block_pos, Arc::clone(block_device));
                let mut bitmap = block_cache.lock();
                let found = bitmap.read(0, |bitmap_block: &BitmapBlock| {
                    first_clear(bitmap_block, bit - base, block_end - base)
                });
                if let Some(inner) = found {
                    bitmap.modify(0, |bitmap_block: &mut BitmapBlock| {
                        bitmap_block[inner / 8] |= 1u8 << (inner % 8);
                    });
                    let pos = base + inner;
                    self.cursor = if pos + 1 < self.limit { pos + 1 } else { 0 };
                    return Some(pos);
                }
                bit = block_end;
            }
        }
        None
    }

    /// Clear `bit`. Clearing a clear bit is harmless; bits past the limit are
    /// refused with `false`.
    pub fn dealloc(&mut self, block_device: &Arc<dyn BlockDevice>, bit: usize) -> bool {
        if bit >= self.limit {
            return false;
        }
        let (block_pos, byte_pos, inner_pos) = decomposition(bit);
        get_block_cache(block_pos + self.start_block_id, Arc::clone(block_device))
            .lock()
            .modify(0, |bitmap_block: &mut BitmapBlock| {
                bitmap_block[byte_pos] &= !(1u8 << inner_pos);
            });
        true
    }

    /// Whether `bit` is set
    pub fn is_set(&self, block_device: &Arc<dyn BlockDevice>, bit: usize) -> bool {
        let (block_pos, byte_pos, inner_pos) = decomposition(bit);
        get_block_cache(block_pos + self.start_block_id, Arc::clone(block_device))
            .lock()
            .read(0, |bitmap_block: &BitmapBlock| {
                bitmap_block[byte_pos] & (1u8 << inner_pos) != 0
            })
    }

    /// Reserve bit 0 and every bit past the limit, as mkfs does
    pub fn initialize(&self, block_device: &Arc<dyn BlockDevice>) {
        for block_pos in 0..self.blocks {
            let base = block_pos * BLOCK_BITS;
            get_block_cache(self.start_block_id + block_pos, Arc::clone(block_device))
                .lock()
                .overwrite(|bitmap_block| {
                    bitmap_block.fill(0);
                    for bit in 0..BLOCK_BITS {
                        let abs = base + bit;
                        if abs == 0 || abs >= self.limit {
                            bitmap_block[bit / 8] |= 1u8 << (bit % 8);
                        }
                    }
                });
        }
    }

    /// Number of clear bits below the limit
    pub fn count_free(&self, block_device: &Arc<dyn BlockDevice>) -> usize {
        let mut free = 0;
        for block_pos in 0..self.blocks {
            let base = block_pos * BLOCK_BITS;
            if base >= self.limit {
                break;
            }
            let bits = (self.limit - base).min(BLOCK_BITS);
            free += get_block_cache(self.start_block_id + block_pos, Arc::clone(block_device))
                .lock()
                .read(0, |bitmap_block: &BitmapBlock| {
                    (0..bits)
                        .filter(|bit| bitmap_block[bit / 8] & (1u8 << (bit % 8)) == 0)
                        .count()
                });
        }
        free
    }

    /// Where the next scan starts
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Get the max number of allocatable bits
    pub fn maximum(&self) -> usize {
        self.limit
    }
}
