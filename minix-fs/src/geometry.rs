use super::{
    SuperBlock, BLOCKS_PER_FORMAT_BLOCK, BLOCK_SZ, DIRECT_ZONES, FORMAT_BLOCK_SZ,
    INDIRECT_DEPTH, INDIRECT_ZONE, INODES_PER_BLOCK, INODE_MAP_BLOCK, INODE_SZ,
};

/// Layout figures derived from the superblock at mount time.
///
/// Block numbers here are device blocks (`BLOCK_SZ`); the superblock counts in
/// 1024-byte format blocks and zones.
#[derive(Debug, Clone)]
pub struct Geometry {
    /// bytes per zone
    pub zone_size: usize,
    /// log2 of format blocks per zone
    pub log_zone_size: u32,
    /// device blocks per zone
    pub blocks_per_zone: usize,
    /// zone numbers held by one indirect zone
    pub zones_per_indirect: u64,
    /// entries of one slot at each level below a table, `divisor[0] == 1`
    pub divisor: [u64; INDIRECT_DEPTH],
    /// first logical zone past the direct, single, double and triple bands
    pub boundary: [u64; INDIRECT_DEPTH + 1],
    /// first device block of the inode bitmap
    pub imap_start: usize,
    /// device blocks of the inode bitmap
    pub imap_blocks: usize,
    /// first device block of the zone bitmap
    pub zmap_start: usize,
    /// device blocks of the zone bitmap
    pub zmap_blocks: usize,
    /// first device block of the inode table
    pub inode_table_start: usize,
    /// zone number tracked by bit 1 of the zone bitmap
    pub first_data_zone: u32,
    /// number of inodes
    pub ninodes: u32,
    /// number of data zones
    pub data_zones: u32,
    /// largest byte size a file may reach
    pub max_file_size: u64,
}

/// Where a logical zone lives inside an inode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    /// held directly by zone slot `.0`
    Direct(usize),
    /// `depth` tables below zone slot `slot`, `offset` zones into that subtree
    Indirect {
        /// levels of tables to walk
        depth: usize,
        /// inode zone slot rooting the subtree
        slot: usize,
        /// logical zone relative to the first one of the band
        offset: u64,
    },
}

impl Geometry {
    /// Derive the geometry of a superblock
    pub fn new(sb: &SuperBlock) -> Self {
        let log_zone_size = sb.log_zone_size as u32;
        let zone_size = FORMAT_BLOCK_SZ << log_zone_size;
        let zones_per_indirect = (zone_size / 4) as u64;

        let mut divisor = [1u64; INDIRECT_DEPTH];
        for i in 1..INDIRECT_DEPTH {
            divisor[i] = divisor[i - 1] * zones_per_indirect;
        }
        let mut boundary = [DIRECT_ZONES as u64; INDIRECT_DEPTH + 1];
        for i in 1..=INDIRECT_DEPTH {
            boundary[i] = boundary[i - 1] + divisor[i - 1] * zones_per_indirect;
        }

        let imap_start = INODE_MAP_BLOCK * BLOCKS_PER_FORMAT_BLOCK;
        let imap_blocks = sb.imap_blocks as usize * BLOCKS_PER_FORMAT_BLOCK;
        let zmap_start = imap_start + imap_blocks;
        let zmap_blocks = sb.zmap_blocks as usize * BLOCKS_PER_FORMAT_BLOCK;
        let first_data_zone = sb.first_data_zone as u32;

        let mut max_file_size = (boundary[INDIRECT_DEPTH] * zone_size as u64).min(u32::MAX as u64);
        if sb.max_size != 0 {
            max_file_size = max_file_size.min(sb.max_size as u64);
        }

        Self {
            zone_size,
            log_zone_size,
            blocks_per_zone: zone_size / BLOCK_SZ,
            zones_per_indirect,
            divisor,
            boundary,
            imap_start,
            imap_blocks,
            zmap_start,
            zmap_blocks,
            inode_table_start: zmap_start + zmap_blocks,
            first_data_zone,
            ninodes: sb.ninodes,
            data_zones: sb.zones.saturating_sub(first_data_zone),
            max_file_size,
        }
    }

    /// Classify a logical zone; `None` past triple indirection
    pub fn band(&self, vzone: u64) -> Option<Band> {
        if vzone < self.boundary[0] {
            return Some(Band::Direct(vzone as usize));
        }
        (1..=INDIRECT_DEPTH)
            .find(|depth| vzone < self.boundary[*depth])
            .map(|depth| Band::Indirect {
                depth,
                slot: INDIRECT_ZONE + depth - 1,
                offset: vzone - self.boundary[depth - 1],
            })
    }

    /// First device block of a zone
    pub fn zone_block(&self, zone: u32) -> usize {
        ((zone as usize) << self.log_zone_size) * BLOCKS_PER_FORMAT_BLOCK
    }

    /// Zone bitmap bit tracking `zone`, if it is a data zone
    pub fn zone_bit(&self, zone: u32) -> Option<usize> {
        if zone < self.first_data_zone || zone - self.first_data_zone >= self.data_zones {
            return None;
        }
        Some((zone - self.first_data_zone) as usize + 1)
    }

    /// Zone tracked by zone bitmap bit `bit`
    pub fn bit_zone(&self, bit: usize) -> u32 {
        self.first_data_zone + bit as u32 - 1
    }

    /// Device block and byte offset of inode `number` in the inode table
    pub fn inode_pos(&self, number: u32) -> (usize, usize) {
        let index = number as usize - 1;
        (
            self.inode_table_start + index / INODES_PER_BLOCK,
            (index % INODES_PER_BLOCK) * INODE_SZ,
        )
    }

    /// Zones needed to hold `size` bytes
    pub fn zones_for(&self, size: u64) -> u64 {
        (size + self.zone_size as u64 - 1) / self.zone_size as u64
    }
}
