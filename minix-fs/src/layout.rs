use super::{FsError, FsResult, BLOCK_SZ, FORMAT_BLOCK_SZ};
use core::fmt::{self, Debug, Formatter};

/// Magic number of a Minix v3 file system
pub const MINIX3_SUPER_MAGIC: u16 = 0x4d5a;
/// Largest link count an inode may carry
pub const MINIX3_MAX_LINK: u16 = 65530;
/// Length of the name field of a directory entry
pub const NAME_LENGTH_LIMIT: usize = 60;
/// Inode number of the root directory
pub const ROOT_INODE: u32 = 1;
/// Format block holding the superblock
pub const SUPERBLOCK_BLOCK: usize = 1;
/// Format block where the inode bitmap starts
pub const INODE_MAP_BLOCK: usize = 2;
/// Zone slots in an inode
pub const INODE_ZONES: usize = 10;
/// Direct zone slots in an inode
pub const DIRECT_ZONES: usize = 7;
/// Slot of the single indirect zone
pub const INDIRECT_ZONE: usize = 7;
/// Slot of the double indirect zone
pub const DOUBLE_INDIRECT_ZONE: usize = 8;
/// Slot of the triple indirect zone
pub const TRIPLE_INDIRECT_ZONE: usize = 9;
/// Deepest level of indirection
pub const INDIRECT_DEPTH: usize = 3;
/// Size of an on-disk inode
pub const INODE_SZ: usize = 64;
/// Size of a directory entry
pub const DIRENT_SZ: usize = 64;
/// Inodes held by one device block
pub const INODES_PER_BLOCK: usize = BLOCK_SZ / INODE_SZ;
/// Directory entries held by one device block
pub const DIRENTS_PER_BLOCK: usize = BLOCK_SZ / DIRENT_SZ;
/// Zone numbers held by one device block of an indirect zone
pub const ZONES_PER_BLOCK: usize = BLOCK_SZ / 4;
/// Largest log2 of format blocks per zone the formatter writes or mount accepts
pub const MAX_LOG_ZONE_SIZE: u16 = 8;
/// Default for the max file size field written by the formatter
pub const MINIX3_MAX_SIZE: u32 = 0x7fff_ffff;

/// Device block viewed as bytes
pub type DataBlock = [u8; BLOCK_SZ];
/// Device block of an indirect zone
pub type IndirectBlock = [u32; ZONES_PER_BLOCK];
/// Device block of a directory
pub type DirBlock = [DirEntry; DIRENTS_PER_BLOCK];
/// Device block of the inode table
pub type InodeBlock = [DiskInode; INODES_PER_BLOCK];

/// Super block of a filesystem
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct SuperBlock {
    /// number of inodes
    pub ninodes: u32,
    pad0: u16,
    /// format blocks of the inode bitmap
    pub imap_blocks: u16,
    /// format blocks of the zone bitmap
    pub zmap_blocks: u16,
    /// zone number of the first data zone
    pub first_data_zone: u16,
    /// log2 of format blocks per zone
    pub log_zone_size: u16,
    pad1: u16,
    /// largest file size in bytes
    pub max_size: u32,
    /// zones on the device, metadata included
    pub zones: u32,
    magic: u16,
    pad2: u16,
    /// format block size in bytes
    pub block_size: u16,
    /// on-disk version, always 0
    pub disk_version: u8,
}

impl Debug for SuperBlock {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuperBlock")
            .field("ninodes", &self.ninodes)
            .field("imap_blocks", &self.imap_blocks)
            .field("zmap_blocks", &self.zmap_blocks)
            .field("first_data_zone", &self.first_data_zone)
            .field("log_zone_size", &self.log_zone_size)
            .field("max_size", &self.max_size)
            .field("zones", &self.zones)
            .field("block_size", &self.block_size)
            .finish()
    }
}

impl SuperBlock {
    /// Initialize a super block
    pub fn initialize(
        &mut self,
        ninodes: u32,
        imap_blocks: u16,
        zmap_blocks: u16,
        first_data_zone: u16,
        log_zone_size: u16,
        zones: u32,
    ) {
        *self = Self {
            ninodes,
            pad0: 0,
            imap_blocks,
            zmap_blocks,
            first_data_zone,
            log_zone_size,
            pad1: 0,
            max_size: MINIX3_MAX_SIZE,
            zones,
            magic: MINIX3_SUPER_MAGIC,
            pad2: 0,
            block_size: FORMAT_BLOCK_SZ as u16,
            disk_version: 0,
        }
    }
    /// Check if a super block is valid using the minix v3 magic
    pub fn is_valid(&self) -> bool {
        self.magic == MINIX3_SUPER_MAGIC
    }
}

bitflags! {
    /// Type and permission bits of an inode
    pub struct InodeMode: u16 {
        /// mask selecting the file type
        const TYPE_MASK = 0o170000;
        /// named pipe
        const FIFO = 0o010000;
        /// character device
        const CHAR = 0o020000;
        /// directory
        const DIR = 0o040000;
        /// block device
        const BLOCK = 0o060000;
        /// ordinary regular file
        const FILE = 0o100000;
        /// symbolic link
        const SYMLINK = 0o120000;
        /// socket
        const SOCKET = 0o140000;
        /// mask selecting permission, sticky and set-id bits
        const PERM_MASK = 0o7777;
    }
}

impl InodeMode {
    /// The type bits alone
    pub fn file_type(self) -> InodeMode {
        self & InodeMode::TYPE_MASK
    }
    /// Whether the mode describes a directory
    pub fn is_dir(self) -> bool {
        self.file_type() == InodeMode::DIR
    }
    /// Whether the mode describes a device node
    pub fn is_device(self) -> bool {
        let file_type = self.file_type();
        file_type == InodeMode::CHAR || file_type == InodeMode::BLOCK
    }
}

/// A disk inode
#[repr(C)]
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct DiskInode {
    /// type and permission bits
    pub mode: u16,
    /// directory entries referencing this inode
    pub nlinks: u16,
    /// owner
    pub uid: u16,
    /// group
    pub gid: u16,
    /// byte size, independent of the zones actually allocated
    pub size: u32,
    /// access time
    pub atime: u32,
    /// modification time
    pub mtime: u32,
    /// status change time
    pub ctime: u32,
    /// 7 direct slots, then single, double and triple indirect
    pub zone: [u32; INODE_ZONES],
}

impl DiskInode {
    /// A fresh inode of `mode` with no links and no zones
    pub fn new(mode: InodeMode) -> Self {
        Self {
            mode: mode.bits(),
            ..Self::default()
        }
    }
    /// Mode bits of this inode
    pub fn mode(&self) -> InodeMode {
        InodeMode::from_bits_truncate(self.mode)
    }
    /// Whether this inode is a directory
    pub fn is_dir(&self) -> bool {
        self.mode().is_dir()
    }
}

/// A directory entry
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DirEntry {
    inode: u32,
    name: [u8; NAME_LENGTH_LIMIT],
}

impl DirEntry {
    /// Create an empty directory entry
    pub fn empty() -> Self {
        Self {
            inode: 0,
            name: [0u8; NAME_LENGTH_LIMIT],
        }
    }
    /// Create a directory entry from an encoded name and inode number
    pub fn new(name: &[u8; NAME_LENGTH_LIMIT], inode: u32) -> Self {
        Self { inode, name: *name }
    }
    /// Name bytes up to the first NUL
    pub fn name(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(NAME_LENGTH_LIMIT);
        &self.name[..len]
    }
    /// The whole fixed-width name field
    pub fn name_field(&self) -> &[u8; NAME_LENGTH_LIMIT] {
        &self.name
    }
    /// Get inode number of the entry
    pub fn inode(&self) -> u32 {
        self.inode
    }
    /// Whether the slot is unused
    pub fn is_free(&self) -> bool {
        self.inode == 0
    }
    /// Mark the slot unused; the name bytes stay behind
    pub fn clear(&mut self) {
        self.inode = 0;
    }
    /// Whether this is the "." or ".." entry
    pub fn is_dot(&self) -> bool {
        matches!(self.name(), b"." | b"..")
    }
}

/// Pad `name` into the fixed-width name field.
pub fn encode_name(name: &str) -> FsResult<[u8; NAME_LENGTH_LIMIT]> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.iter().any(|b| *b == 0 || *b == b'/') {
        return Err(FsError::InvalidArgument);
    }
    if bytes.len() > NAME_LENGTH_LIMIT {
        return Err(FsError::NameTooLong);
    }
    let mut field = [0u8; NAME_LENGTH_LIMIT];
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(field)
}
