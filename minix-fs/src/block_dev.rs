use core::any::Any;

/// A device that transfers data in whole blocks of `BLOCK_SZ` bytes
pub trait BlockDevice: Send + Sync + Any {
    /// Read block `block_id` into `buf`
    fn read_block(&self, block_id: usize, buf: &mut [u8]);
    /// Write `buf` to block `block_id`
    fn write_block(&self, block_id: usize, buf: &[u8]);
}
