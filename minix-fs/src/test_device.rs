//! RAM-backed block device for unit tests

use super::{BlockDevice, BLOCK_SZ};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

pub struct MemBlockDevice {
    blocks: Mutex<Vec<[u8; BLOCK_SZ]>>,
    reads: AtomicUsize,
}

impl MemBlockDevice {
    pub fn new(blocks: usize) -> Arc<Self> {
        Arc::new(Self {
            blocks: Mutex::new(vec![[0u8; BLOCK_SZ]; blocks]),
            reads: AtomicUsize::new(0),
        })
    }

    /// Device reads served so far
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_raw(&self, block_id: usize, offset: usize, data: &[u8]) {
        self.blocks.lock()[block_id][offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn read_raw(&self, block_id: usize, offset: usize, len: usize) -> Vec<u8> {
        self.blocks.lock()[block_id][offset..offset + len].to_vec()
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        self.reads.fetch_add(1, Ordering::SeqCst);
        buf.copy_from_slice(&self.blocks.lock()[block_id]);
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        self.blocks.lock()[block_id].copy_from_slice(buf);
    }
}
