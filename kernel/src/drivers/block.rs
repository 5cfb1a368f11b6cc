//! Block devices
//!
//! The swap server owns one of these. Blocks are page-sized: one stored
//! page per block, so the server never splits a transfer.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use crate::error::{KernelError, Result};
use crate::mm::PGSIZE;

/// Bytes per device block
pub const BLOCK_SIZE: usize = PGSIZE;

/// A page-granular block device
pub trait BlockDevice: Send {
    fn nblocks(&self) -> usize;
    fn read_block(&mut self, blockno: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<()>;
    fn write_block(&mut self, blockno: u32, buf: &[u8; BLOCK_SIZE]) -> Result<()>;
}

/// In-memory disk, sparse: unwritten blocks read back as zeros
pub struct MemDisk {
    nblocks: usize,
    blocks: BTreeMap<u32, Box<[u8; BLOCK_SIZE]>>,
}

impl MemDisk {
    pub fn new(nblocks: usize) -> Self {
        Self {
            nblocks,
            blocks: BTreeMap::new(),
        }
    }

    /// Blocks that have ever been written
    pub fn blocks_written(&self) -> usize {
        self.blocks.len()
    }
}

impl BlockDevice for MemDisk {
    fn nblocks(&self) -> usize {
        self.nblocks
    }

    fn read_block(&mut self, blockno: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        if blockno as usize >= self.nblocks {
            return Err(KernelError::Inval);
        }
        match self.blocks.get(&blockno) {
            Some(data) => buf.copy_from_slice(&data[..]),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_block(&mut self, blockno: u32, buf: &[u8; BLOCK_SIZE]) -> Result<()> {
        if blockno as usize >= self.nblocks {
            return Err(KernelError::Inval);
        }
        self.blocks.insert(blockno, Box::new(*buf));
        Ok(())
    }
}
