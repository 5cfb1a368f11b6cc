//! Swap server
//!
//! A single privileged environment owning the swap device and the bitmap
//! of free slots. Clients talk to it over IPC: the request word carries
//! the handler id in its low two bits and the swap slot (when relevant)
//! above them, and every request grants a page: the payload to write
//! out, or a scratch page for the server to fill.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::drivers::block::{BlockDevice, BLOCK_SIZE};
use crate::env::EnvId;
use crate::error::{KernelError, Result};
use crate::mm::{PteFlags, VirtAddr, PGSIZE};
use crate::user::ipc::{ipc_recv, ipc_send};
use crate::user::paging::PageStats;
use crate::user::UserEnv;

/// Request codes, in the low two bits of the request word
pub const PAGEREQ_PAGE_IN: u32 = 0;
pub const PAGEREQ_PAGE_OUT: u32 = 1;
pub const PAGEREQ_PAGE_REMOVE: u32 = 2;
pub const PAGEREQ_PAGE_STAT: u32 = 3;

/// Swap capacity in slots (one stored page per slot)
pub const PAGE_NBLOCKS: usize = 32768;
/// Slots tracked per bitmap group
pub const NBLOCKS_PER_GROUP: usize = 32;
/// First device block of the swap partition (the blocks below belong to
/// the file system)
pub const PAGE_BLOCKS_OFFSET: u32 = 1024;

/// Where client request pages get mapped in the server
pub const PAGEREQ_VA: u32 = 0x0fff_f000;

/// One group of 32 slots: a bitmap word (0 = free) plus the free-list
/// link. A group sits on the free list iff at least one of its slots is
/// free.
struct BitmapGroup {
    bitmap: u32,
    link: Option<u32>,
}

/// Bitmap over the swap slots with a free list of not-full groups
pub struct SwapBitmap {
    groups: Vec<BitmapGroup>,
    free_head: Option<u32>,
    nblocks: usize,
}

impl SwapBitmap {
    /// All slots start free; the free list is threaded back-to-front so
    /// group 0 is at its head.
    pub fn new(nblocks: usize) -> Self {
        assert!(nblocks % NBLOCKS_PER_GROUP == 0);
        let ngroups = nblocks / NBLOCKS_PER_GROUP;
        let mut groups = Vec::with_capacity(ngroups);
        for _ in 0..ngroups {
            groups.push(BitmapGroup { bitmap: 0, link: None });
        }
        let mut free_head = None;
        for g in (0..ngroups as u32).rev() {
            groups[g as usize].link = free_head;
            free_head = Some(g);
        }
        Self {
            groups,
            free_head,
            nblocks,
        }
    }

    /// Device block number of a free slot. Does not mark it; callers
    /// follow up with [`mark_not_free`](Self::mark_not_free).
    pub fn get_free_block(&self) -> Result<u32> {
        let Some(g) = self.free_head else {
            return Err(KernelError::SwapFull);
        };
        let bitmap = self.groups[g as usize].bitmap;
        for i in 0..NBLOCKS_PER_GROUP as u32 {
            if bitmap & (1 << i) == 0 {
                return Ok(PAGE_BLOCKS_OFFSET + g * NBLOCKS_PER_GROUP as u32 + i);
            }
        }
        panic!("swap bitmap corruption: full group on the free list");
    }

    /// Mark a device block used. Only blocks in the head group may be
    /// taken, which is all `get_free_block` ever hands out.
    pub fn mark_not_free(&mut self, blockno: u32) {
        let slot = blockno
            .checked_sub(PAGE_BLOCKS_OFFSET)
            .filter(|&s| (s as usize) < self.nblocks)
            .expect("swap bitmap corruption: block out of range");
        let group = slot / NBLOCKS_PER_GROUP as u32;
        if self.free_head != Some(group) {
            panic!("swap bitmap corruption: unfreeing a block outside the head group");
        }
        let bit = 1u32 << (slot % NBLOCKS_PER_GROUP as u32);
        let g = &mut self.groups[group as usize];
        if g.bitmap & bit != 0 {
            panic!("swap bitmap corruption: block already in use");
        }
        g.bitmap |= bit;
        if g.bitmap == u32::MAX {
            self.free_head = g.link.take();
        }
    }

    /// Mark a device block free again, putting its group back on the
    /// free list when it was full.
    pub fn mark_free(&mut self, blockno: u32) {
        let slot = blockno
            .checked_sub(PAGE_BLOCKS_OFFSET)
            .filter(|&s| (s as usize) < self.nblocks)
            .expect("swap bitmap corruption: block out of range");
        let group = slot / NBLOCKS_PER_GROUP as u32;
        let bit = 1u32 << (slot % NBLOCKS_PER_GROUP as u32);
        if self.groups[group as usize].bitmap == u32::MAX {
            self.groups[group as usize].link = self.free_head;
            self.free_head = Some(group);
        }
        let g = &mut self.groups[group as usize];
        if g.bitmap & bit == 0 {
            panic!("swap bitmap corruption: freeing a free block");
        }
        g.bitmap ^= bit;
    }

    pub fn nblocks(&self) -> usize {
        self.nblocks
    }
}

/// The swap server proper
pub struct PageServer {
    env: UserEnv,
    disk: Box<dyn BlockDevice>,
    bitmap: SwapBitmap,
    stats: PageStats,
}

impl PageServer {
    /// Full-capacity server
    pub fn new(env: UserEnv, disk: Box<dyn BlockDevice>) -> Self {
        Self::with_capacity(env, disk, PAGE_NBLOCKS)
    }

    /// Server with a reduced slot count (tests exercise exhaustion this
    /// way without writing 32768 pages)
    pub fn with_capacity(mut env: UserEnv, disk: Box<dyn BlockDevice>, nblocks: usize) -> Self {
        // allocate the request page up front so its page table exists
        // before memory gets tight
        let perm = (PteFlags::PRESENT | PteFlags::USER | PteFlags::WRITABLE).bits();
        let r = env.sys_page_alloc(EnvId::NULL, VirtAddr::new(PAGEREQ_VA), perm);
        if r < 0 {
            panic!("page server: cannot allocate the request page ({r})");
        }
        log::info!("page server running with {nblocks} slots");
        Self {
            env,
            disk,
            bitmap: SwapBitmap::new(nblocks),
            stats: PageStats::default(),
        }
    }

    /// Serve forever
    pub fn serve(&mut self) {
        loop {
            self.serve_one();
        }
    }

    /// Receive and answer exactly one request
    pub fn serve_one(&mut self) {
        let req_va = VirtAddr::new(PAGEREQ_VA);
        let (req, whom, perm) = match ipc_recv(&mut self.env, Some(req_va)) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("page server: recv failed ({e})");
                return;
            }
        };

        // every request must carry an argument page
        if !perm.contains(PteFlags::PRESENT) {
            log::warn!(
                "page server: invalid request from {:08x}: no argument page",
                whom.as_u32()
            );
            return; // just leave it hanging...
        }

        let arg = req >> 2;
        let (reply, grant) = match req & 3 {
            PAGEREQ_PAGE_IN => self.serve_page_in(arg),
            PAGEREQ_PAGE_OUT => self.serve_page_out(),
            PAGEREQ_PAGE_REMOVE => self.serve_page_remove(arg),
            PAGEREQ_PAGE_STAT => self.serve_page_stat(),
            _ => unreachable!(),
        };
        log::trace!(
            "page server: req {req:#x} from {:08x} -> {reply}",
            whom.as_u32()
        );

        if let Some(pg) = grant {
            assert!(pg.is_page_aligned(), "page server: reply page misaligned");
        }
        if let Err(e) = ipc_send(&mut self.env, whom, reply as u32, grant, perm) {
            log::warn!("page server: reply to {:08x} failed ({e})", whom.as_u32());
        }
        let _ = self.env.sys_page_unmap(EnvId::NULL, req_va);
    }

    /// Read `slot` into the granted page and free the slot
    fn serve_page_in(&mut self, slot: u32) -> (i32, Option<VirtAddr>) {
        if slot as usize >= self.bitmap.nblocks() {
            return (KernelError::Inval.to_errno(), None);
        }
        let blockno = slot + PAGE_BLOCKS_OFFSET;
        let mut buf = [0u8; BLOCK_SIZE];
        if let Err(e) = self.disk.read_block(blockno, &mut buf) {
            return (e.to_errno(), None);
        }
        self.env
            .machine()
            .user_write_page(self.env.id(), VirtAddr::new(PAGEREQ_VA), &buf)
            .expect("request page verified mapped");
        self.bitmap.mark_free(blockno);
        self.stats.page_ins += 1;
        (0, Some(VirtAddr::new(PAGEREQ_VA)))
    }

    /// Write the granted page to a free slot and reply with its index
    fn serve_page_out(&mut self) -> (i32, Option<VirtAddr>) {
        let blockno = match self.bitmap.get_free_block() {
            Ok(b) => b,
            Err(e) => return (e.to_errno(), None),
        };
        let mut buf = [0u8; BLOCK_SIZE];
        self.env
            .machine()
            .user_read_page(self.env.id(), VirtAddr::new(PAGEREQ_VA), &mut buf)
            .expect("request page verified mapped");
        if let Err(e) = self.disk.write_block(blockno, &buf) {
            return (e.to_errno(), None);
        }
        self.bitmap.mark_not_free(blockno);
        self.stats.page_outs += 1;
        ((blockno - PAGE_BLOCKS_OFFSET) as i32, None)
    }

    /// Free `slot` without touching the disk
    fn serve_page_remove(&mut self, slot: u32) -> (i32, Option<VirtAddr>) {
        if slot as usize >= self.bitmap.nblocks() {
            return (KernelError::Inval.to_errno(), None);
        }
        self.bitmap.mark_free(slot + PAGE_BLOCKS_OFFSET);
        self.stats.page_removes += 1;
        (0, None)
    }

    /// Write the counters into the granted page
    fn serve_page_stat(&mut self) -> (i32, Option<VirtAddr>) {
        let mut buf = [0u8; PGSIZE];
        buf[0..4].copy_from_slice(&self.stats.page_outs.to_le_bytes());
        buf[4..8].copy_from_slice(&self.stats.page_ins.to_le_bytes());
        buf[8..12].copy_from_slice(&self.stats.page_removes.to_le_bytes());
        self.env
            .machine()
            .user_write_page(self.env.id(), VirtAddr::new(PAGEREQ_VA), &buf)
            .expect("request page verified mapped");
        (0, Some(VirtAddr::new(PAGEREQ_VA)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_bitmap_hands_out_slot_zero() {
        let bm = SwapBitmap::new(64);
        assert_eq!(bm.get_free_block().unwrap(), PAGE_BLOCKS_OFFSET);
    }

    #[test]
    fn allocation_walks_the_head_group() {
        let mut bm = SwapBitmap::new(64);
        for i in 0..32 {
            let b = bm.get_free_block().unwrap();
            assert_eq!(b, PAGE_BLOCKS_OFFSET + i);
            bm.mark_not_free(b);
        }
        // head group exhausted; the next group takes over
        assert_eq!(bm.get_free_block().unwrap(), PAGE_BLOCKS_OFFSET + 32);
    }

    #[test]
    fn exhaustion_is_swap_full() {
        let mut bm = SwapBitmap::new(32);
        for _ in 0..32 {
            let b = bm.get_free_block().unwrap();
            bm.mark_not_free(b);
        }
        assert_eq!(bm.get_free_block(), Err(KernelError::SwapFull));
    }

    #[test]
    fn freeing_restores_a_full_group_to_the_list() {
        let mut bm = SwapBitmap::new(32);
        for _ in 0..32 {
            let b = bm.get_free_block().unwrap();
            bm.mark_not_free(b);
        }
        bm.mark_free(PAGE_BLOCKS_OFFSET + 7);
        assert_eq!(bm.get_free_block().unwrap(), PAGE_BLOCKS_OFFSET + 7);
    }

    #[test]
    fn free_slots_are_reused() {
        let mut bm = SwapBitmap::new(64);
        let a = bm.get_free_block().unwrap();
        bm.mark_not_free(a);
        let b = bm.get_free_block().unwrap();
        assert_ne!(a, b);
        bm.mark_not_free(b);
        bm.mark_free(a);
        assert_eq!(bm.get_free_block().unwrap(), a);
    }

    #[test]
    #[should_panic(expected = "freeing a free block")]
    fn double_free_panics() {
        let mut bm = SwapBitmap::new(32);
        let a = bm.get_free_block().unwrap();
        bm.mark_not_free(a);
        bm.mark_free(a);
        bm.mark_free(a);
    }

    #[test]
    #[should_panic(expected = "outside the head group")]
    fn unfreeing_outside_the_head_group_panics() {
        let mut bm = SwapBitmap::new(64);
        bm.mark_not_free(PAGE_BLOCKS_OFFSET + 40);
    }
}
