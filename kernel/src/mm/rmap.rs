//! Reverse-map store
//!
//! Arena of nodes linking each physical frame to every PTE slot that maps
//! it. Nodes are pool-allocated in page-sized batches and recycled through
//! a free list, never returned to the heap individually. Chains are
//! threaded through arena indices, so nothing in here ever stores an
//! owning reference into environment memory.

extern crate alloc;

use alloc::vec::Vec;
use core::mem;

use super::frame::{FrameNumber, FrameTable};
use super::phys::{PhysMem, PteSlot};
use super::{PteFlags, VirtAddr, PGSIZE};

/// One reverse-map node: the PTE slot, the owning page directory and the
/// virtual address it maps the frame at.
#[derive(Debug, Clone, Copy)]
pub struct RmapNode {
    pub slot: PteSlot,
    pub dir: FrameNumber,
    pub va: VirtAddr,
    link: Option<u32>,
}

impl RmapNode {
    const fn blank() -> Self {
        Self {
            slot: PteSlot::new(FrameNumber::new(0), 0),
            dir: FrameNumber::new(0),
            va: VirtAddr::new(0),
            link: None,
        }
    }
}

/// Node arena plus free list
pub struct RmapArena {
    nodes: Vec<RmapNode>,
    free_head: Option<u32>,
}

impl Default for RmapArena {
    fn default() -> Self {
        Self::new()
    }
}

impl RmapArena {
    pub const fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free_head: None,
        }
    }

    /// Number of nodes ever carved out of the arena
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    /// Grow the pool by a page worth of nodes
    fn refill(&mut self) {
        let batch = PGSIZE / mem::size_of::<RmapNode>();
        for _ in 0..batch {
            let idx = self.nodes.len() as u32;
            let mut node = RmapNode::blank();
            node.link = self.free_head;
            self.nodes.push(node);
            self.free_head = Some(idx);
        }
    }

    fn alloc_node(&mut self) -> u32 {
        if self.free_head.is_none() {
            self.refill();
        }
        let idx = self.free_head.expect("rmap refill produced no nodes");
        self.free_head = self.nodes[idx as usize].link;
        self.nodes[idx as usize] = RmapNode::blank();
        idx
    }

    fn dealloc_node(&mut self, idx: u32) {
        self.nodes[idx as usize] = RmapNode::blank();
        self.nodes[idx as usize].link = self.free_head;
        self.free_head = Some(idx);
    }

    /// Attach a node for (`dir`, `va`) -> `slot` to the head of `frame`'s
    /// chain
    pub fn attach(
        &mut self,
        frames: &mut FrameTable,
        frame: FrameNumber,
        slot: PteSlot,
        dir: FrameNumber,
        va: VirtAddr,
    ) {
        let idx = self.alloc_node();
        let node = &mut self.nodes[idx as usize];
        node.slot = slot;
        node.dir = dir;
        node.va = va.page_base();
        node.link = frames.get(frame).rmap_head;
        frames.get_mut(frame).rmap_head = Some(idx);
    }

    /// Detach the node for (`dir`, `va`) from `frame`'s chain and return
    /// its PTE slot. A missing node means the chain no longer mirrors the
    /// page tables, which is unrecoverable.
    pub fn detach(
        &mut self,
        frames: &mut FrameTable,
        frame: FrameNumber,
        dir: FrameNumber,
        va: VirtAddr,
    ) -> PteSlot {
        let va = va.page_base();
        let mut prev: Option<u32> = None;
        let mut cur = frames.get(frame).rmap_head;
        while let Some(idx) = cur {
            let node = self.nodes[idx as usize];
            if node.dir == dir && node.va == va {
                match prev {
                    None => frames.get_mut(frame).rmap_head = node.link,
                    Some(p) => self.nodes[p as usize].link = node.link,
                }
                self.dealloc_node(idx);
                return node.slot;
            }
            prev = Some(idx);
            cur = node.link;
        }
        panic!(
            "reverse-map chain corruption: frame {} has no node for va {:#010x}",
            frame.as_u32(),
            va.as_u32()
        );
    }

    /// Find a PTE on the chain starting at `head` whose bits intersect
    /// `filter`
    pub fn find_pte(&self, head: Option<u32>, phys: &PhysMem, filter: PteFlags) -> Option<PteSlot> {
        let mut cur = head;
        while let Some(idx) = cur {
            let node = &self.nodes[idx as usize];
            if node.slot.load(phys) & filter.bits() != 0 {
                return Some(node.slot);
            }
            cur = node.link;
        }
        None
    }

    /// Clear `flags` in every PTE on the chain
    pub fn clear_flags(&self, head: Option<u32>, phys: &mut PhysMem, flags: PteFlags) {
        let mut cur = head;
        while let Some(idx) = cur {
            let node = &self.nodes[idx as usize];
            let pte = node.slot.load(phys);
            node.slot.store(phys, pte & !flags.bits());
            cur = node.link;
        }
    }

    /// Length of the chain starting at `head`
    pub fn chain_len(&self, head: Option<u32>) -> usize {
        let mut n = 0;
        let mut cur = head;
        while let Some(idx) = cur {
            n += 1;
            cur = self.nodes[idx as usize].link;
        }
        n
    }

    /// Visit every node on the chain
    pub fn for_each(&self, head: Option<u32>, mut f: impl FnMut(&RmapNode)) {
        let mut cur = head;
        while let Some(idx) = cur {
            let node = &self.nodes[idx as usize];
            f(node);
            cur = node.link;
        }
    }
}
