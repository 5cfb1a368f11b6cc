//! Page-granularity user allocator
//!
//! Finds an unmapped, un-evicted virtual page between the text ceiling
//! and the stack and backs it through the safe allocator. A round-robin
//! cursor keeps the search cheap.

use super::mapdir::{self, MTE_P};
use super::{paging, UserEnv};
use crate::env::EnvId;
use crate::mm::{PteFlags, VirtAddr, PGSIZE, USTACKTOP, UTEXT};

/// Find a virtual page that is neither mapped nor on swap
pub fn find_unused_page(env: &mut UserEnv) -> Option<VirtAddr> {
    let start = env.malloc_cursor;
    let mut va = start;
    loop {
        va += PGSIZE as u32;
        if va >= USTACKTOP - PGSIZE as u32 {
            va = UTEXT;
        }
        if va == start {
            return None;
        }
        let vaddr = VirtAddr::new(va);
        let p = PteFlags::PRESENT.bits();
        if env.pde(vaddr) & p != 0 && env.pte(vaddr) & p != 0 {
            continue;
        }
        if env.mapdir_ready {
            if let Some(mte_va) = mapdir::umapdir_walk(env, vaddr, false) {
                if env.read_u32(mte_va) & MTE_P != 0 {
                    continue;
                }
            }
        }
        env.malloc_cursor = va;
        return Some(vaddr);
    }
}

/// Allocate one writable page, paging something out if memory is tight
pub fn malloc(env: &mut UserEnv) -> Option<VirtAddr> {
    let va = find_unused_page(env)?;
    let perm = (PteFlags::PRESENT | PteFlags::USER | PteFlags::WRITABLE).bits();
    paging::page_alloc(env, EnvId::NULL, va, perm, true).ok()?;
    Some(va)
}

/// Release a page obtained from [`malloc`]
pub fn free(env: &mut UserEnv, va: VirtAddr) {
    let _ = env.sys_page_unmap(EnvId::NULL, va);
}
