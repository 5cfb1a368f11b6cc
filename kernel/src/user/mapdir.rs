//! Per-process mapping directory
//!
//! A two-level table parallel to the hardware page directory, recording
//! which virtual pages currently live on swap and at which slot. The
//! directory root sits at `UMAPDIR` and every page of it is mapped with
//! `NO_PAGE`, so the paging metadata can never itself be evicted.
//!
//! Entry formats:
//! - directory entry: virtual address of a mapping-table page | `MDE_P`
//! - table entry: swap slot `<< 12` | saved permission bits | `MTE_P`,
//!   where a set `MTE_P` means "this page is on swap", not "in RAM".

use super::{malloc, paging, pgfault, UserEnv};
use crate::env::EnvId;
use crate::mm::{PteFlags, VirtAddr, UMAPDIR};

/// Mapping-directory entry present bit
pub const MDE_P: u32 = 0x1;
/// Mapping-table entry present bit ("on swap")
pub const MTE_P: u32 = 0x1;
/// Low bits of a mapping-table entry reserved for permissions
pub const MTE_FLAG_BITS: u32 = 12;

/// Directory index of `va`
pub fn mdx(va: VirtAddr) -> u32 {
    va.as_u32() >> 22
}

/// Table index of `va`
pub fn mtx(va: VirtAddr) -> u32 {
    (va.as_u32() >> 12) & 0x3ff
}

/// Swap slot stored in a mapping-table entry
pub fn mte_slot(mte: u32) -> u32 {
    mte >> MTE_FLAG_BITS
}

/// Lazily set up the mapping directory and the paging fault handler
pub fn init_map_dir(env: &mut UserEnv) {
    if env.mapdir_ready {
        return;
    }
    pgfault::add_pgfault_handler(env, paging::paging_pgfault_handler);
    let perm = (PteFlags::PRESENT | PteFlags::USER | PteFlags::WRITABLE | PteFlags::NO_PAGE).bits();
    let r = env.sys_page_alloc(EnvId::NULL, VirtAddr::new(UMAPDIR), perm);
    if r < 0 {
        panic!("init_map_dir: {r}");
    }
    env.mapdir_ready = true;
    paging::find_paging_env(env);
}

/// Guest address of the mapping-table entry for `va`.
///
/// With `create`, a missing mapping table is allocated from the user
/// allocator and pinned with `NO_PAGE`; without it, `None`.
pub fn umapdir_walk(env: &mut UserEnv, va: VirtAddr, create: bool) -> Option<VirtAddr> {
    debug_assert!(env.mapdir_ready, "mapping directory not initialized");
    let mde_va = VirtAddr::new(UMAPDIR + mdx(va) * 4);
    let mde = env.read_u32(mde_va);

    let table_va = if mde & MDE_P == 0 {
        if !create {
            return None;
        }
        let page = malloc::malloc(env)?;
        // the allocation may have recursed through this walk already
        let mde_now = env.read_u32(mde_va);
        if mde_now & MDE_P != 0 {
            let _ = env.sys_page_unmap(EnvId::NULL, page);
            mde_now & !0xfff
        } else {
            // re-map the table page with NO_PAGE so it can never be evicted
            let perm =
                (PteFlags::PRESENT | PteFlags::USER | PteFlags::WRITABLE | PteFlags::NO_PAGE).bits();
            let r = env.sys_page_map(EnvId::NULL, page, EnvId::NULL, page, perm);
            if r < 0 {
                panic!("umapdir_walk: cannot pin mapping table ({r})");
            }
            env.write_u32(mde_va, page.as_u32() | MDE_P);
            page.as_u32()
        }
    } else {
        mde & !0xfff
    };

    Some(VirtAddr::new(table_va + mtx(va) * 4))
}
