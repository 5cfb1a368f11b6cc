//! User-level copy-on-write fork

extern crate alloc;

use super::malloc;
use super::mapdir::{self, MTE_P};
use super::{paging, pgfault, UserEnv};
use crate::env::EnvId;
use crate::error::{KernelError, Result};
use crate::mm::{
    PteFlags, VirtAddr, FEC_WR, NPDENTRIES, NPTENTRIES, PFTEMP, PGSIZE, PTSIZE, UMAPDIR,
    USTACKTOP, UTEXT, UXSTACKTOP,
};
use crate::trap::UTrapframe;

const UPW: u32 = PteFlags::PRESENT.bits() | PteFlags::USER.bits() | PteFlags::WRITABLE.bits();

/// Write faults on copy-on-write pages: allocate a private copy at a
/// scratch address, fill it, and move it over the faulting page with
/// write permission restored. Anything else is left for the next
/// handler.
pub fn cow_pgfault_handler(env: &mut UserEnv, utf: &UTrapframe) -> bool {
    let addr = VirtAddr::new(utf.fault_va).page_base();
    let pte = env.pte(addr);
    let perm = pte & PteFlags::SYSCALL.bits();
    // A non-present PTE can still carry a stale COW avail bit from a
    // stable unmap; that fault belongs to the paging handler, and the
    // retried write comes back here once the page is resident.
    if utf.err & FEC_WR == 0
        || pte & PteFlags::PRESENT.bits() == 0
        || perm & PteFlags::COW.bits() == 0
    {
        return false;
    }

    let perm = (perm & !PteFlags::COW.bits()) | PteFlags::WRITABLE.bits();
    let scratch = VirtAddr::new(PFTEMP);
    if let Err(e) = paging::page_alloc(env, EnvId::NULL, scratch, perm, true) {
        panic!("cow fault: page_alloc failed ({e})");
    }
    env.copy_page(addr, scratch);
    if let Err(e) = paging::page_map(env, EnvId::NULL, scratch, EnvId::NULL, addr, perm) {
        panic!("cow fault: page_map failed ({e})");
    }
    true
}

/// Duplicate one of our pages into the child at the same address.
///
/// Shared pages are mapped identically; paging metadata (`NO_PAGE`) is
/// deep-copied so the two processes never share mapping tables; writable
/// or already-CoW pages become CoW on both sides, the parent re-marked
/// after the child; plain read-only pages are mapped through unchanged.
fn duppage(env: &mut UserEnv, child: EnvId, pgnum: usize) -> Result<()> {
    let va = VirtAddr::of_pgnum(pgnum);
    let mut pte = env.pte(va);

    if pte & PteFlags::PRESENT.bits() == 0 {
        // the page sits on swap; reload it so its permissions are real
        loop {
            match paging::page_in(env, va) {
                Ok(()) => break,
                Err(KernelError::NoMem) => {
                    if !paging::page_out(env)? {
                        return Err(KernelError::NoMem);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        pte = env.pte(va);
    }
    let perm_bits = pte & PteFlags::SYSCALL.bits();

    if pte & PteFlags::SHARED.bits() != 0 {
        paging::page_map(env, EnvId::NULL, va, child, va, perm_bits)?;
    } else if pte & PteFlags::NO_PAGE.bits() != 0 {
        let temp = malloc::malloc(env).ok_or(KernelError::NoMem)?;
        env.copy_page(va, temp);
        paging::page_map(env, EnvId::NULL, temp, child, va, perm_bits)?;
        paging::page_unmap(env, EnvId::NULL, temp)?;
    } else if pte & (PteFlags::WRITABLE | PteFlags::COW).bits() != 0 {
        let perm = (PteFlags::PRESENT | PteFlags::USER | PteFlags::COW).bits()
            | (pte & PteFlags::AVAIL.bits());
        paging::page_map(env, EnvId::NULL, va, child, va, perm)?;
        // the child's mapping may have narrowed the shared frame's view;
        // the parent must be re-marked CoW afterwards
        paging::page_map(env, EnvId::NULL, va, EnvId::NULL, va, perm)?;
    } else {
        paging::page_map(env, EnvId::NULL, va, child, va, perm_bits)?;
    }
    Ok(())
}

/// Fork a copy-on-write child. Returns the child's id; the child starts
/// runnable with an identical address space, a private exception stack
/// and the same fault upcall.
pub fn fork(env: &mut UserEnv) -> Result<EnvId> {
    if !env.mapdir_ready {
        mapdir::init_map_dir(env);
    }
    pgfault::add_pgfault_handler(env, cow_pgfault_handler);

    let r = env.sys_exofork();
    if r < 0 {
        return Err(KernelError::from_errno(r).unwrap_or(KernelError::NoMem));
    }
    let child = EnvId(r as u32);

    // Reload every page of ours that sits on swap before anything is
    // duplicated. The mapping tables are deep-copied below, and a copy
    // taken while an entry still names a swap slot would leave the child
    // claiming a slot the parent's own page-in is about to free.
    for mdx_i in 0..NPDENTRIES as u32 {
        let mde = env.read_u32(VirtAddr::new(UMAPDIR + mdx_i * 4));
        if mde & mapdir::MDE_P == 0 {
            continue;
        }
        let table_va = mde & !0xfff;
        for mtx_i in 0..NPTENTRIES as u32 {
            let mte = env.read_u32(VirtAddr::new(table_va + mtx_i * 4));
            if mte & MTE_P == 0 {
                continue;
            }
            let pgnum = mdx_i as usize * NPTENTRIES + mtx_i as usize;
            let va = (pgnum * PGSIZE) as u32;
            if va <= UTEXT || va >= USTACKTOP {
                continue;
            }
            loop {
                match paging::page_in(env, VirtAddr::new(va)) {
                    Ok(()) => break,
                    Err(KernelError::NoMem) => {
                        if !paging::page_out(env)? {
                            return Err(KernelError::NoMem);
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    // every present, user-readable page below the stack top
    let machine = env.machine().clone();
    let id = env.id();
    let pgnums: alloc::vec::Vec<usize> = machine.with_kernel(|k| {
        let dir = k.envs.get(id).unwrap().pgdir;
        let mut v = alloc::vec::Vec::new();
        let user = (PteFlags::PRESENT | PteFlags::USER).bits();
        for pdx in 0..NPDENTRIES {
            if pdx * PTSIZE >= USTACKTOP as usize {
                break;
            }
            let pde = k.phys.read_u32(dir, pdx * 4);
            if pde & user != user {
                continue;
            }
            let table = crate::mm::pte_frame(pde);
            for ptx in 0..NPTENTRIES {
                let pgnum = pdx * NPTENTRIES + ptx;
                if pgnum * PGSIZE >= USTACKTOP as usize {
                    break;
                }
                let pte = k.phys.read_u32(table, ptx * 4);
                if pte & user == user {
                    v.push(pgnum);
                }
            }
        }
        v
    });

    for pgnum in pgnums {
        duppage(env, child, pgnum)?;
    }

    // the child gets a fresh, never-shared exception stack
    paging::page_alloc(
        env,
        child,
        VirtAddr::new(UXSTACKTOP - PGSIZE as u32),
        UPW,
        true,
    )?;
    let upcall = env.snapshot().pgfault_upcall;
    let r = env.sys_env_set_pgfault_upcall(child, upcall);
    if r < 0 {
        return Err(KernelError::from_errno(r).unwrap_or(KernelError::BadEnv));
    }
    let r = env.sys_env_set_status(child, true);
    if r < 0 {
        return Err(KernelError::from_errno(r).unwrap_or(KernelError::BadEnv));
    }
    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvType;
    use crate::machine::{Machine, MachineConfig};
    use alloc::sync::Arc;

    fn parent(npages: usize) -> (Arc<Machine>, UserEnv) {
        let m = Arc::new(Machine::new(MachineConfig { npages, nenv: 8 }));
        let id = m.env_create(EnvType::User).unwrap();
        (m.clone(), UserEnv::attach(m, id))
    }

    #[test]
    fn fork_maps_parent_pages_cow_in_both() {
        let (m, mut p) = parent(512);
        let va = VirtAddr::new(0x1000_0000);
        paging::page_alloc(&mut p, EnvId::NULL, va, UPW, true).unwrap();
        p.write_u32(va, 0xfeed);

        let child = fork(&mut p).unwrap();
        let cow = PteFlags::COW.bits();
        let w = PteFlags::WRITABLE.bits();
        assert!(p.pte(va) & cow != 0, "parent side must be CoW");
        assert!(p.pte(va) & w == 0);
        let (_, child_pte) = m.user_pte(child, va);
        assert!(child_pte & cow != 0, "child side must be CoW");

        // both read the same frame
        assert_eq!(p.read_u32(va), 0xfeed);
        assert_eq!(m.user_read_u32(child, va), Ok(0xfeed));
        m.check_invariants();
    }

    #[test]
    fn parent_write_after_fork_is_isolated() {
        let (m, mut p) = parent(512);
        let va = VirtAddr::new(0x1000_0000);
        paging::page_alloc(&mut p, EnvId::NULL, va, UPW, true).unwrap();
        p.write_u32(va, 1);

        let child = fork(&mut p).unwrap();
        // parent writes through the CoW fault handler
        p.write_u32(va, 2);
        assert_eq!(p.read_u32(va), 2);
        assert_eq!(m.user_read_u32(child, va), Ok(1), "child keeps the pre-fork value");
        assert!(p.pte(va) & PteFlags::WRITABLE.bits() != 0);
        m.check_invariants();
    }

    #[test]
    fn shared_pages_stay_shared() {
        let (m, mut p) = parent(512);
        let va = VirtAddr::new(0x1000_0000);
        paging::page_alloc(&mut p, EnvId::NULL, va, UPW | PteFlags::SHARED.bits(), true).unwrap();
        p.write_u32(va, 7);

        let child = fork(&mut p).unwrap();
        let (_, child_pte) = m.user_pte(child, va);
        assert!(child_pte & PteFlags::SHARED.bits() != 0);
        assert!(child_pte & PteFlags::COW.bits() == 0);

        // a parent write is visible to the child: same frame, no CoW
        p.write_u32(va, 8);
        assert_eq!(m.user_read_u32(child, va), Ok(8));
    }

    #[test]
    fn mapping_directory_is_copied_not_shared() {
        let (m, mut p) = parent(512);
        mapdir::init_map_dir(&mut p);
        let child = fork(&mut p).unwrap();

        let (_, child_mapdir) = m.user_pte(child, VirtAddr::new(UMAPDIR));
        assert!(child_mapdir & PteFlags::PRESENT.bits() != 0);
        assert!(child_mapdir & PteFlags::NO_PAGE.bits() != 0);
        assert!(child_mapdir & PteFlags::COW.bits() == 0, "metadata must never be CoW");

        // distinct frames
        let parent_frame = p.pte(VirtAddr::new(UMAPDIR)) >> 12;
        assert_ne!(child_mapdir >> 12, parent_frame);
        m.check_invariants();
    }

    #[test]
    fn child_gets_a_private_exception_stack() {
        let (m, mut p) = parent(512);
        let va = VirtAddr::new(0x1000_0000);
        paging::page_alloc(&mut p, EnvId::NULL, va, UPW, true).unwrap();
        let child = fork(&mut p).unwrap();

        let xstack = VirtAddr::new(UXSTACKTOP - PGSIZE as u32);
        let parent_frame = p.pte(xstack) >> 12;
        let (_, child_pte) = m.user_pte(child, xstack);
        assert!(child_pte & PteFlags::WRITABLE.bits() != 0);
        assert_ne!(child_pte >> 12, parent_frame);
        assert_eq!(
            m.env_snapshot(child).unwrap().pgfault_upcall,
            p.snapshot().pgfault_upcall
        );
        assert_eq!(
            m.env_snapshot(child).unwrap().status,
            crate::env::EnvStatus::Runnable
        );
    }

    #[test]
    fn cow_chain_through_two_generations() {
        let (m, mut p) = parent(512);
        let va = VirtAddr::new(0x1000_0000);
        paging::page_alloc(&mut p, EnvId::NULL, va, UPW, true).unwrap();
        p.write_u32(va, 10);

        let c1 = fork(&mut p).unwrap();
        // the page is now CoW in the parent; fork again
        let c2 = fork(&mut p).unwrap();
        assert_eq!(m.user_read_u32(c1, va), Ok(10));
        assert_eq!(m.user_read_u32(c2, va), Ok(10));

        p.write_u32(va, 11);
        assert_eq!(p.read_u32(va), 11);
        assert_eq!(m.user_read_u32(c1, va), Ok(10));
        assert_eq!(m.user_read_u32(c2, va), Ok(10));
        m.check_invariants();
    }
}
