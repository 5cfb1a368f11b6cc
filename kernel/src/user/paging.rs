//! Demand paging: victim choice, page-in/page-out, safe wrappers
//!
//! The safe wrappers sit between user code and the raw page system
//! calls. `page_alloc` recovers from memory exhaustion by choosing a
//! victim page, shipping it to the swap server and retrying; the fault
//! handler pages evicted pages back in transparently.

use super::ipc::{ipc_find_env, ipc_recv, ipc_send};
use super::mapdir::{self, mte_slot, umapdir_walk, MTE_FLAG_BITS, MTE_P};
use super::{malloc, UserEnv};
use crate::env::{EnvId, EnvType};
use crate::error::{KernelError, Result};
use crate::mm::{
    pte_frame, PteFlags, VirtAddr, MAX_PAGE_AGE, NPDENTRIES, NPTENTRIES, PGSIZE, UMAPDIR,
    USTACKTOP, UTEMP, UTEXT, UTOP, UXSTACKTOP,
};
use crate::pageserv::{PAGEREQ_PAGE_IN, PAGEREQ_PAGE_OUT, PAGEREQ_PAGE_REMOVE, PAGEREQ_PAGE_STAT};
use crate::trap::UTrapframe;

const UP: PteFlags = PteFlags::PRESENT.union(PteFlags::USER);
const UPW: PteFlags = UP.union(PteFlags::WRITABLE);

/// Counters kept by the swap server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageStats {
    pub page_outs: u32,
    pub page_ins: u32,
    pub page_removes: u32,
}

/// A victim chooser: returns the virtual page to evict, or an address at
/// or above `UTOP` when there is no candidate
pub type PageChoiceFn = fn(&mut UserEnv) -> VirtAddr;

/// Replace the victim chooser
pub fn set_page_choice(env: &mut UserEnv, chooser: PageChoiceFn) {
    env.page_choice = chooser;
}

/// Cache and return the swap server's environment id
pub fn find_paging_env(env: &mut UserEnv) -> Option<EnvId> {
    if env.paging_env.is_none() {
        env.paging_env = ipc_find_env(env, EnvType::PageServer);
    }
    env.paging_env
}

/// Fraction of the page directory worth walking when the best age seen
/// so far is `age`: `(age / (MAX+1))^2`. A cold best candidate stops the
/// walk almost immediately; a hot one keeps it searching.
pub fn percentage_of_pgdir_to_walk(age: u8) -> f32 {
    let ratio = age as f32 / (MAX_PAGE_AGE as f32 + 1.0);
    let ratio = if ratio > 1.0 { 1.0 } else { ratio };
    ratio * ratio
}

/// Candidate filter shared by the choosers. Returns the frame age for a
/// page that may be evicted, `None` otherwise.
fn candidate_age(k: &crate::machine::Kernel, dir: crate::mm::FrameNumber, pgnum: usize) -> Option<u8> {
    let va = (pgnum * PGSIZE) as u32;
    if va <= UTEXT || va >= USTACKTOP - PGSIZE as u32 {
        return None;
    }
    let pde = k.phys.read_u32(dir, (pgnum / NPTENTRIES) * 4);
    if pde & PteFlags::PRESENT.bits() == 0 {
        return None;
    }
    let pte = k.phys.read_u32(pte_frame(pde), (pgnum % NPTENTRIES) * 4);
    if pte & PteFlags::PRESENT.bits() == 0 {
        return None;
    }
    if pte & (PteFlags::SHARED | PteFlags::NO_PAGE).bits() != 0 {
        return None;
    }
    let info = k.frames.get(pte_frame(pte));
    if info.refcount >= 2 {
        return None;
    }
    Some(info.age)
}

/// Round-robin chooser: the first evictable page after the cursor
pub fn default_page_choice(env: &mut UserEnv) -> VirtAddr {
    const TOTAL: usize = NPDENTRIES * NPTENTRIES;
    let utop_pgnum = UTOP as usize / PGSIZE;
    let start = env.chooser_cursor as usize % TOTAL;
    let machine = env.machine().clone();
    let id = env.id();

    let (cursor, choice) = machine.with_kernel(|k| {
        let Some(e) = k.envs.get(id) else { return (0, None) };
        let dir = e.pgdir;
        let mut offset = 0usize;
        while offset < TOTAL {
            let actual = (start + offset) % TOTAL;
            let pde = k.phys.read_u32(dir, (actual / NPTENTRIES) * 4);
            if pde & PteFlags::PRESENT.bits() == 0 || actual >= utop_pgnum {
                offset += NPTENTRIES - actual % NPTENTRIES - 1;
            } else if candidate_age(k, dir, actual).is_some() {
                return (actual, Some(actual));
            }
            offset += 1;
        }
        (0, None)
    });

    env.chooser_cursor = cursor as u32;
    match choice {
        Some(pgnum) => VirtAddr::of_pgnum(pgnum),
        None => VirtAddr::new(UTOP),
    }
}

/// Age chooser: best (lowest) age within a walk bounded by the square
/// law. The bound shrinks as better candidates turn up, so the walk stays
/// short exactly when a cold page is already in hand.
pub fn age_page_choice(env: &mut UserEnv) -> VirtAddr {
    const TOTAL: usize = NPDENTRIES * NPTENTRIES;
    let utop_pgnum = UTOP as usize / PGSIZE;
    let nentries = utop_pgnum as f32;
    let start = env.chooser_cursor as usize % TOTAL;
    let machine = env.machine().clone();
    let id = env.id();

    let (cursor, choice) = machine.with_kernel(|k| {
        let Some(e) = k.envs.get(id) else { return (0, None) };
        let dir = e.pgdir;
        let mut best_age: u32 = MAX_PAGE_AGE as u32 + 1;
        let mut best_pgnum = 0usize;
        let mut have_best = false;
        let mut searched = 0usize;
        let mut pct = 1.0f32;
        let mut offset = 0usize;

        while offset < TOTAL {
            searched += 1;
            let actual = (start + offset) % TOTAL;
            let pde = k.phys.read_u32(dir, (actual / NPTENTRIES) * 4);
            if pde & PteFlags::PRESENT.bits() == 0 || actual >= utop_pgnum {
                // stride over the whole absent table; the skip is free and
                // never counts against the walk bound
                offset += NPTENTRIES - actual % NPTENTRIES - 1;
            } else {
                if let Some(age) = candidate_age(k, dir, actual) {
                    if (age as u32) < best_age {
                        best_age = age as u32;
                        best_pgnum = actual;
                        have_best = true;
                        pct = percentage_of_pgdir_to_walk(age);
                    }
                }
                if searched as f32 >= nentries * pct {
                    return (actual, have_best.then_some(best_pgnum));
                }
            }
            offset += 1;
        }
        (if have_best { start } else { 0 }, have_best.then_some(best_pgnum))
    });

    env.chooser_cursor = cursor as u32;
    match choice {
        Some(pgnum) => VirtAddr::of_pgnum(pgnum),
        None => VirtAddr::new(UTOP),
    }
}

/// Run the installed chooser and re-check its answer. A chooser that
/// names an unevictable page has corrupted paging state, which is fatal.
pub fn get_page_choice(env: &mut UserEnv) -> VirtAddr {
    let chooser = env.page_choice;
    let choice = chooser(env);
    let c = choice.as_u32();
    if c >= UXSTACKTOP - PGSIZE as u32 && c < UXSTACKTOP {
        panic!("page choice: tried to page out the user exception stack");
    }
    if c >= UTOP {
        return VirtAddr::new(UTOP);
    }
    if c <= UTEXT {
        panic!("page choice: tried to page out a text page ({c:#010x})");
    }
    let p = PteFlags::PRESENT.bits();
    let (pde, pte) = (env.pde(choice), env.pte(choice));
    if pde & p == 0 || pte & p == 0 {
        panic!("page choice: no valid mapping for {c:#010x}");
    }
    if pte & (PteFlags::SHARED | PteFlags::NO_PAGE).bits() != 0 {
        panic!("page choice: tried to page out a shared or pinned page");
    }
    let refcount = env
        .machine()
        .with_kernel(|k| k.frames.get(pte_frame(pte)).refcount);
    if refcount >= 2 {
        panic!("page choice: tried to page out a page mapped in more than one location");
    }
    choice
}

/// Bring the evicted page at `addr` back from swap.
///
/// Allocates a frame at `addr` (with write permission for the duration
/// of the transfer), grants it to the server, blocks for the reply, then
/// restores the stored permissions and clears the mapping-table entry.
pub fn page_in(env: &mut UserEnv, addr: VirtAddr) -> Result<()> {
    let server = find_paging_env(env).ok_or(KernelError::Paging)?;
    let mte_va = umapdir_walk(env, addr, false).ok_or(KernelError::Inval)?;
    let mte = env.read_u32(mte_va);
    if mte & MTE_P == 0 {
        return Err(KernelError::Inval);
    }
    let slot = mte_slot(mte);
    let stored_perm = (mte & PteFlags::SYSCALL.bits()) | PteFlags::PRESENT.bits();

    // the server fills the page through the shared mapping, so it must be
    // writable while the transfer is in flight
    page_alloc(
        env,
        EnvId::NULL,
        addr,
        stored_perm | PteFlags::WRITABLE.bits(),
        false,
    )?;
    ipc_send(env, server, (slot << 2) | PAGEREQ_PAGE_IN, Some(addr), UPW)?;
    let (reply, _, _) = ipc_recv(env, None)
        .unwrap_or_else(|e| panic!("page_in: failed to recv from paging server ({e})"));
    if (reply as i32) < 0 {
        panic!("page_in: paging server error ({})", reply as i32);
    }

    if stored_perm & PteFlags::WRITABLE.bits() == 0 {
        // restore the read-only view now that the contents are in place
        let r = env.sys_page_map(EnvId::NULL, addr, EnvId::NULL, addr, stored_perm);
        if r < 0 {
            panic!("page_in: cannot restore permissions ({r})");
        }
    }
    env.write_u32(mte_va, 0);
    Ok(())
}

/// Evict one page chosen by the victim chooser.
///
/// `Ok(false)` means no candidate exists. Errors from the server (swap
/// full, server missing) propagate.
pub fn page_out(env: &mut UserEnv) -> Result<bool> {
    let server = find_paging_env(env).ok_or(KernelError::Paging)?;
    let choice = get_page_choice(env);
    if choice.as_u32() >= UTOP {
        return Ok(false);
    }
    log::debug!("[{:08x}] page_out {:08x}", env.id().as_u32(), choice.as_u32());

    ipc_send(env, server, PAGEREQ_PAGE_OUT, Some(choice), UP)?;
    let (reply, _, _) = ipc_recv(env, None)
        .unwrap_or_else(|e| panic!("page_out: failed to recv from paging server ({e})"));
    if (reply as i32) < 0 {
        return Err(KernelError::from_errno(reply as i32).unwrap_or(KernelError::Paging));
    }
    let slot = reply;

    // capture permissions before the unmap; the avail bits survive it
    // either way (stable unmap), but the full word does not
    let pte = env.pte(choice);
    let perm = pte & PteFlags::SYSCALL.bits();
    env.sys_page_unmap(EnvId::NULL, choice);

    let mte_va =
        umapdir_walk(env, choice, true).expect("page_out: out of memory for mapping tables");
    env.write_u32(mte_va, (slot << MTE_FLAG_BITS) | perm | MTE_P);
    Ok(true)
}

/// Allocate a page at `va`, transparently evicting under memory
/// pressure.
///
/// With `check_mte`, allocating over a page that is currently on swap is
/// refused with `Inval`: the caller must unmap (reclaiming the slot) or
/// touch the page first.
pub fn page_alloc(
    env: &mut UserEnv,
    target: EnvId,
    va: VirtAddr,
    perm: u32,
    check_mte: bool,
) -> Result<()> {
    if !env.mapdir_ready {
        mapdir::init_map_dir(env);
    }
    if check_mte {
        if let Some(mte_va) = umapdir_walk(env, va, false) {
            if env.read_u32(mte_va) & MTE_P != 0 {
                return Err(KernelError::Inval);
            }
        }
    }

    let mut backoff = 0u32;
    loop {
        let r = env.sys_page_alloc(target, va, perm);
        if r == 0 {
            return Ok(());
        }
        let e = KernelError::from_errno(r).unwrap_or(KernelError::Inval);
        if e != KernelError::NoMem {
            return Err(e);
        }
        match page_out(env) {
            Ok(true) => {}
            // no victim, or no server to take one: memory is simply gone
            Ok(false) => return Err(KernelError::NoMem),
            Err(KernelError::Paging) => return Err(KernelError::NoMem),
            Err(other) => return Err(other),
        }
        // yield once every ten eviction rounds so the server gets CPU
        if backoff == 0 {
            env.sys_yield();
            backoff = 10;
        }
        backoff -= 1;
    }
}

/// Remote mapping-table entry located through `UTEMP`
struct RemoteMte {
    mte: u32,
    table_va: u32,
}

fn map_remote_at_utemp(env: &mut UserEnv, owner: EnvId, va: VirtAddr, perm: PteFlags) -> Result<()> {
    loop {
        let r = env.sys_page_map(owner, va, EnvId::NULL, VirtAddr::new(UTEMP), perm.bits());
        if r == 0 {
            return Ok(());
        }
        match KernelError::from_errno(r) {
            Some(KernelError::NoMem) => {
                if !page_out(env)? {
                    return Err(KernelError::NoMem);
                }
            }
            Some(e) => return Err(e),
            None => return Err(KernelError::Inval),
        }
    }
}

/// Read another environment's mapping-table entry for `va`, or `None`
/// when it has no mapping directory or no table there
fn peek_remote_mte(env: &mut UserEnv, owner: EnvId, va: VirtAddr) -> Result<Option<RemoteMte>> {
    if map_remote_at_utemp(env, owner, VirtAddr::new(UMAPDIR), UP).is_err() {
        return Ok(None);
    }
    let mde = env.read_u32(VirtAddr::new(UTEMP + mapdir::mdx(va) * 4));
    if mde & mapdir::MDE_P == 0 {
        let _ = env.sys_page_unmap(EnvId::NULL, VirtAddr::new(UTEMP));
        return Ok(None);
    }
    let table_va = mde & !0xfff;
    map_remote_at_utemp(env, owner, VirtAddr::new(table_va), UP)?;
    let mte = env.read_u32(VirtAddr::new(UTEMP + mapdir::mtx(va) * 4));
    let _ = env.sys_page_unmap(EnvId::NULL, VirtAddr::new(UTEMP));
    Ok(Some(RemoteMte { mte, table_va }))
}

/// Zero another environment's mapping-table entry for `va`
fn clear_remote_mte(env: &mut UserEnv, owner: EnvId, table_va: u32, va: VirtAddr) -> Result<()> {
    map_remote_at_utemp(env, owner, VirtAddr::new(table_va), UPW)?;
    env.write_u32(VirtAddr::new(UTEMP + mapdir::mtx(va) * 4), 0);
    let _ = env.sys_page_unmap(EnvId::NULL, VirtAddr::new(UTEMP));
    Ok(())
}

/// Page a remote environment's evicted page back in, staging the
/// contents through a scratch page of our own
fn remote_page_in(env: &mut UserEnv, owner: EnvId, va: VirtAddr, rm: RemoteMte) -> Result<()> {
    let server = find_paging_env(env).ok_or(KernelError::Paging)?;
    let slot = mte_slot(rm.mte);
    let stored_perm = (rm.mte & PteFlags::SYSCALL.bits()) | PteFlags::PRESENT.bits();

    let scratch = malloc::malloc(env).ok_or(KernelError::NoMem)?;
    ipc_send(env, server, (slot << 2) | PAGEREQ_PAGE_IN, Some(scratch), UPW)?;
    let (reply, _, _) = ipc_recv(env, None)?;
    if (reply as i32) < 0 {
        malloc::free(env, scratch);
        return Err(KernelError::from_errno(reply as i32).unwrap_or(KernelError::Paging));
    }

    loop {
        let r = env.sys_page_map(EnvId::NULL, scratch, owner, va, stored_perm);
        if r == 0 {
            break;
        }
        match KernelError::from_errno(r) {
            Some(KernelError::NoMem) => {
                if !page_out(env)? {
                    return Err(KernelError::NoMem);
                }
            }
            Some(e) => return Err(e),
            None => return Err(KernelError::Inval),
        }
    }
    malloc::free(env, scratch);
    clear_remote_mte(env, owner, rm.table_va, va)
}

/// Map `src_va` of `src_env` at `dst_va` of `dst_env`, paging the source
/// in first when it turns out to be on swap
pub fn page_map(
    env: &mut UserEnv,
    src_env: EnvId,
    src_va: VirtAddr,
    dst_env: EnvId,
    dst_va: VirtAddr,
    perm: u32,
) -> Result<()> {
    if !env.mapdir_ready {
        mapdir::init_map_dir(env);
    }
    loop {
        let r = env.sys_page_map(src_env, src_va, dst_env, dst_va, perm);
        if r == 0 {
            // mapping over an evicted destination: the stored page is
            // dead, hand its slot back
            reclaim_shadowed_slot(env, dst_env, dst_va)?;
            return Ok(());
        }
        match KernelError::from_errno(r) {
            Some(KernelError::NoMem) => {
                if !page_out(env)? {
                    return Err(KernelError::NoMem);
                }
                continue;
            }
            Some(KernelError::Inval) => {}
            Some(e) => return Err(e),
            None => return Err(KernelError::Inval),
        }

        // Inval: either really unmapped, or evicted. Consult the source's
        // mapping directory to tell the difference.
        let src_is_self = src_env.is_null() || src_env == env.id();
        if src_is_self {
            let Some(mte_va) = umapdir_walk(env, src_va, false) else {
                return Err(KernelError::Inval);
            };
            if env.read_u32(mte_va) & MTE_P == 0 {
                return Err(KernelError::Inval);
            }
            loop {
                match page_in(env, src_va) {
                    Ok(()) => break,
                    Err(KernelError::NoMem) => {
                        if !page_out(env)? {
                            return Err(KernelError::NoMem);
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        } else {
            match peek_remote_mte(env, src_env, src_va)? {
                Some(rm) if rm.mte & MTE_P != 0 => remote_page_in(env, src_env, src_va, rm)?,
                _ => return Err(KernelError::Inval),
            }
        }
        // source resident again; retry the map call
    }
}

/// Drop a stale mapping-table entry left under a freshly created
/// mapping, returning its swap slot to the server
fn reclaim_shadowed_slot(env: &mut UserEnv, owner: EnvId, va: VirtAddr) -> Result<()> {
    let owner_is_self = owner.is_null() || owner == env.id();
    if owner_is_self {
        if !env.mapdir_ready {
            return Ok(());
        }
        let Some(mte_va) = umapdir_walk(env, va, false) else {
            return Ok(());
        };
        let mte = env.read_u32(mte_va);
        if mte & MTE_P == 0 {
            return Ok(());
        }
        env.write_u32(mte_va, 0);
        return page_remove(env, mte_slot(mte));
    }
    if find_paging_env(env).is_none() {
        return Ok(());
    }
    let Some(rm) = peek_remote_mte(env, owner, va)? else {
        return Ok(());
    };
    if rm.mte & MTE_P == 0 {
        return Ok(());
    }
    clear_remote_mte(env, owner, rm.table_va, va)?;
    page_remove(env, mte_slot(rm.mte))
}

/// Unmap `va` in `target`. Unmapping another environment's page that is
/// on swap additionally returns the swap slot to the server and clears
/// the owner's mapping-table entry.
pub fn page_unmap(env: &mut UserEnv, target: EnvId, va: VirtAddr) -> Result<()> {
    let r = env.sys_page_unmap(target, va);
    if r < 0 {
        return Err(KernelError::from_errno(r).unwrap_or(KernelError::Inval));
    }
    if target.is_null() || target == env.id() {
        return Ok(());
    }
    if find_paging_env(env).is_none() {
        return Ok(());
    }
    if !env.mapdir_ready {
        mapdir::init_map_dir(env);
    }
    let Some(rm) = peek_remote_mte(env, target, va)? else {
        return Ok(());
    };
    if rm.mte & MTE_P == 0 {
        return Ok(());
    }
    clear_remote_mte(env, target, rm.table_va, va)?;
    page_remove(env, mte_slot(rm.mte))
}

/// Tell the server to drop a swap slot without reading it
pub fn page_remove(env: &mut UserEnv, slot: u32) -> Result<()> {
    let scratch = malloc::malloc(env).ok_or(KernelError::NoMem)?;
    let r = page_remove_with_scratch(env, slot, scratch);
    malloc::free(env, scratch);
    r
}

fn page_remove_with_scratch(env: &mut UserEnv, slot: u32, scratch: VirtAddr) -> Result<()> {
    let server = find_paging_env(env).ok_or(KernelError::Paging)?;
    ipc_send(env, server, (slot << 2) | PAGEREQ_PAGE_REMOVE, Some(scratch), UP)?;
    let (reply, _, _) = ipc_recv(env, None)?;
    if (reply as i32) < 0 {
        return Err(KernelError::from_errno(reply as i32).unwrap_or(KernelError::Paging));
    }
    Ok(())
}

/// The paging fault handler: pages in a faulting address that the
/// mapping directory says is on swap. Degrades to "not handled" when the
/// server is missing, letting the next handler (or the panic) run.
pub fn paging_pgfault_handler(env: &mut UserEnv, utf: &UTrapframe) -> bool {
    if find_paging_env(env).is_none() || !env.mapdir_ready {
        return false;
    }
    let addr = VirtAddr::new(utf.fault_va).page_base();
    let Some(mte_va) = umapdir_walk(env, addr, false) else {
        return false;
    };
    if env.read_u32(mte_va) & MTE_P == 0 {
        return false;
    }
    page_in(env, addr).is_ok()
}

/// Fetch the server's counters
pub fn get_paging_stats(env: &mut UserEnv) -> Option<PageStats> {
    let server = find_paging_env(env)?;
    let page = malloc::malloc(env)?;
    ipc_send(env, server, PAGEREQ_PAGE_STAT, Some(page), UPW).ok()?;
    ipc_recv(env, Some(page)).ok()?;
    let stats = PageStats {
        page_outs: env.read_u32(page),
        page_ins: env.read_u32(VirtAddr::new(page.as_u32() + 4)),
        page_removes: env.read_u32(VirtAddr::new(page.as_u32() + 8)),
    };
    malloc::free(env, page);
    Some(stats)
}

/// Process exit: hand every still-reserved swap slot back to the server,
/// then destroy the environment
pub fn exit(env: &mut UserEnv) {
    if env.mapdir_ready && find_paging_env(env).is_some() {
        if let Some(scratch) = malloc::malloc(env) {
            for mdx_i in 0..NPDENTRIES as u32 {
                let mde = env.read_u32(VirtAddr::new(UMAPDIR + mdx_i * 4));
                if mde & mapdir::MDE_P == 0 {
                    continue;
                }
                let table_va = mde & !0xfff;
                for mtx_i in 0..NPTENTRIES as u32 {
                    let mte_va = VirtAddr::new(table_va + mtx_i * 4);
                    let mte = env.read_u32(mte_va);
                    if mte & MTE_P != 0 {
                        let _ = page_remove_with_scratch(env, mte_slot(mte), scratch);
                        env.write_u32(mte_va, 0);
                    }
                }
            }
            malloc::free(env, scratch);
        }
    }
    env.sys_env_destroy(EnvId::NULL);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvType;
    use crate::machine::{Machine, MachineConfig};
    use alloc::sync::Arc;

    #[test]
    fn square_law_shape() {
        assert!(percentage_of_pgdir_to_walk(0) < 1e-4);
        let mid = percentage_of_pgdir_to_walk(128);
        assert!(mid > 0.2 && mid < 0.3);
        let hot = percentage_of_pgdir_to_walk(MAX_PAGE_AGE);
        assert!(hot > 0.98 && hot <= 1.0);
        // monotone
        let mut prev = 0.0f32;
        for age in 0..=MAX_PAGE_AGE {
            let f = percentage_of_pgdir_to_walk(age);
            assert!(f >= prev);
            prev = f;
        }
    }

    fn user_env(npages: usize) -> UserEnv {
        let m = Arc::new(Machine::new(MachineConfig { npages, nenv: 8 }));
        let id = m.env_create(EnvType::User).unwrap();
        UserEnv::attach(m, id)
    }

    fn set_frame_age(env: &UserEnv, va: VirtAddr, age: u8) {
        let pte = env.pte(va);
        env.machine().with_kernel(|k| {
            k.frames.get_mut(pte_frame(pte)).age = age;
        });
    }

    #[test]
    fn age_chooser_picks_the_coldest_eligible_page() {
        let mut env = user_env(256);
        let upw = (PteFlags::PRESENT | PteFlags::USER | PteFlags::WRITABLE).bits();

        let normal = VirtAddr::new(0x1000_0000);
        let cold_shared = VirtAddr::new(0x1000_1000);
        let cold_pinned = VirtAddr::new(0x1000_2000);
        let cold_double = VirtAddr::new(0x1000_3000);
        assert_eq!(env.sys_page_alloc(EnvId::NULL, normal, upw), 0);
        assert_eq!(
            env.sys_page_alloc(EnvId::NULL, cold_shared, upw | PteFlags::SHARED.bits()),
            0
        );
        assert_eq!(
            env.sys_page_alloc(EnvId::NULL, cold_pinned, upw | PteFlags::NO_PAGE.bits()),
            0
        );
        assert_eq!(env.sys_page_alloc(EnvId::NULL, cold_double, upw), 0);
        // alias the last one so its frame is cross-mapped
        assert_eq!(
            env.sys_page_map(EnvId::NULL, cold_double, EnvId::NULL, VirtAddr::new(0x1100_0000), upw),
            0
        );

        set_frame_age(&env, normal, 40);
        set_frame_age(&env, cold_shared, 0);
        set_frame_age(&env, cold_pinned, 0);
        set_frame_age(&env, cold_double, 0);

        assert_eq!(age_page_choice(&mut env), normal);
    }

    #[test]
    fn age_chooser_prefers_lower_age() {
        let mut env = user_env(256);
        let upw = (PteFlags::PRESENT | PteFlags::USER | PteFlags::WRITABLE).bits();
        let warm = VirtAddr::new(0x1000_0000);
        let cold = VirtAddr::new(0x1000_5000);
        assert_eq!(env.sys_page_alloc(EnvId::NULL, warm, upw), 0);
        assert_eq!(env.sys_page_alloc(EnvId::NULL, cold, upw), 0);
        set_frame_age(&env, warm, 200);
        set_frame_age(&env, cold, 3);
        assert_eq!(age_page_choice(&mut env), cold);
    }

    #[test]
    fn choosers_report_no_candidate_as_utop() {
        let mut env = user_env(256);
        assert_eq!(age_page_choice(&mut env), VirtAddr::new(UTOP));
        assert_eq!(default_page_choice(&mut env), VirtAddr::new(UTOP));
        assert_eq!(get_page_choice(&mut env), VirtAddr::new(UTOP));
    }

    #[test]
    fn default_chooser_round_robins() {
        let mut env = user_env(256);
        set_page_choice(&mut env, default_page_choice);
        let upw = (PteFlags::PRESENT | PteFlags::USER | PteFlags::WRITABLE).bits();
        let a = VirtAddr::new(0x1000_0000);
        let b = VirtAddr::new(0x1000_1000);
        assert_eq!(env.sys_page_alloc(EnvId::NULL, a, upw), 0);
        assert_eq!(env.sys_page_alloc(EnvId::NULL, b, upw), 0);
        let first = default_page_choice(&mut env);
        // once the chosen page is gone (as after an eviction), the cursor
        // moves on to the next candidate
        assert_eq!(env.sys_page_unmap(EnvId::NULL, first), 0);
        let second = default_page_choice(&mut env);
        assert_ne!(first, second, "cursor must advance past the last choice");
    }

    #[test]
    fn page_alloc_without_server_surfaces_no_mem() {
        // tiny machine: exhaustion with no swap server to fall back on
        let mut env = user_env(64);
        let upw = (PteFlags::PRESENT | PteFlags::USER | PteFlags::WRITABLE).bits();
        let mut failed = None;
        for i in 0..64u32 {
            let va = VirtAddr::new(0x1000_0000 + i * PGSIZE as u32);
            match page_alloc(&mut env, EnvId::NULL, va, upw, true) {
                Ok(()) => {}
                Err(e) => {
                    failed = Some(e);
                    break;
                }
            }
        }
        assert_eq!(failed, Some(KernelError::NoMem));
    }
}
