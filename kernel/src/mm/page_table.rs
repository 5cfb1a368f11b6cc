//! Hardware page-table operations
//!
//! Two-level directory walk, insert, lookup and remove, operating on page
//! tables stored inside the physical frame arena. Every leaf insert and
//! remove keeps the reverse map and the owning environment's page charge
//! in step with the PTEs.

use super::frame::{FrameNumber, FrameTable};
use super::phys::{PhysMem, PteSlot};
use super::rmap::RmapArena;
use super::{make_pte, pte_frame, PteFlags, VirtAddr, NPDENTRIES, NPTENTRIES, PGSIZE, UTOP};
use crate::error::{KernelError, Result};

/// Note the mapping change to the translation hardware. The simulated MMU
/// reads the tables directly, so there is nothing to flush.
#[inline]
fn tlb_invalidate(_dir: FrameNumber, _va: VirtAddr) {}

/// Allocate and pin a fresh, empty page directory
pub fn create_dir(phys: &mut PhysMem, frames: &mut FrameTable) -> Result<FrameNumber> {
    let dir = frames.alloc(phys, true).ok_or(KernelError::NoMem)?;
    frames.incref(dir);
    Ok(dir)
}

/// PTE slot for `va`, without creating the second-level table
fn walk_no_create(phys: &PhysMem, dir: FrameNumber, va: VirtAddr) -> Option<PteSlot> {
    let pde = phys.read_u32(dir, va.pdx() * 4);
    if pde & PteFlags::PRESENT.bits() == 0 {
        return None;
    }
    Some(PteSlot::new(pte_frame(pde), va.ptx() as u16))
}

/// Find the PTE slot for `va` in `dir`.
///
/// When the second-level table is absent: with `create` false returns
/// `Ok(None)`; with `create` true allocates a zeroed table frame, installs
/// it user+writable+present, and returns the slot. `Err(NoMem)` when the
/// table allocation fails.
pub fn dir_walk(
    phys: &mut PhysMem,
    frames: &mut FrameTable,
    dir: FrameNumber,
    va: VirtAddr,
    create: bool,
) -> Result<Option<PteSlot>> {
    if let Some(slot) = walk_no_create(phys, dir, va) {
        return Ok(Some(slot));
    }
    if !create {
        return Ok(None);
    }
    let table = frames.alloc(phys, true).ok_or(KernelError::NoMem)?;
    frames.incref(table);
    let pde = make_pte(
        table,
        PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER,
    );
    phys.write_u32(dir, va.pdx() * 4, pde);
    Ok(Some(PteSlot::new(table, va.ptx() as u16)))
}

/// Look up the frame mapped at `va`, if any
pub fn lookup(phys: &PhysMem, dir: FrameNumber, va: VirtAddr) -> Option<(FrameNumber, PteSlot)> {
    let slot = walk_no_create(phys, dir, va)?;
    let pte = slot.load(phys);
    if pte & PteFlags::PRESENT.bits() == 0 {
        return None;
    }
    Some((pte_frame(pte), slot))
}

/// Map `frame` at `va` with `perm | PRESENT`.
///
/// An existing mapping at `va` is removed first; remapping the same frame
/// at the same slot is safe because the refcount is taken up before the
/// removal. `charge` is the owning environment's mapped-page counter.
pub fn insert(
    phys: &mut PhysMem,
    frames: &mut FrameTable,
    rmap: &mut RmapArena,
    dir: FrameNumber,
    frame: FrameNumber,
    va: VirtAddr,
    perm: PteFlags,
    mut charge: Option<&mut u32>,
) -> Result<()> {
    let slot = match dir_walk(phys, frames, dir, va, true)? {
        Some(slot) => slot,
        None => return Err(KernelError::NoMem),
    };
    frames.incref(frame);
    if slot.load(phys) & PteFlags::PRESENT.bits() != 0 {
        remove(phys, frames, rmap, dir, va, charge.as_deref_mut());
    }
    slot.store(phys, make_pte(frame, perm | PteFlags::PRESENT));
    rmap.attach(frames, frame, slot, dir, va.page_base());
    if let Some(c) = charge {
        *c += 1;
    }
    tlb_invalidate(dir, va);
    Ok(())
}

/// Unmap `va`. Silently does nothing when no page is mapped.
///
/// This is a "stable" unmap: the avail bits stay behind in the slot so
/// user code that captured them before unmapping observes stable values.
pub fn remove(
    phys: &mut PhysMem,
    frames: &mut FrameTable,
    rmap: &mut RmapArena,
    dir: FrameNumber,
    va: VirtAddr,
    charge: Option<&mut u32>,
) {
    let Some((frame, slot)) = lookup(phys, dir, va) else {
        return;
    };
    let detached = rmap.detach(frames, frame, dir, va.page_base());
    debug_assert_eq!(detached, slot);
    frames.decref(frame);
    let pte = slot.load(phys);
    slot.store(phys, pte & PteFlags::AVAIL.bits());
    tlb_invalidate(dir, va);
    if let Some(c) = charge {
        debug_assert!(*c > 0, "page charge underflow");
        *c -= 1;
    }
}

/// Check that [`va`, `va + len`) lies under `UTOP` and is mapped with
/// `need` permissions (PRESENT is always required)
pub fn user_mem_check(
    phys: &PhysMem,
    dir: FrameNumber,
    va: VirtAddr,
    len: usize,
    need: PteFlags,
) -> Result<()> {
    let start = va.as_usize();
    let end = start.checked_add(len).ok_or(KernelError::Inval)?;
    if end > UTOP as usize {
        return Err(KernelError::Inval);
    }
    let need_bits = (need | PteFlags::PRESENT).bits();
    let mut page = va.page_base().as_usize();
    while page < end {
        let ok = walk_no_create(phys, dir, VirtAddr::new(page as u32))
            .map(|slot| slot.load(phys) & need_bits == need_bits)
            .unwrap_or(false);
        if !ok {
            return Err(KernelError::Inval);
        }
        page += PGSIZE;
    }
    Ok(())
}

/// Tear down every mapping, every page table and the directory itself
pub fn destroy_dir(
    phys: &mut PhysMem,
    frames: &mut FrameTable,
    rmap: &mut RmapArena,
    dir: FrameNumber,
) {
    for pdx in 0..NPDENTRIES {
        let pde = phys.read_u32(dir, pdx * 4);
        if pde & PteFlags::PRESENT.bits() == 0 {
            continue;
        }
        let table = pte_frame(pde);
        for ptx in 0..NPTENTRIES {
            let slot = PteSlot::new(table, ptx as u16);
            if slot.load(phys) & PteFlags::PRESENT.bits() != 0 {
                let va = VirtAddr::new(((pdx as u32) << 22) | ((ptx as u32) << 12));
                remove(phys, frames, rmap, dir, va, None);
            }
        }
        phys.write_u32(dir, pdx * 4, 0);
        frames.decref(table);
    }
    frames.decref(dir);
}
