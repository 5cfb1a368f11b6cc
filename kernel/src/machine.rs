//! The machine: boot, the big kernel lock, and guest memory access
//!
//! All kernel state lives in [`Kernel`] behind one `spin::Mutex`, which
//! is the big kernel lock of the concurrency model. Every entry from user mode (a
//! system call, a memory access through the page tables, a timer tick)
//! acquires it; scheduling decisions release it and call the yield hook.
//!
//! Nothing here is a global: the handle is passed explicitly, and tests
//! construct as many machines as they like.

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;

use spin::{Mutex, MutexGuard};

use crate::env::{EnvId, EnvStatus, EnvTable, EnvType, Trapframe};
use crate::error::{KernelError, Result};
use crate::mm::ager::AgerState;
use crate::mm::page_table;
use crate::mm::{
    pte_flags, FrameNumber, FrameTable, PhysMem, PteFlags, RmapArena, VirtAddr, FEC_PR, FEC_WR,
    NPDENTRIES, NPTENTRIES, PGSIZE,
};

/// Boot-time sizing knobs
#[derive(Debug, Clone, Copy)]
pub struct MachineConfig {
    /// Number of physical frames
    pub npages: usize,
    /// Environment table capacity (power of two)
    pub nenv: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            npages: 1024,
            nenv: crate::env::table::NENV,
        }
    }
}

/// Everything the kernel owns, guarded by the big kernel lock
pub struct Kernel {
    pub phys: PhysMem,
    pub frames: FrameTable,
    pub rmap: RmapArena,
    pub envs: EnvTable,
    pub ager: AgerState,
    pub(crate) console_out: Vec<u8>,
    pub(crate) console_in: VecDeque<u8>,
}

/// Why a guest memory access could not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAccess {
    /// The MMU faulted; `err` carries the FEC_* bits
    Fault { err: u32 },
    /// The environment is descheduled; retry after yielding
    NotRunnable,
    /// The environment no longer exists
    Gone,
}

/// Read-only view of an environment, the moral equivalent of the
/// user-readable environment array mapping
#[derive(Debug, Clone, Copy)]
pub struct EnvView {
    pub id: EnvId,
    pub parent: EnvId,
    pub status: EnvStatus,
    pub etype: EnvType,
    pub eax: u32,
    pub ipc_from: EnvId,
    pub ipc_value: u32,
    pub ipc_perm: PteFlags,
    pub pgfault_upcall: u32,
    pub pages_charged: u32,
}

fn spin_yield() {
    core::hint::spin_loop();
}

/// One simulated machine
pub struct Machine {
    kernel: Mutex<Kernel>,
    yield_hook: Mutex<fn()>,
}

impl Machine {
    /// Boot: build physical memory, the frame table and an empty
    /// environment table
    pub fn new(config: MachineConfig) -> Self {
        let phys = PhysMem::new(config.npages);
        let frames = FrameTable::new(config.npages);
        Self {
            kernel: Mutex::new(Kernel {
                phys,
                frames,
                rmap: RmapArena::new(),
                envs: EnvTable::new(config.nenv),
                ager: AgerState::default(),
                console_out: Vec::new(),
                console_in: VecDeque::new(),
            }),
            yield_hook: Mutex::new(spin_yield),
        }
    }

    /// Acquire the big kernel lock
    pub fn kernel(&self) -> MutexGuard<'_, Kernel> {
        self.kernel.lock()
    }

    /// Run `f` under the big kernel lock
    pub fn with_kernel<R>(&self, f: impl FnOnce(&mut Kernel) -> R) -> R {
        f(&mut self.kernel())
    }

    /// Install the scheduler yield hook (`std::thread::yield_now` in
    /// hosted tests). The default is a spin hint.
    pub fn set_yield_hook(&self, hook: fn()) {
        *self.yield_hook.lock() = hook;
    }

    /// Give up the CPU
    pub fn yield_now(&self) {
        let hook = *self.yield_hook.lock();
        hook();
    }

    /// Create a root environment (boot loads it directly; no parent)
    pub fn env_create(&self, etype: EnvType) -> Result<EnvId> {
        let mut k = self.kernel();
        let k = &mut *k;
        let dir = page_table::create_dir(&mut k.phys, &mut k.frames)?;
        match k.envs.alloc(EnvId::NULL, etype, dir) {
            Ok(id) => {
                log::debug!("env_create: {:08x} ({:?})", id.as_u32(), etype);
                Ok(id)
            }
            Err(e) => {
                let Kernel { phys, frames, rmap, .. } = k;
                page_table::destroy_dir(phys, frames, rmap, dir);
                Err(e)
            }
        }
    }

    /// Snapshot of one environment
    pub fn env_snapshot(&self, id: EnvId) -> Option<EnvView> {
        let k = self.kernel();
        k.envs.get(id).map(|e| EnvView {
            id: e.id,
            parent: e.parent,
            status: e.status,
            etype: e.etype,
            eax: e.tf.regs.eax,
            ipc_from: e.ipc_from,
            ipc_value: e.ipc_value,
            ipc_perm: e.ipc_perm,
            pgfault_upcall: e.pgfault_upcall,
            pages_charged: e.pages_charged,
        })
    }

    /// First live environment of the given type
    pub fn find_env_of_type(&self, etype: EnvType) -> Option<EnvId> {
        self.kernel().envs.find_by_type(etype)
    }

    /// The caller's saved register frame, for deferred IPC return values
    pub fn env_trapframe(&self, id: EnvId) -> Option<Trapframe> {
        self.kernel().envs.get(id).map(|e| e.tf)
    }

    fn guest_access_prologue(k: &Kernel, id: EnvId) -> core::result::Result<FrameNumber, UserAccess> {
        match k.envs.get(id) {
            None => Err(UserAccess::Gone),
            Some(e) => match e.status {
                EnvStatus::Dying => Err(UserAccess::Gone),
                EnvStatus::NotRunnable => Err(UserAccess::NotRunnable),
                EnvStatus::Runnable => Ok(e.pgdir),
            },
        }
    }

    /// Guest u32 load at `va` (must be 4-aligned) in `env`'s address space
    pub fn user_read_u32(&self, env: EnvId, va: VirtAddr) -> core::result::Result<u32, UserAccess> {
        assert_eq!(va.as_u32() & 3, 0, "unaligned guest access");
        let mut k = self.kernel();
        let dir = Self::guest_access_prologue(&k, env)?;
        let (frame, offset) = k.translate(dir, va, false).map_err(|err| UserAccess::Fault { err })?;
        Ok(k.phys.read_u32(frame, offset))
    }

    /// Guest u32 store
    pub fn user_write_u32(
        &self,
        env: EnvId,
        va: VirtAddr,
        value: u32,
    ) -> core::result::Result<(), UserAccess> {
        assert_eq!(va.as_u32() & 3, 0, "unaligned guest access");
        let mut k = self.kernel();
        let dir = Self::guest_access_prologue(&k, env)?;
        let (frame, offset) = k.translate(dir, va, true).map_err(|err| UserAccess::Fault { err })?;
        k.phys.write_u32(frame, offset, value);
        Ok(())
    }

    /// Page-sized guest memmove: both addresses must be page-aligned and
    /// mapped (source readable, destination writable)
    pub fn copy_user_page(
        &self,
        env: EnvId,
        src: VirtAddr,
        dst: VirtAddr,
    ) -> core::result::Result<(), UserAccess> {
        assert!(src.is_page_aligned() && dst.is_page_aligned());
        let mut k = self.kernel();
        let dir = Self::guest_access_prologue(&k, env)?;
        let (sf, _) = k.translate(dir, src, false).map_err(|err| UserAccess::Fault { err })?;
        let (df, _) = k.translate(dir, dst, true).map_err(|err| UserAccess::Fault { err })?;
        k.phys.copy_frame(sf, df);
        Ok(())
    }

    /// Bulk guest read of one whole page
    pub fn user_read_page(
        &self,
        env: EnvId,
        va: VirtAddr,
        buf: &mut [u8; PGSIZE],
    ) -> core::result::Result<(), UserAccess> {
        assert!(va.is_page_aligned());
        let mut k = self.kernel();
        let dir = Self::guest_access_prologue(&k, env)?;
        let (frame, _) = k.translate(dir, va, false).map_err(|err| UserAccess::Fault { err })?;
        buf.copy_from_slice(k.phys.frame(frame));
        Ok(())
    }

    /// Bulk guest write of one whole page
    pub fn user_write_page(
        &self,
        env: EnvId,
        va: VirtAddr,
        buf: &[u8; PGSIZE],
    ) -> core::result::Result<(), UserAccess> {
        assert!(va.is_page_aligned());
        let mut k = self.kernel();
        let dir = Self::guest_access_prologue(&k, env)?;
        let (frame, _) = k.translate(dir, va, true).map_err(|err| UserAccess::Fault { err })?;
        k.phys.frame_mut(frame).copy_from_slice(buf);
        Ok(())
    }

    /// The (pde, pte) pair visible at `va`: the read-only page-table
    /// window user code walks
    pub fn user_pte(&self, env: EnvId, va: VirtAddr) -> (u32, u32) {
        let k = self.kernel();
        let Some(e) = k.envs.get(env) else { return (0, 0) };
        let pde = k.phys.read_u32(e.pgdir, va.pdx() * 4);
        if pde & PteFlags::PRESENT.bits() == 0 {
            return (pde, 0);
        }
        let pte = k.phys.read_u32(crate::mm::pte_frame(pde), va.ptx() * 4);
        (pde, pte)
    }

    /// Push bytes into the console input queue
    pub fn feed_console_input(&self, bytes: &[u8]) {
        self.kernel().console_in.extend(bytes.iter().copied());
    }

    /// Everything written to the console so far
    pub fn console_output(&self) -> String {
        String::from_utf8_lossy(&self.kernel().console_out).into_owned()
    }

    /// Assert the §8 structural invariants at a quiescent point.
    /// Panics on violation; meant for tests.
    pub fn check_invariants(&self) {
        let k = self.kernel();
        let npages = k.frames.npages();

        // directory/table references per frame, from walking every live
        // address space
        let mut table_refs = alloc::vec![0usize; npages];
        for e in k.envs.iter() {
            table_refs[e.pgdir.as_usize()] += 1; // the pinned directory
            for pdx in 0..NPDENTRIES {
                let pde = k.phys.read_u32(e.pgdir, pdx * 4);
                if pde & PteFlags::PRESENT.bits() != 0 {
                    table_refs[crate::mm::pte_frame(pde).as_usize()] += 1;
                }
            }
        }

        for i in 0..npages {
            let f = FrameNumber::new(i as u32);
            let info = k.frames.get(f);
            assert!(info.age <= crate::mm::MAX_PAGE_AGE);
            assert!(info.nfu_age <= crate::mm::MAX_PAGE_AGE);
            let chain = k.rmap.chain_len(info.rmap_head);
            assert_eq!(
                info.refcount as usize,
                chain + table_refs[i],
                "frame {i}: refcount does not match chain + table uses"
            );
        }

        // every present PTE appears on exactly one chain, on the right frame
        for e in k.envs.iter() {
            for pdx in 0..NPDENTRIES {
                let pde = k.phys.read_u32(e.pgdir, pdx * 4);
                if pde & PteFlags::PRESENT.bits() == 0 {
                    continue;
                }
                let table = crate::mm::pte_frame(pde);
                for ptx in 0..NPTENTRIES {
                    let pte = k.phys.read_u32(table, ptx * 4);
                    if pte & PteFlags::PRESENT.bits() == 0 {
                        continue;
                    }
                    let va = VirtAddr::new(((pdx as u32) << 22) | ((ptx as u32) << 12));
                    let frame = crate::mm::pte_frame(pte);
                    let mut hits = 0;
                    k.rmap.for_each(k.frames.get(frame).rmap_head, |n| {
                        if n.dir == e.pgdir && n.va == va {
                            hits += 1;
                        }
                    });
                    assert_eq!(
                        hits, 1,
                        "pte {:08x}@{:08x}: {} reverse-map nodes",
                        pte,
                        va.as_u32(),
                        hits
                    );
                }
            }
        }

        // blocked-sender queues: acyclic, members not runnable
        for e in k.envs.iter() {
            let mut seen = 0usize;
            let mut cur = e.ipc_blocked_sender;
            while let Some(sid) = cur {
                seen += 1;
                assert!(seen <= k.envs.nenv(), "blocked-sender queue cycle");
                let s = k.envs.get(sid).expect("queued sender vanished");
                assert_eq!(s.status, EnvStatus::NotRunnable);
                cur = s.ipc_sender_chain;
            }
        }
    }
}

impl Kernel {
    /// Translate `va` for a user-mode access, setting the accessed (and on
    /// writes, dirty) bits the way the MMU would. Returns the FEC_* error
    /// bits on a fault.
    pub fn translate(
        &mut self,
        dir: FrameNumber,
        va: VirtAddr,
        write: bool,
    ) -> core::result::Result<(FrameNumber, usize), u32> {
        let wr = if write { FEC_WR } else { 0 };
        let Some((frame, slot)) = page_table::lookup(&self.phys, dir, va) else {
            return Err(wr);
        };
        let pte = slot.load(&self.phys);
        let flags = pte_flags(pte);
        if !flags.contains(PteFlags::USER) {
            return Err(wr | FEC_PR);
        }
        if write && !flags.contains(PteFlags::WRITABLE) {
            return Err(wr | FEC_PR);
        }
        let mut updated = pte | PteFlags::ACCESSED.bits();
        if write {
            updated |= PteFlags::DIRTY.bits();
        }
        if updated != pte {
            slot.store(&mut self.phys, updated);
        }
        Ok((frame, va.page_offset()))
    }

    /// Kernel-side u32 load through a user address space
    pub fn read_user_u32(&mut self, dir: FrameNumber, va: VirtAddr) -> core::result::Result<u32, u32> {
        let (frame, offset) = self.translate(dir, va, false)?;
        Ok(self.phys.read_u32(frame, offset))
    }

    /// Kernel-side u32 store through a user address space
    pub fn write_user_u32(
        &mut self,
        dir: FrameNumber,
        va: VirtAddr,
        value: u32,
    ) -> core::result::Result<(), u32> {
        let (frame, offset) = self.translate(dir, va, true)?;
        self.phys.write_u32(frame, offset, value);
        Ok(())
    }

    /// Release everything an environment owns and free its slot.
    /// Blocked senders queued on it are woken with `BadEnv`, and the
    /// environment is unlinked from any queue it was itself waiting on.
    pub(crate) fn env_free(&mut self, id: EnvId) {
        let Some(e) = self.envs.get(id) else { return };
        let pgdir = e.pgdir;
        let mut cur = e.ipc_blocked_sender;

        // drop out of other environments' blocked-sender queues
        let owners: Vec<EnvId> = self.envs.iter().map(|e| e.id).filter(|&o| o != id).collect();
        let my_chain = self.envs.get(id).unwrap().ipc_sender_chain;
        for owner in owners {
            if self.envs.get(owner).unwrap().ipc_blocked_sender == Some(id) {
                self.envs.get_mut(owner).unwrap().ipc_blocked_sender = my_chain;
                continue;
            }
            let mut prev = self.envs.get(owner).unwrap().ipc_blocked_sender;
            while let Some(p) = prev {
                let next = self.envs.get(p).unwrap().ipc_sender_chain;
                if next == Some(id) {
                    self.envs.get_mut(p).unwrap().ipc_sender_chain = my_chain;
                    break;
                }
                prev = next;
            }
        }
        while let Some(sid) = cur {
            cur = match self.envs.get_mut(sid) {
                Some(s) => {
                    let next = s.ipc_sender_chain.take();
                    s.status = EnvStatus::Runnable;
                    s.tf.regs.eax = KernelError::BadEnv.to_errno() as u32;
                    s.ipc_page_sending = None;
                    next
                }
                None => None,
            };
        }
        let Kernel { phys, frames, rmap, .. } = self;
        page_table::destroy_dir(phys, frames, rmap, pgdir);
        self.envs.free(id);
        log::debug!("env_free: {:08x}", id.as_u32());
    }

    /// Mark an environment for destruction. The caller destroying itself
    /// is collected by the dispatcher on this same kernel entry; anyone
    /// else is collected at their next kernel entry.
    pub(crate) fn env_destroy(&mut self, id: EnvId) {
        if let Some(e) = self.envs.get_mut(id) {
            e.status = EnvStatus::Dying;
        }
    }

    /// Number of frames a single environment may hold when memory runs low
    pub(crate) fn fair_share(&self) -> usize {
        let live = self.envs.live_count().max(1);
        self.frames.npages() / live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_and_create_env() {
        let m = Machine::new(MachineConfig { npages: 32, nenv: 8 });
        let id = m.env_create(EnvType::User).unwrap();
        let view = m.env_snapshot(id).unwrap();
        assert_eq!(view.status, EnvStatus::Runnable);
        assert_eq!(view.pages_charged, 0);
        assert_eq!(m.find_env_of_type(EnvType::PageServer), None);
        m.check_invariants();
    }

    #[test]
    fn guest_access_faults_on_unmapped() {
        let m = Machine::new(MachineConfig { npages: 32, nenv: 8 });
        let id = m.env_create(EnvType::User).unwrap();
        assert_eq!(
            m.user_read_u32(id, VirtAddr::new(0x1000)),
            Err(UserAccess::Fault { err: 0 })
        );
        assert_eq!(
            m.user_write_u32(id, VirtAddr::new(0x1000), 1),
            Err(UserAccess::Fault { err: FEC_WR })
        );
    }

    #[test]
    fn guest_access_after_mapping() {
        let m = Machine::new(MachineConfig { npages: 32, nenv: 8 });
        let id = m.env_create(EnvType::User).unwrap();
        {
            let mut k = m.kernel();
            let k = &mut *k;
            let dir = k.envs.get(id).unwrap().pgdir;
            let frame = k.frames.alloc(&mut k.phys, true).unwrap();
            let Kernel { phys, frames, rmap, .. } = k;
            page_table::insert(
                phys,
                frames,
                rmap,
                dir,
                frame,
                VirtAddr::new(0x2000),
                PteFlags::PRESENT | PteFlags::USER | PteFlags::WRITABLE,
                None,
            )
            .unwrap();
        }
        m.user_write_u32(id, VirtAddr::new(0x2004), 77).unwrap();
        assert_eq!(m.user_read_u32(id, VirtAddr::new(0x2004)), Ok(77));

        // the MMU left accessed+dirty behind
        let (_, pte) = m.user_pte(id, VirtAddr::new(0x2000));
        assert!(pte_flags(pte).contains(PteFlags::ACCESSED | PteFlags::DIRTY));
        m.check_invariants();
    }

    #[test]
    fn write_to_readonly_is_a_protection_fault() {
        let m = Machine::new(MachineConfig { npages: 32, nenv: 8 });
        let id = m.env_create(EnvType::User).unwrap();
        {
            let mut k = m.kernel();
            let k = &mut *k;
            let dir = k.envs.get(id).unwrap().pgdir;
            let frame = k.frames.alloc(&mut k.phys, true).unwrap();
            let Kernel { phys, frames, rmap, .. } = k;
            page_table::insert(
                phys,
                frames,
                rmap,
                dir,
                frame,
                VirtAddr::new(0x3000),
                PteFlags::PRESENT | PteFlags::USER,
                None,
            )
            .unwrap();
        }
        assert_eq!(
            m.user_write_u32(id, VirtAddr::new(0x3000), 1),
            Err(UserAccess::Fault { err: FEC_WR | FEC_PR })
        );
    }

    #[test]
    fn destroyed_env_is_gone_to_guest_access() {
        let m = Machine::new(MachineConfig { npages: 32, nenv: 8 });
        let id = m.env_create(EnvType::User).unwrap();
        m.with_kernel(|k| {
            k.env_destroy(id);
        });
        assert_eq!(m.user_read_u32(id, VirtAddr::new(0x0)), Err(UserAccess::Gone));
        m.with_kernel(|k| k.env_free(id));
        assert!(m.env_snapshot(id).is_none());
        m.check_invariants();
    }
}
