//! System-call surface
//!
//! Calls are a typed enum with per-kind argument structures; the hardware
//! trap path would unpack registers into these before dispatching, so no
//! arity ever has to be guessed from a register image.

use crate::env::{EnvId, EnvStatus, EnvType, Trapframe, FL_IF};
use crate::error::{KernelError, Result};
use crate::machine::{Kernel, Machine};
use crate::mm::{
    page_table, PteFlags, VirtAddr, HARD_MIN_FREE_PAGES, PGSIZE, SOFT_MIN_FREE_PAGES, UTOP,
};

/// One system call, arguments and all
#[derive(Debug, Clone, Copy)]
pub enum Syscall {
    /// Print `len` bytes at `va` on the console
    Cputs { va: VirtAddr, len: u32 },
    /// Non-blocking console read
    Cgetc,
    GetEnvId,
    EnvDestroy { env: EnvId },
    Yield,
    /// Fork a blank child: same register frame, return value 0
    Exofork,
    EnvSetStatus { env: EnvId, runnable: bool },
    EnvSetTrapframe { env: EnvId, tf: Trapframe },
    EnvSetPgfaultUpcall { env: EnvId, upcall: u32 },
    PageAlloc { env: EnvId, va: VirtAddr, perm: u32 },
    PageMap {
        src_env: EnvId,
        src_va: VirtAddr,
        dst_env: EnvId,
        dst_va: VirtAddr,
        perm: u32,
    },
    PageUnmap { env: EnvId, va: VirtAddr },
    IpcSend {
        env: EnvId,
        value: u32,
        src_va: Option<VirtAddr>,
        perm: u32,
    },
    IpcRecv { dst_va: Option<VirtAddr> },
    IpcTryRecv { dst_va: Option<VirtAddr> },
}

/// How a system call came back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallReturn {
    /// Finished; 0/id on success, negative errno on failure
    Value(i32),
    /// The caller suspended; its return value will appear in its saved
    /// register frame once it is runnable again
    Blocked,
    /// The caller is descheduled; retry once runnable
    NotScheduled,
    /// The calling environment no longer exists
    Exited,
}

/// Validate user-supplied permission bits: PRESENT and USER are
/// mandatory, nothing outside the syscall mask may be set
pub(crate) fn check_syscall_perm(perm: u32) -> Result<PteFlags> {
    let required = PteFlags::PRESENT | PteFlags::USER;
    if perm & !PteFlags::SYSCALL.bits() != 0 {
        return Err(KernelError::Inval);
    }
    let flags = PteFlags::from_bits_truncate(perm);
    if !flags.contains(required) {
        return Err(KernelError::Inval);
    }
    Ok(flags)
}

fn ret(r: Result<u32>) -> SyscallReturn {
    match r {
        Ok(v) => SyscallReturn::Value(v as i32),
        Err(e) => SyscallReturn::Value(e.to_errno()),
    }
}

impl Machine {
    /// Kernel entry from user mode: dispatch one system call for `caller`
    pub fn syscall(&self, caller: EnvId, call: Syscall) -> SyscallReturn {
        let mut k = self.kernel();

        // garbage-collect a zombie caller on kernel entry
        let status = match k.envs.get(caller) {
            None => return SyscallReturn::Value(KernelError::BadEnv.to_errno()),
            Some(e) => e.status,
        };
        match status {
            EnvStatus::Dying => {
                k.env_free(caller);
                return SyscallReturn::Exited;
            }
            EnvStatus::NotRunnable => {
                drop(k);
                self.yield_now();
                return SyscallReturn::NotScheduled;
            }
            EnvStatus::Runnable => {}
        }

        match call {
            Syscall::Cputs { va, len } => ret(k.sys_cputs(caller, va, len)),
            Syscall::Cgetc => ret(k.sys_cgetc()),
            Syscall::GetEnvId => SyscallReturn::Value(caller.as_u32() as i32),
            Syscall::EnvDestroy { env } => match k.sys_env_destroy(caller, env) {
                Ok(destroyed_self) => {
                    if destroyed_self {
                        SyscallReturn::Exited
                    } else {
                        SyscallReturn::Value(0)
                    }
                }
                Err(e) => SyscallReturn::Value(e.to_errno()),
            },
            Syscall::Yield => {
                drop(k);
                self.yield_now();
                SyscallReturn::Value(0)
            }
            Syscall::Exofork => ret(k.sys_exofork(caller)),
            Syscall::EnvSetStatus { env, runnable } => ret(k.sys_env_set_status(caller, env, runnable)),
            Syscall::EnvSetTrapframe { env, tf } => ret(k.sys_env_set_trapframe(caller, env, tf)),
            Syscall::EnvSetPgfaultUpcall { env, upcall } => {
                ret(k.sys_env_set_pgfault_upcall(caller, env, upcall))
            }
            Syscall::PageAlloc { env, va, perm } => ret(k.sys_page_alloc(caller, env, va, perm)),
            Syscall::PageMap {
                src_env,
                src_va,
                dst_env,
                dst_va,
                perm,
            } => ret(k.sys_page_map(caller, src_env, src_va, dst_env, dst_va, perm)),
            Syscall::PageUnmap { env, va } => ret(k.sys_page_unmap(caller, env, va)),
            Syscall::IpcSend {
                env,
                value,
                src_va,
                perm,
            } => match k.ipc_send(caller, env, value, src_va, perm) {
                Ok(true) => {
                    drop(k);
                    self.yield_now();
                    SyscallReturn::Blocked
                }
                Ok(false) => SyscallReturn::Value(0),
                Err(e) => SyscallReturn::Value(e.to_errno()),
            },
            Syscall::IpcRecv { dst_va } => match k.ipc_recv(caller, dst_va, true) {
                Ok(true) => {
                    drop(k);
                    self.yield_now();
                    SyscallReturn::Blocked
                }
                Ok(false) => SyscallReturn::Value(0),
                Err(e) => SyscallReturn::Value(e.to_errno()),
            },
            Syscall::IpcTryRecv { dst_va } => match k.ipc_recv(caller, dst_va, false) {
                Ok(_) => SyscallReturn::Value(0),
                Err(e) => SyscallReturn::Value(e.to_errno()),
            },
        }
    }
}

impl Kernel {
    fn sys_cputs(&mut self, caller: EnvId, va: VirtAddr, len: u32) -> Result<u32> {
        let dir = self.envs.get(caller).ok_or(KernelError::BadEnv)?.pgdir;
        page_table::user_mem_check(&self.phys, dir, va, len as usize, PteFlags::USER)?;
        let mut addr = va.as_usize();
        let end = addr + len as usize;
        while addr < end {
            let page_va = VirtAddr::new(addr as u32).page_base();
            let (frame, _) = self
                .translate(dir, page_va, false)
                .map_err(|_| KernelError::Inval)?;
            let start = addr & (PGSIZE - 1);
            let stop = (end - page_va.as_usize()).min(PGSIZE);
            let bytes = &self.phys.frame(frame)[start..stop];
            self.console_out.extend_from_slice(bytes);
            addr = page_va.as_usize() + PGSIZE;
        }
        Ok(0)
    }

    fn sys_cgetc(&mut self) -> Result<u32> {
        Ok(self.console_in.pop_front().map(u32::from).unwrap_or(0))
    }

    /// Returns whether the caller destroyed itself
    fn sys_env_destroy(&mut self, caller: EnvId, env: EnvId) -> Result<bool> {
        let target = self.envs.resolve(caller, env, true)?;
        if target == caller {
            log::info!("[{:08x}] exiting gracefully", caller.as_u32());
            self.env_free(caller);
            Ok(true)
        } else {
            log::info!("[{:08x}] destroying {:08x}", caller.as_u32(), target.as_u32());
            self.env_destroy(target);
            Ok(false)
        }
    }

    fn sys_exofork(&mut self, caller: EnvId) -> Result<u32> {
        let parent_tf = self.envs.get(caller).ok_or(KernelError::BadEnv)?.tf;
        let dir = page_table::create_dir(&mut self.phys, &mut self.frames)?;
        let child = match self.envs.alloc(caller, EnvType::User, dir) {
            Ok(id) => id,
            Err(e) => {
                let Kernel { phys, frames, rmap, .. } = self;
                page_table::destroy_dir(phys, frames, rmap, dir);
                return Err(e);
            }
        };
        let c = self.envs.get_mut(child).unwrap();
        c.status = EnvStatus::NotRunnable;
        c.tf = parent_tf;
        c.tf.regs.eax = 0;
        Ok(child.as_u32())
    }

    fn sys_env_set_status(&mut self, caller: EnvId, env: EnvId, runnable: bool) -> Result<u32> {
        let target = self.envs.resolve(caller, env, true)?;
        let e = self.envs.get_mut(target).unwrap();
        if e.status == EnvStatus::Dying {
            return Err(KernelError::BadEnv);
        }
        e.status = if runnable {
            EnvStatus::Runnable
        } else {
            EnvStatus::NotRunnable
        };
        Ok(0)
    }

    fn sys_env_set_trapframe(&mut self, caller: EnvId, env: EnvId, tf: Trapframe) -> Result<u32> {
        let target = self.envs.resolve(caller, env, true)?;
        let e = self.envs.get_mut(target).unwrap();
        e.tf = tf;
        // user environments always run at CPL 3 with interrupts enabled
        e.tf.cs |= 3;
        e.tf.eflags |= FL_IF;
        Ok(0)
    }

    fn sys_env_set_pgfault_upcall(&mut self, caller: EnvId, env: EnvId, upcall: u32) -> Result<u32> {
        let target = self.envs.resolve(caller, env, true)?;
        self.envs.get_mut(target).unwrap().pgfault_upcall = upcall;
        Ok(0)
    }

    pub(crate) fn sys_page_alloc(
        &mut self,
        caller: EnvId,
        env: EnvId,
        va: VirtAddr,
        perm: u32,
    ) -> Result<u32> {
        let target = self.envs.resolve(caller, env, true)?;
        if va.as_u32() >= UTOP || !va.is_page_aligned() {
            return Err(KernelError::Inval);
        }
        let perm = check_syscall_perm(perm)?;

        // fair allocation under memory pressure: an environment over its
        // share is refused before the free list actually empties
        let free = self.frames.num_free();
        let (dir, mut charge) = {
            let e = self.envs.get(target).unwrap();
            (e.pgdir, e.pages_charged)
        };
        if free < SOFT_MIN_FREE_PAGES && charge as usize > self.fair_share() {
            return Err(KernelError::NoMem);
        }
        if free < HARD_MIN_FREE_PAGES {
            return Err(KernelError::NoMem);
        }

        let frame = self
            .frames
            .alloc(&mut self.phys, true)
            .ok_or(KernelError::NoMem)?;
        let insert_res = {
            let Kernel { phys, frames, rmap, .. } = self;
            page_table::insert(phys, frames, rmap, dir, frame, va, perm, Some(&mut charge))
        };
        match insert_res {
            Ok(()) => {
                self.envs.get_mut(target).unwrap().pages_charged = charge;
                Ok(0)
            }
            Err(_) => {
                self.frames.free(frame);
                Err(KernelError::NoMem)
            }
        }
    }

    pub(crate) fn sys_page_map(
        &mut self,
        caller: EnvId,
        src_env: EnvId,
        src_va: VirtAddr,
        dst_env: EnvId,
        dst_va: VirtAddr,
        perm: u32,
    ) -> Result<u32> {
        let src = self.envs.resolve(caller, src_env, true)?;
        let dst = self.envs.resolve(caller, dst_env, true)?;
        if src_va.as_u32() >= UTOP
            || !src_va.is_page_aligned()
            || dst_va.as_u32() >= UTOP
            || !dst_va.is_page_aligned()
        {
            return Err(KernelError::Inval);
        }
        let perm = check_syscall_perm(perm)?;

        let src_dir = self.envs.get(src).unwrap().pgdir;
        let (dst_dir, mut charge) = {
            let e = self.envs.get(dst).unwrap();
            (e.pgdir, e.pages_charged)
        };
        let Some((frame, slot)) = page_table::lookup(&self.phys, src_dir, src_va) else {
            return Err(KernelError::Inval);
        };
        if perm.contains(PteFlags::WRITABLE)
            && slot.load(&self.phys) & PteFlags::WRITABLE.bits() == 0
        {
            return Err(KernelError::Inval);
        }

        let insert_res = {
            let Kernel { phys, frames, rmap, .. } = self;
            page_table::insert(phys, frames, rmap, dst_dir, frame, dst_va, perm, Some(&mut charge))
        };
        insert_res.map_err(|_| KernelError::NoMem)?;
        self.envs.get_mut(dst).unwrap().pages_charged = charge;
        Ok(0)
    }

    pub(crate) fn sys_page_unmap(&mut self, caller: EnvId, env: EnvId, va: VirtAddr) -> Result<u32> {
        let target = self.envs.resolve(caller, env, true)?;
        if va.as_u32() >= UTOP || !va.is_page_aligned() {
            return Err(KernelError::Inval);
        }
        let (dir, mut charge) = {
            let e = self.envs.get(target).unwrap();
            (e.pgdir, e.pages_charged)
        };
        {
            let Kernel { phys, frames, rmap, .. } = self;
            page_table::remove(phys, frames, rmap, dir, va, Some(&mut charge));
        }
        self.envs.get_mut(target).unwrap().pages_charged = charge;
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineConfig;
    use crate::mm::PGSIZE;

    const UPW: u32 = 0x7;

    fn machine() -> (Machine, EnvId) {
        let m = Machine::new(MachineConfig { npages: 128, nenv: 8 });
        let id = m.env_create(EnvType::User).unwrap();
        (m, id)
    }

    fn value(r: SyscallReturn) -> i32 {
        match r {
            SyscallReturn::Value(v) => v,
            other => panic!("expected a value, got {other:?}"),
        }
    }

    #[test]
    fn perm_validation() {
        assert!(check_syscall_perm(0x5).is_ok());
        assert!(check_syscall_perm(0x7).is_ok());
        assert!(check_syscall_perm(0xE07).is_ok());
        // missing USER
        assert_eq!(check_syscall_perm(0x3), Err(KernelError::Inval));
        // missing PRESENT
        assert_eq!(check_syscall_perm(0x6), Err(KernelError::Inval));
        // accessed bit smuggled in
        assert_eq!(check_syscall_perm(0x27), Err(KernelError::Inval));
        // dirty bit smuggled in
        assert_eq!(check_syscall_perm(0x47), Err(KernelError::Inval));
    }

    #[test]
    fn page_alloc_boundaries() {
        let (m, id) = machine();
        let top_page = VirtAddr::new(UTOP - PGSIZE as u32);
        assert_eq!(
            value(m.syscall(id, Syscall::PageAlloc { env: EnvId::NULL, va: top_page, perm: UPW })),
            0,
            "mapping at UTOP-PGSIZE is permitted"
        );
        assert_eq!(
            value(m.syscall(id, Syscall::PageAlloc { env: EnvId::NULL, va: VirtAddr::new(UTOP), perm: UPW })),
            KernelError::Inval.to_errno()
        );
        assert_eq!(
            value(m.syscall(id, Syscall::PageAlloc { env: EnvId::NULL, va: VirtAddr::new(0x1004), perm: UPW })),
            KernelError::Inval.to_errno()
        );
        m.check_invariants();
    }

    #[test]
    fn page_alloc_zeroes_and_charges() {
        let (m, id) = machine();
        let va = VirtAddr::new(0x40_0000);
        assert_eq!(value(m.syscall(id, Syscall::PageAlloc { env: EnvId::NULL, va, perm: UPW })), 0);
        assert_eq!(m.user_read_u32(id, va), Ok(0));
        assert_eq!(m.env_snapshot(id).unwrap().pages_charged, 1);

        // overwriting the same va keeps the charge at one
        assert_eq!(value(m.syscall(id, Syscall::PageAlloc { env: EnvId::NULL, va, perm: UPW })), 0);
        assert_eq!(m.env_snapshot(id).unwrap().pages_charged, 1);
    }

    #[test]
    fn page_map_respects_write_protection() {
        let (m, id) = machine();
        let child = {
            let r = m.syscall(id, Syscall::Exofork);
            EnvId(value(r) as u32)
        };
        let src = VirtAddr::new(0x40_0000);
        assert_eq!(value(m.syscall(id, Syscall::PageAlloc { env: EnvId::NULL, va: src, perm: 0x5 })), 0);
        assert_eq!(
            value(m.syscall(
                id,
                Syscall::PageMap { src_env: EnvId::NULL, src_va: src, dst_env: child, dst_va: src, perm: UPW }
            )),
            KernelError::Inval.to_errno()
        );
        assert_eq!(
            value(m.syscall(
                id,
                Syscall::PageMap { src_env: EnvId::NULL, src_va: src, dst_env: child, dst_va: src, perm: 0x5 }
            )),
            0
        );
        m.check_invariants();
    }

    #[test]
    fn unmap_is_silent_on_absent_mapping() {
        let (m, id) = machine();
        assert_eq!(
            value(m.syscall(id, Syscall::PageUnmap { env: EnvId::NULL, va: VirtAddr::new(0x40_0000) })),
            0
        );
    }

    #[test]
    fn exofork_copies_registers_and_zeroes_eax() {
        let (m, id) = machine();
        m.with_kernel(|k| k.envs.get_mut(id).unwrap().tf.regs.ebx = 0x5555);
        let child = EnvId(value(m.syscall(id, Syscall::Exofork)) as u32);
        let view = m.env_snapshot(child).unwrap();
        assert_eq!(view.status, EnvStatus::NotRunnable);
        assert_eq!(view.eax, 0);
        assert_eq!(view.parent, id);
        let tf = m.env_trapframe(child).unwrap();
        assert_eq!(tf.regs.ebx, 0x5555);
    }

    #[test]
    fn fairness_cap_kicks_in_under_pressure() {
        // 64 frames, two live envs: fair share is 32 pages each once free
        // memory dips under the soft threshold (which 64 frames always is)
        let m = Machine::new(MachineConfig { npages: 64, nenv: 8 });
        let a = m.env_create(EnvType::User).unwrap();
        let _b = m.env_create(EnvType::User).unwrap();

        let mut allocated = 0;
        for i in 0..64u32 {
            let va = VirtAddr::new(0x40_0000 + i * PGSIZE as u32);
            let r = value(m.syscall(a, Syscall::PageAlloc { env: EnvId::NULL, va, perm: UPW }));
            if r == 0 {
                allocated += 1;
            } else {
                assert_eq!(r, KernelError::NoMem.to_errno());
                break;
            }
        }
        assert!(allocated > 0);
        assert!(
            allocated <= 33,
            "environment exceeded its fair share: {allocated} pages"
        );
    }

    #[test]
    fn cputs_appends_to_console() {
        let (m, id) = machine();
        let va = VirtAddr::new(0x40_0000);
        assert_eq!(value(m.syscall(id, Syscall::PageAlloc { env: EnvId::NULL, va, perm: UPW })), 0);
        m.user_write_u32(id, va, u32::from_le_bytes(*b"ping")).unwrap();
        assert_eq!(value(m.syscall(id, Syscall::Cputs { va, len: 4 })), 0);
        assert_eq!(m.console_output(), "ping");

        m.feed_console_input(b"x");
        assert_eq!(value(m.syscall(id, Syscall::Cgetc)), i32::from(b'x'));
        assert_eq!(value(m.syscall(id, Syscall::Cgetc)), 0);
    }

    #[test]
    fn set_trapframe_forces_user_mode_bits() {
        let (m, id) = machine();
        let child = EnvId(value(m.syscall(id, Syscall::Exofork)) as u32);
        let mut tf = crate::env::Trapframe::default();
        tf.cs = 8; // kernel code segment, must not survive
        tf.eflags = 0;
        tf.regs.ecx = 0x77;
        assert_eq!(value(m.syscall(id, Syscall::EnvSetTrapframe { env: child, tf })), 0);
        let got = m.env_trapframe(child).unwrap();
        assert_eq!(got.cs & 3, 3);
        assert!(got.eflags & crate::env::FL_IF != 0);
        assert_eq!(got.regs.ecx, 0x77);
    }

    #[test]
    fn destroy_self_reports_exited() {
        let (m, id) = machine();
        assert_eq!(
            m.syscall(id, Syscall::EnvDestroy { env: EnvId::NULL }),
            SyscallReturn::Exited
        );
        assert!(m.env_snapshot(id).is_none());
        assert_eq!(
            m.syscall(id, Syscall::GetEnvId),
            SyscallReturn::Value(KernelError::BadEnv.to_errno())
        );
    }

    #[test]
    fn destroy_other_defers_collection() {
        let (m, id) = machine();
        let child = EnvId(value(m.syscall(id, Syscall::Exofork)) as u32);
        assert_eq!(value(m.syscall(id, Syscall::EnvDestroy { env: child })), 0);
        assert_eq!(m.env_snapshot(child).unwrap().status, EnvStatus::Dying);
        // the child's next kernel entry collects it
        assert_eq!(m.syscall(child, Syscall::GetEnvId), SyscallReturn::Exited);
        assert!(m.env_snapshot(child).is_none());
        m.check_invariants();
    }
}
