//! User-mode runtime
//!
//! Everything an environment's program links against: guest memory access
//! through its own page tables (with the full fault-upcall path on a
//! miss), thin system-call wrappers, and the paging library layered on
//! top in the submodules.

pub mod fork;
pub mod ipc;
pub mod malloc;
pub mod mapdir;
pub mod paging;
pub mod pgfault;

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::env::{EnvId, EnvStatus};
use crate::machine::{EnvView, Machine, UserAccess};
use crate::mm::{PteFlags, VirtAddr, UMAPDIR, UTEXT};
use crate::syscall::{Syscall, SyscallReturn};
use crate::trap::{FaultDisposition, UTrapframe};

/// A C-style fault handler: returns true when it handled the fault
pub type PgfaultHandler = fn(&mut UserEnv, &UTrapframe) -> bool;

/// The runtime state of one environment's program
pub struct UserEnv {
    machine: Arc<Machine>,
    id: EnvId,
    pub(crate) handlers: Vec<PgfaultHandler>,
    pub(crate) upcall_set: bool,
    pub(crate) mapdir_ready: bool,
    pub(crate) paging_env: Option<EnvId>,
    pub(crate) malloc_cursor: u32,
    pub(crate) chooser_cursor: u32,
    pub(crate) page_choice: paging::PageChoiceFn,
    exited: bool,
}

impl UserEnv {
    /// Bind a runtime to an environment. A forked child arrives with its
    /// paging metadata already in memory; re-register the handlers it
    /// relies on.
    pub fn attach(machine: Arc<Machine>, id: EnvId) -> Self {
        let upcall_set = machine
            .env_snapshot(id)
            .map(|v| v.pgfault_upcall != 0)
            .unwrap_or(false);
        let mut env = Self {
            machine,
            id,
            handlers: Vec::new(),
            upcall_set,
            mapdir_ready: false,
            paging_env: None,
            malloc_cursor: UTEXT,
            chooser_cursor: 0,
            page_choice: paging::age_page_choice,
            exited: false,
        };
        let (pde, pte) = env.machine.user_pte(id, VirtAddr::new(UMAPDIR));
        if pde & PteFlags::PRESENT.bits() != 0 && pte & PteFlags::PRESENT.bits() != 0 {
            env.mapdir_ready = true;
            pgfault::add_pgfault_handler(&mut env, paging::paging_pgfault_handler);
            pgfault::add_pgfault_handler(&mut env, fork::cow_pgfault_handler);
            paging::find_paging_env(&mut env);
        }
        env
    }

    pub fn id(&self) -> EnvId {
        self.id
    }

    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    pub fn has_exited(&self) -> bool {
        self.exited
    }

    /// Snapshot of this environment's own record
    pub fn snapshot(&self) -> EnvView {
        self.machine
            .env_snapshot(self.id)
            .unwrap_or_else(|| panic!("[{:08x}] environment destroyed", self.id.as_u32()))
    }

    /// Issue one system call, stalling while descheduled and collecting
    /// deferred return values from the saved register frame
    pub fn syscall(&mut self, call: Syscall) -> i32 {
        assert!(!self.exited, "system call from an exited environment");
        loop {
            match self.machine.syscall(self.id, call) {
                SyscallReturn::Value(v) => return v,
                SyscallReturn::NotScheduled => continue,
                SyscallReturn::Exited => {
                    self.exited = true;
                    return 0;
                }
                SyscallReturn::Blocked => loop {
                    match self.machine.env_snapshot(self.id) {
                        None => panic!("[{:08x}] destroyed while blocked", self.id.as_u32()),
                        Some(v) if v.status == EnvStatus::Runnable => return v.eax as i32,
                        Some(v) if v.status == EnvStatus::Dying => {
                            // our next kernel entry collects us
                            let _ = self.machine.syscall(self.id, Syscall::Yield);
                            self.exited = true;
                            panic!("[{:08x}] destroyed while blocked", self.id.as_u32());
                        }
                        Some(_) => self.machine.yield_now(),
                    }
                },
            }
        }
    }

    // ---- guest memory access -------------------------------------------

    /// Load a u32 from this environment's address space, taking the fault
    /// path on a miss
    pub fn read_u32(&mut self, va: VirtAddr) -> u32 {
        loop {
            match self.machine.user_read_u32(self.id, va) {
                Ok(v) => return v,
                Err(UserAccess::NotRunnable) => self.machine.yield_now(),
                Err(UserAccess::Gone) => {
                    panic!("[{:08x}] environment destroyed", self.id.as_u32())
                }
                Err(UserAccess::Fault { err }) => self.handle_fault(va, err),
            }
        }
    }

    /// Store a u32, taking the fault path on a miss
    pub fn write_u32(&mut self, va: VirtAddr, value: u32) {
        loop {
            match self.machine.user_write_u32(self.id, va, value) {
                Ok(()) => return,
                Err(UserAccess::NotRunnable) => self.machine.yield_now(),
                Err(UserAccess::Gone) => {
                    panic!("[{:08x}] environment destroyed", self.id.as_u32())
                }
                Err(UserAccess::Fault { err }) => self.handle_fault(va, err),
            }
        }
    }

    /// Page-sized memmove inside this address space. Faults on either
    /// side are resolved first, then the copy runs whole.
    pub fn copy_page(&mut self, src: VirtAddr, dst: VirtAddr) {
        let probe = self.read_u32(src);
        self.write_u32(dst, probe);
        self.machine
            .copy_user_page(self.id, src, dst)
            .expect("both pages resolved just above");
    }

    /// This environment's PDE for `va` (the read-only directory window)
    pub fn pde(&self, va: VirtAddr) -> u32 {
        self.machine.user_pte(self.id, va).0
    }

    /// This environment's PTE for `va` (the read-only table window)
    pub fn pte(&self, va: VirtAddr) -> u32 {
        self.machine.user_pte(self.id, va).1
    }

    /// Run the registered fault handlers for a fault at `va`
    fn handle_fault(&mut self, va: VirtAddr, err: u32) {
        match self.machine.page_fault(self.id, va, err) {
            FaultDisposition::Destroyed => {
                panic!(
                    "[{:08x}] user fault va {:08x} (no handler installed)",
                    self.id.as_u32(),
                    va.as_u32()
                )
            }
            FaultDisposition::Upcall { utf_va } => {
                let utf = self
                    .machine
                    .read_fault_frame(self.id, utf_va)
                    .expect("fault record vanished");
                // newest handler first
                let handlers = self.handlers.clone();
                for handler in handlers.iter().rev() {
                    if handler(self, &utf) {
                        self.machine.pop_fault_frame(self.id, utf_va);
                        return;
                    }
                }
                panic!(
                    "[{:08x}] user fault va {:08x} ip {:08x}",
                    self.id.as_u32(),
                    utf.fault_va,
                    utf.eip
                );
            }
        }
    }

    // ---- system-call wrappers ------------------------------------------

    pub fn sys_getenvid(&mut self) -> i32 {
        self.syscall(Syscall::GetEnvId)
    }

    pub fn sys_yield(&mut self) {
        let _ = self.syscall(Syscall::Yield);
    }

    pub fn sys_cputs(&mut self, va: VirtAddr, len: u32) -> i32 {
        self.syscall(Syscall::Cputs { va, len })
    }

    pub fn sys_cgetc(&mut self) -> i32 {
        self.syscall(Syscall::Cgetc)
    }

    pub fn sys_env_destroy(&mut self, env: EnvId) -> i32 {
        let own = env.is_null() || env == self.id;
        let r = self.syscall(Syscall::EnvDestroy { env });
        if own && r == 0 {
            self.exited = true;
        }
        r
    }

    pub fn sys_exofork(&mut self) -> i32 {
        self.syscall(Syscall::Exofork)
    }

    pub fn sys_env_set_status(&mut self, env: EnvId, runnable: bool) -> i32 {
        self.syscall(Syscall::EnvSetStatus { env, runnable })
    }

    pub fn sys_env_set_pgfault_upcall(&mut self, env: EnvId, upcall: u32) -> i32 {
        self.syscall(Syscall::EnvSetPgfaultUpcall { env, upcall })
    }

    pub fn sys_page_alloc(&mut self, env: EnvId, va: VirtAddr, perm: u32) -> i32 {
        self.syscall(Syscall::PageAlloc { env, va, perm })
    }

    pub fn sys_page_map(
        &mut self,
        src_env: EnvId,
        src_va: VirtAddr,
        dst_env: EnvId,
        dst_va: VirtAddr,
        perm: u32,
    ) -> i32 {
        self.syscall(Syscall::PageMap {
            src_env,
            src_va,
            dst_env,
            dst_va,
            perm,
        })
    }

    pub fn sys_page_unmap(&mut self, env: EnvId, va: VirtAddr) -> i32 {
        self.syscall(Syscall::PageUnmap { env, va })
    }
}
