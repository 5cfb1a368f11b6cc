//! User-level page-fault handler registration
//!
//! Handlers stack up and are dispatched newest-first; the first one to
//! return true ends the fault. Registering the first handler allocates
//! the exception stack and points the kernel at the upcall entry.

use super::UserEnv;
use crate::env::EnvId;
use crate::mm::{PteFlags, VirtAddr, PGSIZE, UXSTACKTOP};

/// Most fault handlers an environment may register
pub const MAX_PGFAULT_HANDLERS: usize = 8;

/// The upcall entry point the kernel redirects a faulting environment to.
/// In the simulation this is a token address: reaching it means the
/// runtime dispatches the registered handlers.
pub const PGFAULT_UPCALL_ENTRY: u32 = 0x0010_0000;

/// Make sure the kernel can deliver fault upcalls to this environment
pub fn set_pgfault_upcall(env: &mut UserEnv) {
    if env.upcall_set {
        return;
    }
    let xstack = VirtAddr::new(UXSTACKTOP - PGSIZE as u32);
    let perm = (PteFlags::PRESENT | PteFlags::USER | PteFlags::WRITABLE).bits();
    let r = env.sys_page_alloc(EnvId::NULL, xstack, perm);
    if r < 0 {
        panic!("set_pgfault_upcall: cannot allocate the exception stack ({r})");
    }
    let r = env.sys_env_set_pgfault_upcall(EnvId::NULL, PGFAULT_UPCALL_ENTRY);
    if r < 0 {
        panic!("set_pgfault_upcall: {r}");
    }
    env.upcall_set = true;
}

/// Register a fault handler. Registering the same handler twice is a
/// no-op.
pub fn add_pgfault_handler(env: &mut UserEnv, handler: super::PgfaultHandler) {
    if env.handlers.iter().any(|&h| h as usize == handler as usize) {
        return;
    }
    if env.handlers.len() == MAX_PGFAULT_HANDLERS {
        panic!("too many pgfault handlers");
    }
    env.handlers.push(handler);
    set_pgfault_upcall(env);
}
